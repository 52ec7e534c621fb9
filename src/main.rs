use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod args;
pub mod library;

use args::Args;
use clap::Parser;
use library::{
    config::{Direction, SpeedTest},
    engine::libcurl::CurlEngine,
    error::SpeedTestError,
    reactor::Reactor,
    session::run_phase,
};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::fmt;

fn bootstrap_logs(level: tracing::Level) {
    // Results go to stdout; everything chatty goes to stderr.
    fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_thread_ids(false)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

fn run(test: &SpeedTest) -> Result<(), SpeedTestError> {
    curl::init();
    let mut reactor: Reactor = Reactor::new()?;
    info!(
        "Speedtest starting: {} with {} connection(s)",
        test.get_url(),
        test.get_connections()
    );
    for plan in test.plans() {
        if plan.direction == Direction::Upload {
            warn!(
                "Ensure the URL '{}' is configured to accept uploads for a meaningful test.",
                plan.url
            );
        }
        match run_phase(&mut reactor, CurlEngine::new(), &plan) {
            Ok(report) => println!("\n{report}\n"),
            Err(err) => error!("{err}. Aborting {} test.", plan.direction),
        }
    }
    reactor.shutdown()?;
    info!("Application finished.");
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // --help and --version land here too.
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    bootstrap_logs(args.log_level());
    let outcome: Result<(), SpeedTestError> = args.to_speed_test().and_then(|test| run(&test));
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            if err.is_usage() {
                eprintln!("Try 'spdtest --help' for more information.");
            }
            ExitCode::FAILURE
        }
    }
}
