use crate::library::{
    config::{DEFAULT_UPLOAD_SIZE, DEFAULT_URL, SpeedTest},
    error::SpeedTestError,
};
use clap::{ArgAction, Parser};
use std::time::Duration;
use tracing::Level;

/// Concurrent HTTP download/upload throughput tester.
#[derive(Parser, Debug, PartialEq, Clone)]
#[command(name = "spdtest", version, about)]
pub struct Args {
    /// Perform a download speed test.
    #[arg(short = 'd', long = "download")]
    pub(crate) download: bool,

    /// Perform an upload speed test.
    #[arg(short = 'u', long = "upload")]
    pub(crate) upload: bool,

    /// Target URL for tests.
    #[arg(short = 'l', long = "url", default_value = DEFAULT_URL)]
    pub(crate) url: String,

    /// Number of concurrent connections (1-10).
    #[arg(short = 'c', long = "connections", default_value_t = 1)]
    pub(crate) connections: usize,

    /// Bytes each upload connection sends.
    #[arg(long = "upload-size", default_value_t = DEFAULT_UPLOAD_SIZE)]
    pub(crate) upload_size: usize,

    /// Per-transfer ceiling for downloads, in seconds.
    #[arg(long = "download-timeout", default_value_t = 60)]
    pub(crate) download_timeout: u64,

    /// Per-transfer ceiling for uploads, in seconds.
    #[arg(long = "upload-timeout", default_value_t = 120)]
    pub(crate) upload_timeout: u64,

    /// Kernel socket buffer hint, in bytes.
    #[arg(long = "socket-buffer")]
    pub(crate) socket_buffer: Option<usize>,

    /// Ignore proxy settings from the environment.
    #[arg(long = "no-proxy")]
    pub(crate) no_proxy: bool,

    /// More logs. Twice for everything.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub(crate) verbose: u8,
}

impl Args {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn to_speed_test(&self) -> Result<SpeedTest, SpeedTestError> {
        SpeedTest::new(&self.url)
            .set_download(self.download)
            .set_upload(self.upload)
            .set_connections(self.connections)
            .set_upload_size(self.upload_size)
            .set_download_timeout(Duration::from_secs(self.download_timeout))
            .set_upload_timeout(Duration::from_secs(self.upload_timeout))
            .set_socket_buffer(self.socket_buffer)
            .set_bypass_proxy(self.no_proxy)
            .build()
    }
}
