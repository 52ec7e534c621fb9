pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod reactor;
pub mod session;
pub mod stats;
pub mod upload;

#[cfg(test)]
pub mod testing;
