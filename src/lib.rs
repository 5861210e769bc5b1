// src/lib.rs
pub mod multiplexer {
    use std::path::PathBuf;

    pub use crate::core::RunSummary;

    pub struct Options {
        /// JSON configuration of the multiplex
        pub config: PathBuf,
        /// `-` for stdout, otherwise a file path
        pub output: String,
    }

    /// Async entry-point; returns when an input ends or on Ctrl-C
    pub async fn run(opts: Options) -> anyhow::Result<RunSummary> {
        crate::core::run(opts).await
    }
}

pub mod constants;
pub mod ringbuffer;
pub mod packet;
pub mod continuity;
pub mod psi;
pub mod modulation;
pub mod config;
pub mod service;
pub mod mux;
pub mod scheduler;
pub mod stats;
pub mod report;
pub mod network;
pub mod sink;
pub mod core;
