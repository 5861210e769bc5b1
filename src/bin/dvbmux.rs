use std::path::PathBuf;

use clap::Parser;
use dvbmux::multiplexer::{Options, run};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version, about = "Multiplex live SPTS inputs into one constant-bitrate DVB-T MPTS")]
struct Opt {
    /// JSON configuration of the multiplex
    #[clap(long, short)]
    config: PathBuf,

    /// Where the multiplex is written, `-` for stdout
    #[clap(long, short, default_value = "-")]
    output: String,

    /// Debug logging (overridden by RUST_LOG)
    #[clap(long, short, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[clap(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let level = match (opt.verbose, opt.quiet) {
        (true, _) => "debug",
        (_, true) => "error",
        _ => "info",
    };
    // stdout may carry the transport stream
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    run(Options {
        config: opt.config,
        output: opt.output,
    })
    .await?;
    Ok(())
}
