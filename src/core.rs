use std::io::Write;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::mux::Mux;
use crate::network::{self, Source};
use crate::ringbuffer::ring_buffer;
use crate::scheduler::Scheduler;
use crate::sink;

/// What a finished run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub output_packets:  u64,
    pub padding_packets: u64,
    /// lost because the output was not drained fast enough
    pub dropped_packets: u64,
    pub bytes_written:   u64,
}

pub async fn run(opts: crate::multiplexer::Options) -> anyhow::Result<RunSummary> {
    let cfg = Config::from_file(&opts.config)?;
    cfg.validate()?;
    let out = sink::open_output(&opts.output)?;
    run_config(cfg, out).await
}

/// One ingest task per service, the scheduler and the sink on blocking
/// threads. Returns once an input ends, or after Ctrl-C.
pub async fn run_config(cfg: Config, out: Box<dyn Write + Send>) -> anyhow::Result<RunSummary> {
    let bitrate = cfg.bitrate()?;
    info!(bitrate, services = cfg.services.len(), tsid = cfg.tsid, onid = cfg.onid, "starting multiplex");

    let (out_tx, out_rx) = ring_buffer(cfg.output_buffer_bytes);
    let prebuffer = cfg.output_prebuffer_bytes;
    let sink = tokio::task::spawn_blocking(move || sink::drain(out_rx, out, prebuffer));

    let mut ingest = JoinSet::new();
    let mut inputs = Vec::with_capacity(cfg.services.len());
    for (i, s) in cfg.services.iter().enumerate() {
        let source = Source::parse(&s.source)?;
        let (tx, rx) = ring_buffer(cfg.input_buffer_bytes);
        inputs.push(rx);
        ingest.spawn(network::ingest(i, source, tx));
    }

    let mut mux = Mux::new(&cfg, inputs)?;
    let report_every = cfg.report_interval_packets;
    let mut scheduler = tokio::task::spawn_blocking(move || {
        mux.start()?;
        let tables = mux.build_tables()?;
        Scheduler::new(mux.bitrate, mux.services, tables, out_tx, report_every).run()
    });

    let result = loop {
        tokio::select! {
            r = &mut scheduler => break r,
            _ = tokio::signal::ctrl_c() => {
                // closing the inputs lets the scheduler run dry and stop
                info!("interrupted, closing inputs");
                ingest.abort_all();
            }
            Some(r) = ingest.join_next() => match r {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "input failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "input task panicked"),
            },
        }
    };

    ingest.abort_all();
    while ingest.join_next().await.is_some() {}

    let stats = result??;
    let bytes_written = sink.await??;
    let summary = RunSummary {
        output_packets:  stats.output_packets,
        padding_packets: stats.padding_packets,
        dropped_packets: stats.dropped_packets,
        bytes_written,
    };
    info!(?summary, "multiplex stopped");
    Ok(summary)
}
