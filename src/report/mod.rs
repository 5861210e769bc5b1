//! Periodic JSON status report of the multiplexer

use serde::Serialize;

use crate::stats::StatsManager;

/// Health of one input service
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatus {
    pub index: usize,
    pub service_id: u16,
    pub name: String,
    pub input_bytes_used: usize,
    pub input_capacity: usize,
    pub input_dropped_bytes: u64,
    pub cc_errors: u64,
    pub crc_errors: u64,
    pub sync_losses: u64,
    pub window_drops: u64,
    pub pcr_regressions: u64,
}

/// Output ring occupancy as seen by the scheduler
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OutputStatus {
    pub bytes_used: usize,
    pub capacity: usize,
}

/// JSON structure for output PIDs (internal serialization)
#[derive(Serialize)]
struct PidJson {
    pid: u16,
    packets: u64,
    bitrate_kbps: f64,
}

/// JSON structure for complete report (internal serialization)
#[derive(Serialize)]
struct ReportJson<'a> {
    ts_time: String,
    bitrate: u32,
    output_packets: u64,
    padding_packets: u64,
    dropped_packets: u64,
    capacity_used_pct: f64,
    output_rate_kbps: f64,
    output: OutputStatus,
    services: &'a [ServiceStatus],
    pids: Vec<PidJson>,
}

/// Report generator for the running multiplex
pub struct Reporter;

impl Reporter {
    /// Compact JSON line, suitable for a log record
    pub fn status_json(
        stats: &StatsManager,
        bitrate: u32,
        output: OutputStatus,
        services: &[ServiceStatus],
    ) -> String {
        let pids = stats
            .get_all_pids()
            .into_iter()
            .filter_map(|pid| {
                Some(PidJson {
                    pid,
                    packets: stats.get(pid)?.packets,
                    bitrate_kbps: stats.calculate_bitrate(pid, bitrate)?,
                })
            })
            .collect();

        let rep = ReportJson {
            ts_time: chrono::Utc::now().to_rfc3339(),
            bitrate,
            output_packets: stats.output_packets,
            padding_packets: stats.padding_packets,
            dropped_packets: stats.dropped_packets,
            capacity_used_pct: (stats.capacity_used() * 1000.0).round() / 1000.0,
            output_rate_kbps: stats.output_rate().round(),
            output,
            services,
            pids,
        };
        serde_json::to_string(&rep).unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }
}
