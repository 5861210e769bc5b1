//! Output statistics: packets per output PID and stuffing share

use std::collections::HashMap;
use std::time::Instant;

use crate::constants::{PID_NULL, TS_PACKET_SIZE};

#[derive(Debug, Clone, Copy, Default)]
pub struct PidStats {
    pub packets: u64,
}

/// Counts everything the scheduler emits
pub struct StatsManager {
    pid_stats: HashMap<u16, PidStats>,
    pub output_packets: u64,
    pub padding_packets: u64,
    /// scheduled but lost to a full output ring
    pub dropped_packets: u64,
    start: Instant,
}

impl StatsManager {
    pub fn new() -> Self {
        Self {
            pid_stats: HashMap::new(),
            output_packets: 0,
            padding_packets: 0,
            dropped_packets: 0,
            start: Instant::now(),
        }
    }

    /// Account one emitted packet
    pub fn record(&mut self, pid: u16) {
        self.output_packets += 1;
        if pid == PID_NULL {
            self.padding_packets += 1;
        }
        self.pid_stats.entry(pid).or_default().packets += 1;
    }

    pub fn get(&self, pid: u16) -> Option<&PidStats> {
        self.pid_stats.get(&pid)
    }

    /// Share of the output carrying something other than stuffing, in percent
    pub fn capacity_used(&self) -> f64 {
        if self.output_packets == 0 {
            return 0.0;
        }
        100.0 * (self.output_packets - self.padding_packets) as f64 / self.output_packets as f64
    }

    /// Bitrate of a PID in kbps, as a share of the multiplex bitrate
    pub fn calculate_bitrate(&self, pid: u16, mux_bitrate: u32) -> Option<f64> {
        let stats = self.pid_stats.get(&pid)?;
        if self.output_packets == 0 {
            return None;
        }
        Some(stats.packets as f64 / self.output_packets as f64 * mux_bitrate as f64 / 1000.0)
    }

    /// Wall-clock rate the multiplex is produced at, in kbps
    pub fn output_rate(&self) -> f64 {
        let seconds = self.start.elapsed().as_secs_f64().max(0.1);
        (self.output_packets as f64 * TS_PACKET_SIZE as f64 * 8.0 / 1000.0) / seconds
    }

    /// All output PIDs, ascending
    pub fn get_all_pids(&self) -> Vec<u16> {
        let mut pids: Vec<u16> = self.pid_stats.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

impl Default for StatsManager {
    fn default() -> Self {
        Self::new()
    }
}
