//! Runtime configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "tsid": 2, "onid": 9018, "nid": 12293, "gain": 0,
//!   "modulation": { "frequency_khz": 802000, "bandwidth_hz": 8000,
//!                   "transmission_mode": "8K", "constellation": "QAM_64",
//!                   "guard_interval": "1/32", "code_rate_HP": "2/3" },
//!   "services": [
//!     { "source": "udp://239.1.1.1:1234", "service_id": 4165, "lcn": 7 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::modulation::Modulation;
use crate::network::Source;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub tsid: u16,
    pub onid: u16,
    pub nid:  u16,
    /// RF gain handed to the modulator, unused when writing to a file
    #[serde(default)]
    pub gain: i32,
    pub modulation: Modulation,
    /// Overrides the bitrate computed from `modulation`
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Originating networks whose text lacks the ISO-8859-1 table marker
    #[serde(default = "default_recode_onids")]
    pub recode_text_onids: Vec<u16>,
    pub services: Vec<ServiceConfig>,

    #[serde(default = "default_ring_bytes")]
    pub input_buffer_bytes: usize,
    #[serde(default = "default_ring_bytes")]
    pub output_buffer_bytes: usize,
    #[serde(default = "default_prebuffer_bytes")]
    pub output_prebuffer_bytes: usize,
    #[serde(default = "default_report_interval")]
    pub report_interval_packets: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// `udp://host:port`, `http(s)://...`, `file:///path` or a plain path
    #[serde(alias = "url")]
    pub source: String,
    /// Service id in the output multiplex
    pub service_id: u16,
    pub lcn: u16,
    #[serde(default)]
    pub hbbtv: Option<HbbtvConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HbbtvConfig {
    pub url: String,
    pub initial_path: String,
    #[serde(default = "default_application_type")]
    pub application_type: u16,
    #[serde(default = "default_ait_version")]
    pub version: u8,
}

fn default_recode_onids() -> Vec<u16> { vec![0x0001, 0x0085] }
fn default_ring_bytes() -> usize { DEFAULT_RING_BYTES }
fn default_prebuffer_bytes() -> usize { DEFAULT_PREBUFFER_BYTES }
fn default_report_interval() -> u64 { 1000 }
fn default_application_type() -> u16 { 0x0010 }
fn default_ait_version() -> u8 { 1 }

/// Output PMT PIDs are spaced `SERVICE_PID_STRIDE` apart below the null PID.
pub const MAX_SERVICES: usize = (PID_NULL / SERVICE_PID_STRIDE) as usize - 1;

impl Config {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Target bitrate of the multiplex in bits per second.
    pub fn bitrate(&self) -> anyhow::Result<u32> {
        match self.bitrate {
            Some(0) => anyhow::bail!("bitrate must not be zero"),
            Some(b) => Ok(b),
            None => self.modulation.channel_capacity(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("no services configured");
        }
        if self.services.len() > MAX_SERVICES {
            anyhow::bail!("{} services configured, at most {MAX_SERVICES} fit the PID plan", self.services.len());
        }

        // the NIT carries these codes even when the bitrate is overridden
        self.modulation.channel_capacity()?;
        self.modulation.bandwidth_code()?;
        self.bitrate()?;

        let mut ids = HashSet::new();
        let mut lcns = HashSet::new();
        for (i, s) in self.services.iter().enumerate() {
            Source::parse(&s.source).with_context(|| format!("service {i}"))?;
            if s.service_id == 0 {
                anyhow::bail!("service {i}: service_id 0 is reserved for the NIT");
            }
            if !ids.insert(s.service_id) {
                anyhow::bail!("service {i}: duplicate service_id {}", s.service_id);
            }
            if s.lcn > 0x03FF {
                anyhow::bail!("service {i}: lcn {} does not fit 10 bits", s.lcn);
            }
            if !lcns.insert(s.lcn) {
                anyhow::bail!("service {i}: duplicate lcn {}", s.lcn);
            }
            if let Some(h) = &s.hbbtv {
                if h.version > 0x1F {
                    anyhow::bail!("service {i}: AIT version {} does not fit 5 bits", h.version);
                }
            }
        }

        if self.input_buffer_bytes < 2 * TS_PACKET_SIZE || self.output_buffer_bytes < SINK_CHUNK_PACKETS * TS_PACKET_SIZE {
            anyhow::bail!("ring buffers too small");
        }
        if self.output_prebuffer_bytes >= self.output_buffer_bytes {
            anyhow::bail!("output_prebuffer_bytes must be smaller than output_buffer_bytes");
        }
        if self.report_interval_packets == 0 {
            anyhow::bail!("report_interval_packets must be positive");
        }
        Ok(())
    }
}
