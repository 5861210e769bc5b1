//! The output multiplex: its services and the tables announcing them.

use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::Config;
use crate::constants::*;
use crate::modulation::Modulation;
use crate::psi::{build_nit, build_pat, build_sdt, NitService, PatEntry, Section};
use crate::ringbuffer::Consumer;
use crate::service::Service;

/// Multiplex-level tables, each with its own continuity counter.
pub struct MuxTables {
    pub pat:  Section,
    /// (PMT PID, section), one per service
    pub pmts: Vec<(u16, Section)>,
    pub sdt:  Section,
    pub nit:  Section,
    /// (AIT PID, section) of every service carrying a broadcast application
    pub aits: Vec<(u16, Section)>,
}

pub struct Mux {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub network_id:          u16,
    pub bitrate:             u32,
    pub modulation:          Modulation,
    recode_onids:            Vec<u16>,
    pub services:            Vec<Service>,
}

impl Mux {
    /// `inputs` are the read halves of the service rings, in configuration order.
    pub fn new(cfg: &Config, inputs: Vec<Consumer>) -> anyhow::Result<Self> {
        if inputs.len() != cfg.services.len() {
            anyhow::bail!("{} inputs for {} services", inputs.len(), cfg.services.len());
        }
        let services = cfg.services
            .iter()
            .zip(inputs)
            .enumerate()
            .map(|(i, (s, input))| Service::new(i, s, input))
            .collect();

        Ok(Self {
            transport_stream_id: cfg.tsid,
            original_network_id: cfg.onid,
            network_id:          cfg.nid,
            bitrate:             cfg.bitrate()?,
            modulation:          cfg.modulation.clone(),
            recode_onids:        cfg.recode_text_onids.clone(),
            services,
        })
    }

    /// Bring every service up to its first PCR.
    ///
    /// Services learn their PSI one after the other while the others keep
    /// buffering; once all of them are live the backlog is thrown away so
    /// every service starts from fresh input.
    pub fn start(&mut self) -> anyhow::Result<()> {
        for s in &mut self.services {
            s.init(self.transport_stream_id, self.original_network_id, &self.recode_onids)?;
        }

        while !self.services.iter().all(Service::has_started) {
            if let Some(s) = self.services.iter().find(|s| s.is_closed() && !s.has_started()) {
                anyhow::bail!("service {} ended before delivering any data", s.index);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        for s in &mut self.services {
            s.discard_backlog();
        }
        for s in &mut self.services {
            s.sync_to_pcr()?;
        }
        info!(services = self.services.len(), bitrate = self.bitrate, "multiplex running");
        Ok(())
    }

    /// Build PAT, PMTs, SDT, NIT and AITs from the initialised services.
    pub fn build_tables(&self) -> anyhow::Result<MuxTables> {
        let programs: Vec<PatEntry> = self.services
            .iter()
            .map(|s| PatEntry { program_number: s.new_service_id, pmt_pid: s.new_pmt_pid })
            .collect();
        let pat = build_pat(self.transport_stream_id, 1, &programs)?;

        let mut pmts = Vec::with_capacity(self.services.len());
        let mut rows = Vec::with_capacity(self.services.len());
        let mut aits = Vec::new();
        for s in &self.services {
            let pmt = s.new_pmt().with_context(|| format!("service {} is not initialised", s.index))?;
            pmts.push((s.new_pmt_pid, pmt.clone()));
            rows.push(s.sdt_row().with_context(|| format!("service {} has no SDT entry", s.index))?);
            if let Some((pid, ait)) = s.ait() {
                aits.push((pid, ait.clone()));
            }
        }
        let sdt = build_sdt(self.transport_stream_id, self.original_network_id, &rows)?;

        let nit_services: Vec<NitService> = self.services
            .iter()
            .map(|s| NitService { service_id: s.new_service_id, service_type: s.service_type, lcn: s.lcn })
            .collect();
        let nit = build_nit(self.network_id, self.transport_stream_id, self.original_network_id,
                            &nit_services, &self.modulation)?;

        for (pid, s) in [(PID_PAT, &pat), (PID_SDT, &sdt), (PID_NIT, &nit)] {
            tracing::debug!(pid, table_id = s.table_id(), bytes = s.len(), "table built");
        }
        Ok(MuxTables { pat, pmts, sdt, nit, aits })
    }
}
