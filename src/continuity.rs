//! Per-service PID remapping and continuity-counter tracking

use crate::constants::PID_COUNT;
use crate::packet;

/// Dense input PID → output PID table. Zero means "drop".
#[derive(Clone)]
pub struct PidMap {
    map: Box<[u16; PID_COUNT]>,
}

impl PidMap {
    pub fn new() -> Self { Self { map: Box::new([0; PID_COUNT]) } }

    #[inline]
    pub fn get(&self, pid: u16) -> u16 { self.map[(pid & 0x1FFF) as usize] }

    pub fn set(&mut self, pid: u16, new_pid: u16) { self.map[(pid & 0x1FFF) as usize] = new_pid; }

    pub fn is_mapped(&self, pid: u16) -> bool { self.get(pid) != 0 }

    /// (input, output) pairs of every mapped PID, in input order
    pub fn mapped(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.map.iter().enumerate().filter(|(_, n)| **n != 0).map(|(p, n)| (p as u16, *n))
    }

    pub fn clear(&mut self) { self.map.fill(0); }
}

impl Default for PidMap {
    fn default() -> Self { Self::new() }
}

/// Outcome of feeding one packet to the [`ContinuityTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcStatus {
    /// first packet seen on this PID
    Initial,
    Ok,
    /// discontinuity_indicator set, counter re-seeded
    Flagged,
    Discontinuity { expected: u8, found: u8 },
}

const UNSEEN: u8 = 0xFF;

/// Expected continuity counter for every PID
pub struct ContinuityTracker {
    last: Box<[u8; PID_COUNT]>,
    pub errors: u64,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self { last: Box::new([UNSEEN; PID_COUNT]), errors: 0 }
    }

    pub fn reset(&mut self) { self.last.fill(UNSEEN); }

    pub fn check(&mut self, pkt: &[u8]) -> CcStatus {
        let pid = packet::pid(pkt) as usize;
        let found = packet::continuity_counter(pkt);
        let prev = self.last[pid];
        if prev == UNSEEN {
            self.last[pid] = found;
            return CcStatus::Initial;
        }

        let expected = if packet::has_payload(pkt) { (prev + 1) % 16 } else { prev };
        self.last[pid] = found;
        if expected == found {
            CcStatus::Ok
        } else if packet::discontinuity_indicator(pkt) {
            CcStatus::Flagged
        } else {
            self.errors += 1;
            CcStatus::Discontinuity { expected, found }
        }
    }
}

impl Default for ContinuityTracker {
    fn default() -> Self { Self::new() }
}
