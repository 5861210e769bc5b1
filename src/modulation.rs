//! DVB-T modulation parameters.
//!
//! The output bitrate of the multiplex is the payload capacity of the
//! transmitter channel, so everything the scheduler does is derived from
//! these few values.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionMode {
    #[serde(rename = "2K")] Mode2k,
    #[serde(rename = "4K")] Mode4k,
    #[serde(rename = "8K")] Mode8k,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constellation {
    #[serde(rename = "QPSK")]   Qpsk,
    #[serde(rename = "QAM_16")] Qam16,
    #[serde(rename = "QAM_64")] Qam64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardInterval {
    #[serde(rename = "1/4")]  G1_4,
    #[serde(rename = "1/8")]  G1_8,
    #[serde(rename = "1/16")] G1_16,
    #[serde(rename = "1/32")] G1_32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeRate {
    #[serde(rename = "1/2")] R1_2,
    #[serde(rename = "2/3")] R2_3,
    #[serde(rename = "3/4")] R3_4,
    #[serde(rename = "4/5")] R4_5,
    #[serde(rename = "5/6")] R5_6,
    #[serde(rename = "6/7")] R6_7,
    #[serde(rename = "7/8")] R7_8,
    #[serde(rename = "8/9")] R8_9,
}

/// Transmitter parameters, as handed to the modulator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modulation {
    pub frequency_khz:     u32,
    /// Channel bandwidth in kHz (8000 for an 8 MHz channel).
    #[serde(alias = "bandwidth_hz")]
    pub bandwidth_khz:     u32,
    pub transmission_mode: TransmissionMode,
    pub constellation:     Constellation,
    pub guard_interval:    GuardInterval,
    #[serde(alias = "code_rate_HP")]
    pub code_rate_hp:      CodeRate,
}

impl GuardInterval {
    fn factor(self) -> (u64, u64) {
        match self {
            GuardInterval::G1_32 => (32, 33),
            GuardInterval::G1_16 => (16, 17),
            GuardInterval::G1_8  => (8, 9),
            GuardInterval::G1_4  => (4, 5),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            GuardInterval::G1_32 => 0,
            GuardInterval::G1_16 => 1,
            GuardInterval::G1_8  => 2,
            GuardInterval::G1_4  => 3,
        }
    }
}

impl CodeRate {
    fn factor(self) -> Option<(u64, u64)> {
        match self {
            CodeRate::R1_2 => Some((1, 2)),
            CodeRate::R2_3 => Some((2, 3)),
            CodeRate::R3_4 => Some((3, 4)),
            CodeRate::R5_6 => Some((5, 6)),
            CodeRate::R7_8 => Some((7, 8)),
            CodeRate::R4_5 | CodeRate::R6_7 | CodeRate::R8_9 => None,
        }
    }

    /// code_rate field of the terrestrial delivery descriptor
    pub fn code(self) -> anyhow::Result<u8> {
        Ok(match self {
            CodeRate::R1_2 => 0,
            CodeRate::R2_3 => 1,
            CodeRate::R3_4 => 2,
            CodeRate::R5_6 => 3,
            CodeRate::R7_8 => 4,
            other => anyhow::bail!("code rate {other:?} is not valid for DVB-T"),
        })
    }
}

impl Constellation {
    fn bits_per_carrier(self) -> u64 {
        match self {
            Constellation::Qpsk  => 2,
            Constellation::Qam16 => 4,
            Constellation::Qam64 => 6,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Constellation::Qpsk  => 0,
            Constellation::Qam16 => 1,
            Constellation::Qam64 => 2,
        }
    }
}

impl TransmissionMode {
    pub fn code(self) -> u8 {
        match self {
            TransmissionMode::Mode2k => 0,
            TransmissionMode::Mode8k => 1,
            TransmissionMode::Mode4k => 2,
        }
    }
}

impl Modulation {
    /// Useful bitrate of the channel in bits per second.
    pub fn channel_capacity(&self) -> anyhow::Result<u32> {
        let Some((rate_num, rate_den)) = self.code_rate_hp.factor() else {
            anyhow::bail!("unsupported code rate {:?}", self.code_rate_hp);
        };
        if self.bandwidth_khz == 0 {
            anyhow::bail!("bandwidth must not be zero");
        }
        let (guard_num, guard_den) = self.guard_interval.factor();

        let mut cap = self.bandwidth_khz as u64 * 1000;
        cap *= self.constellation.bits_per_carrier();
        cap = cap * guard_num / guard_den;
        cap = cap * rate_num / rate_den;
        // Reed-Solomon (204,188) and the 8/7 sample clock ratio
        let cap = cap / 544 * 423;
        Ok(u32::try_from(cap)?)
    }

    /// bandwidth field of the terrestrial delivery descriptor
    pub fn bandwidth_code(&self) -> anyhow::Result<u8> {
        Ok(match self.bandwidth_khz {
            8000 => 0,
            7000 => 1,
            6000 => 2,
            5000 => 3,
            other => anyhow::bail!("no delivery descriptor code for a {other} kHz channel"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn uk_mux() -> Modulation {
        Modulation {
            frequency_khz:     802_000,
            bandwidth_khz:     8000,
            transmission_mode: TransmissionMode::Mode8k,
            constellation:     Constellation::Qam64,
            guard_interval:    GuardInterval::G1_32,
            code_rate_hp:      CodeRate::R2_3,
        }
    }

    #[test]
    fn capacity_of_common_profiles() {
        // 8 MHz, 64-QAM, 1/32, 2/3
        assert_eq!(uk_mux().channel_capacity().unwrap(), 24_127_920);

        let m = Modulation { guard_interval: GuardInterval::G1_4, ..uk_mux() };
        assert_eq!(m.channel_capacity().unwrap(), 19_905_534);

        let m = Modulation { constellation: Constellation::Qpsk, code_rate_hp: CodeRate::R1_2, ..m };
        assert_eq!(m.channel_capacity().unwrap(), 4_976_172);
    }

    #[test]
    fn unsupported_code_rate_is_fatal() {
        let m = Modulation { code_rate_hp: CodeRate::R4_5, ..uk_mux() };
        assert!(m.channel_capacity().is_err());
        assert!(m.code_rate_hp.code().is_err());
    }

    #[test]
    fn deserializes_driver_names() {
        let m: Modulation = serde_json::from_str(r#"{
            "frequency_khz": 802000, "bandwidth_hz": 8000,
            "transmission_mode": "8K", "constellation": "QAM_64",
            "guard_interval": "1/32", "code_rate_HP": "2/3"
        }"#).unwrap();
        assert_eq!(m, uk_mux());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let r: Result<Constellation, _> = serde_json::from_str(r#""QAM_256""#);
        assert!(r.is_err());
    }
}
