//! Constants for MPEG-TS multiplexing and DVB SI table carriage

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_PACKET_BITS: i64 = (TS_PACKET_SIZE * 8) as i64;
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const STUFFING_BYTE: u8 = 0xFF;
pub const PID_COUNT: usize = 8192;

/// PCR constants
pub const PCR_CLOCK_HZ: i128 = 27_000_000; // 27 MHz
pub const PCR_WRAP: u64 = (1u64 << 33) * 300; // PCR wrap-around point

/// Well-known PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_NIT: u16 = 0x0010;
pub const PID_SDT: u16 = 0x0011;
pub const PID_EIT: u16 = 0x0012;
pub const PID_NULL: u16 = 0x1FFF;

/// Table ids
pub const TID_PAT: u8 = 0x00;
pub const TID_PMT: u8 = 0x02;
pub const TID_NIT_ACTUAL: u8 = 0x40;
pub const TID_SDT_ACTUAL: u8 = 0x42;
pub const TID_EIT_PF_ACTUAL: u8 = 0x4E;
pub const TID_AIT: u8 = 0x74;

/// Descriptor tags
pub const DESC_CA: u8 = 0x09;
pub const DESC_SERVICE_LIST: u8 = 0x41;
pub const DESC_SERVICE: u8 = 0x48;
pub const DESC_SHORT_EVENT: u8 = 0x4D;
pub const DESC_EXTENDED_EVENT: u8 = 0x4E;
pub const DESC_TERRESTRIAL_DELIVERY: u8 = 0x5A;
pub const DESC_PRIVATE_DATA_SPECIFIER: u8 = 0x5F;
pub const DESC_APPLICATION_SIGNALLING: u8 = 0x6F;
pub const DESC_LOGICAL_CHANNEL: u8 = 0x83;
pub const DESC_CANAL_PLUS_PRIVATE: u8 = 0xC0;

/// Largest section (header + body + CRC) we reassemble or build
pub const MAX_SECTION_SIZE: usize = 4096;
/// A PAT that fits a single packet never declares more than this
pub const MAX_SINGLE_PACKET_PAT_LEN: usize = 180;

/// Stream types forwarded into the output multiplex
pub const FORWARDED_STREAM_TYPES: &[u8] = &[
    0x01, // MPEG-1 video
    0x02, // MPEG-2 video
    0x80, // DigiCipher II video
    0x03, // MPEG-1 audio
    0x04, // MPEG-2 audio
    0x06, // private PES: AC-3, teletext, subtitles
    0x81, // AC-3 / ATSC private
    0x0F, // AAC ADTS
    0x11, // AAC LATM
    0x1B, // H.264
    0x24, // HEVC
];

/// Stream type used to announce the AIT in a PMT
pub const STREAM_TYPE_AIT: u8 = 0x05;

/// Table repetition intervals (milliseconds)
pub const PAT_INTERVAL_MS: u64 = 200;
pub const PMT_INTERVAL_MS: u64 = 200;
pub const SDT_INTERVAL_MS: u64 = 1000;
pub const NIT_INTERVAL_MS: u64 = 1000;
pub const AIT_INTERVAL_MS: u64 = 500;

/// Output PMT PID of service `i` is `(i + 1) * SERVICE_PID_STRIDE`
pub const SERVICE_PID_STRIDE: u16 = 100;

/// Buffering
pub const DEFAULT_RING_BYTES: usize = 15 * 1024 * 1024;
pub const DEFAULT_PREBUFFER_BYTES: usize = 4 * 1024 * 1024;
/// Packets retained between two PCRs of one service
pub const WINDOW_CAPACITY_PACKETS: usize = 2048;
pub const SINK_CHUNK_PACKETS: usize = 200;
pub const POLL_INTERVAL_US: u64 = 10;

/// Maximum bytes carried from one recoded text field into the next
pub const TEXT_OVERFLOW_MAX: usize = 128;
