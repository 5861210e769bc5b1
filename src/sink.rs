//! Output drain: moves the finished multiplex from the output ring to a
//! file or stdout.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

use crate::constants::{SINK_CHUNK_PACKETS, TS_PACKET_SIZE};
use crate::ringbuffer::Consumer;

/// `-` is stdout, anything else a file that is created or truncated.
pub fn open_output(path: &str) -> anyhow::Result<Box<dyn Write + Send>> {
    if path == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(path).with_context(|| format!("cannot create {path}"))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// Wait for `prebuffer` bytes, then copy the ring to `out` in bulk until the
/// scheduler closes it. Returns the number of bytes written.
pub fn drain(mut ring: Consumer, mut out: impl Write, prebuffer: usize) -> anyhow::Result<u64> {
    while ring.bytes_used() < prebuffer && !ring.is_closed() {
        std::thread::sleep(Duration::from_millis(50));
    }
    debug!(queued = ring.bytes_used(), "prebuffer filled");

    let mut buf = vec![0u8; SINK_CHUNK_PACKETS * TS_PACKET_SIZE];
    let mut total = 0u64;
    loop {
        let n = ring.read_chunk(&mut buf);
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("output write failed")?;
        total += n as u64;
    }
    out.flush().context("output flush failed")?;
    info!(bytes = total, packets = total / TS_PACKET_SIZE as u64, "output finished");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuffer::ring_buffer;
    use pretty_assertions::assert_eq;

    #[test]
    fn drains_everything_after_close() {
        let (mut tx, rx) = ring_buffer(1 << 20);
        let data: Vec<u8> = (0..450 * TS_PACKET_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(tx.write(&data), data.len());
        drop(tx);

        let mut out = Vec::new();
        let n = drain(rx, &mut out, 1 << 30).unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn waits_for_the_prebuffer() {
        let (mut tx, rx) = ring_buffer(1 << 16);
        let writer = std::thread::spawn(move || {
            for _ in 0..40 {
                assert_eq!(tx.write(&[0x47; TS_PACKET_SIZE]), TS_PACKET_SIZE);
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let n = drain(rx, Vec::new(), 10 * TS_PACKET_SIZE).unwrap();
        writer.join().unwrap();
        assert_eq!(n as usize, 40 * TS_PACKET_SIZE);
    }
}
