//! Byte sources feeding the per-service input rings.
//!
//! Every source runs as its own tokio task and is the only writer of its
//! ring. UDP and HTTP sources cannot be slowed down, so when their ring is
//! full the excess is dropped and counted. File replays wait for space instead.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Url;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::constants::TS_PACKET_SIZE;
use crate::ringbuffer::Producer;

/// Largest datagram we accept; IP/UDP TS usually carries 7 packets.
const DATAGRAM_BYTES: usize = 65_536;
/// File sources are read in blocks of this many packets.
const FILE_CHUNK_PACKETS: usize = 348;
/// Initial size of the HTTP partial-packet buffer, in packets.
const HTTP_CARRY_PACKETS: usize = 64;

/// Where the bytes of one service come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Udp(SocketAddr),
    Http(Url),
    File(PathBuf),
}

impl Source {
    /// Accepts `udp://[@]host:port`, `http(s)://...`, `file://path` and plain paths.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if let Some(addr) = s.strip_prefix("udp://") {
            let addr = addr.strip_prefix('@').unwrap_or(addr);
            let addr: SocketAddr = addr.parse()
                .with_context(|| format!("invalid UDP address in {s:?}"))?;
            return Ok(Source::Udp(addr));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            let url = Url::parse(s).with_context(|| format!("invalid URL {s:?}"))?;
            return Ok(Source::Http(url));
        }
        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                anyhow::bail!("empty path in {s:?}");
            }
            return Ok(Source::File(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = s.split_once("://") {
            anyhow::bail!("unsupported source scheme {scheme:?}");
        }
        if s.is_empty() {
            anyhow::bail!("empty source");
        }
        Ok(Source::File(PathBuf::from(s)))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Udp(addr) => write!(f, "udp://{addr}"),
            Source::Http(url) => write!(f, "{url}"),
            Source::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// Creates and configures a UDP socket for TS packet reception.
/// Handles both unicast and multicast addresses.
pub fn create_udp_socket(addr: &SocketAddr) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(4 * 1024 * 1024)?;
    socket.bind(&(*addr).into())?;

    // Join multicast group if the address is multicast
    if ip.is_multicast() {
        let iface = Ipv4Addr::UNSPECIFIED; // default interface
        socket.join_multicast_v4(&ip, &iface)?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Copy `source` into `ring` until the source ends or the task is aborted.
/// Dropping `ring` on return marks the service input as finished.
pub async fn ingest(service: usize, source: Source, ring: Producer) -> anyhow::Result<()> {
    info!(service, %source, "ingesting");
    match source {
        Source::Udp(addr) => ingest_udp(service, &addr, ring).await,
        Source::Http(url) => ingest_http(service, &url, ring).await,
        Source::File(path) => ingest_file(service, path, ring).await,
    }
}

async fn ingest_udp(service: usize, addr: &SocketAddr, mut ring: Producer) -> anyhow::Result<()> {
    let socket = create_udp_socket(addr).with_context(|| format!("cannot listen on {addr}"))?;
    let sock = UdpSocket::from_std(socket.into())?;

    let mut buf = vec![0u8; DATAGRAM_BYTES];
    let mut overflowing = false;
    loop {
        let n = sock.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }
        // whole datagrams only, so an overflow never splits a packet
        let full = !ring.try_write_all(&buf[..n]);
        if full && !overflowing {
            warn!(service, dropped = ring.dropped(), "input ring full, dropping bytes");
        }
        overflowing = full;
    }
}

async fn ingest_http(service: usize, url: &Url, mut ring: Producer) -> anyhow::Result<()> {
    // encoders sit on the local network, never behind the system proxy
    let client = reqwest::Client::builder().no_proxy().build()?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("cannot fetch {url}"))?;

    let mut stream = response.bytes_stream();
    // chunks split packets anywhere; only whole ones go to the ring
    let mut pending = BytesMut::with_capacity(HTTP_CARRY_PACKETS * TS_PACKET_SIZE);
    let mut overflowing = false;
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading {url}"))?;
        total += chunk.len() as u64;
        pending.extend_from_slice(&chunk);

        let whole = pending.len() - pending.len() % TS_PACKET_SIZE;
        if whole == 0 {
            continue;
        }
        let packets = pending.split_to(whole);
        let full = !ring.try_write_all(&packets);
        if full && !overflowing {
            warn!(service, dropped = ring.dropped(), "input ring full, dropping bytes");
        }
        overflowing = full;
    }
    if !pending.is_empty() {
        debug!(service, bytes = pending.len(), "partial packet at end of stream");
    }
    info!(service, bytes = total, %url, "end of HTTP stream");
    Ok(())
}

async fn ingest_file(service: usize, path: PathBuf, mut ring: Producer) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;

    // a file can wait for the scheduler, so unlike UDP nothing is lost here
    let chunk = (ring.free_space() / 2).clamp(TS_PACKET_SIZE, FILE_CHUNK_PACKETS * TS_PACKET_SIZE);
    let mut buf = vec![0u8; chunk];
    let mut total = 0u64;
    loop {
        while ring.free_space() < buf.len() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ring.write(&buf[..n]);
        total += n as u64;
    }
    info!(service, bytes = total, path = %path.display(), "end of file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuffer::ring_buffer;
    use pretty_assertions::assert_eq;

    #[test]
    fn source_urls() {
        let a: SocketAddr = "239.1.1.1:1234".parse().unwrap();
        assert_eq!(Source::parse("udp://239.1.1.1:1234").unwrap(), Source::Udp(a));
        assert_eq!(Source::parse("udp://@239.1.1.1:1234").unwrap(), Source::Udp(a));
        assert_eq!(Source::parse("file:///srv/a.ts").unwrap(), Source::File("/srv/a.ts".into()));
        assert_eq!(Source::parse("b.ts").unwrap(), Source::File("b.ts".into()));
        assert!(matches!(Source::parse("http://10.0.0.2:8000/live.ts").unwrap(),
                         Source::Http(u) if u.port() == Some(8000) && u.path() == "/live.ts"));
        assert!(matches!(Source::parse("https://cdn.example.org/a.ts").unwrap(), Source::Http(_)));

        assert!(Source::parse("udp://nowhere").is_err());
        assert!(Source::parse("rtsp://example.org/live").is_err());
        assert!(Source::parse("http://").is_err());
        assert!(Source::parse("").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for s in ["udp://10.0.0.1:5000", "http://10.0.0.2:8000/live.ts", "file://x/y.ts"] {
            let src = Source::parse(s).unwrap();
            assert_eq!(Source::parse(&src.to_string()).unwrap(), src);
        }
    }

    #[tokio::test]
    async fn file_is_copied_whole_and_ring_closed() {
        let path = std::env::temp_dir().join(format!("dvbmux-ingest-{}.ts", std::process::id()));
        let data: Vec<u8> = (0..10 * TS_PACKET_SIZE).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (tx, mut rx) = ring_buffer(1 << 20);
        ingest(0, Source::File(path.clone()), tx).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut out = vec![0u8; data.len()];
        assert_eq!(rx.read(&mut out), data.len());
        assert_eq!(out, data);
        assert!(rx.is_finished());
        assert_eq!(rx.dropped(), 0);
    }

    /// Answer one HTTP request with `status` and `body`, then close.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> Url {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                req.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: video/mp2t\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            conn.write_all(head.as_bytes()).await.unwrap();
            // two writes so the packet boundary falls inside a chunk
            let (a, b) = body.split_at(body.len().div_ceil(2));
            conn.write_all(a).await.unwrap();
            conn.flush().await.unwrap();
            conn.write_all(b).await.unwrap();
            conn.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/live.ts")).unwrap()
    }

    #[tokio::test]
    async fn http_stream_is_copied_in_whole_packets() {
        let mut data: Vec<u8> = (0..6 * TS_PACKET_SIZE).map(|i| (i % 251) as u8).collect();
        let packets = data.clone();
        data.extend_from_slice(&[0x47, 1, 2]); // trailing partial packet
        let url = serve_once("200 OK", data).await;

        let (tx, mut rx) = ring_buffer(1 << 20);
        ingest(0, Source::Http(url), tx).await.unwrap();

        let mut out = vec![0u8; packets.len()];
        assert_eq!(rx.read(&mut out), packets.len());
        assert_eq!(out, packets);
        assert_eq!(rx.bytes_used(), 0);
        assert!(rx.is_finished());
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn http_stream_drops_packets_when_the_ring_is_full() {
        let data = vec![0x47u8; 8 * TS_PACKET_SIZE];
        let url = serve_once("200 OK", data).await;

        // room for two packets; nobody reads meanwhile
        let (tx, rx) = ring_buffer(2 * TS_PACKET_SIZE + 1);
        ingest(0, Source::Http(url), tx).await.unwrap();
        assert_eq!(rx.bytes_used() % TS_PACKET_SIZE, 0);
        assert!(rx.bytes_used() <= 2 * TS_PACKET_SIZE);
        assert!(rx.dropped() > 0);
    }

    #[tokio::test]
    async fn http_error_status_fails_ingest() {
        let url = serve_once("404 Not Found", Vec::new()).await;
        let (tx, rx) = ring_buffer(1024);
        let err = ingest(0, Source::Http(url), tx).await.unwrap_err();
        assert!(format!("{err:#}").contains("404"));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (tx, rx) = ring_buffer(1024);
        assert!(ingest(0, Source::File("/nonexistent/dvbmux.ts".into()), tx).await.is_err());
        assert!(rx.is_closed());
    }
}
