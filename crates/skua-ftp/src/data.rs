//! Data-connection management: PORT/PASV negotiation, port-range cycling,
//! FXP policy enforcement, TLS on data, and ASCII translation.

use crate::config::Config;
use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// How long a passive listener waits for the one connection it will accept.
const ACCEPT_WINDOW: Duration = Duration::from_secs(30);
/// Bound on bind retries while cycling a port range.
const MAX_BIND_ATTEMPTS: usize = 16;

/// The session's pending data-channel arrangement. Consumed by `open`.
pub enum DataPlan {
    None,
    Active { peer: SocketAddr, via_eprt: bool },
    Passive {
        listener: TcpListener,
        port: u16,
        via_epsv: bool,
    },
}

impl DataPlan {
    pub fn is_none(&self) -> bool {
        matches!(self, DataPlan::None)
    }
}

/// Shared round-robin cursor over the passive port range.
#[derive(Default)]
pub struct PortCursor(AtomicUsize);

impl PortCursor {
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// An open data connection, possibly TLS-wrapped.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DataStream::Plain(s) => s.read(buf).await,
            DataStream::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            DataStream::Plain(s) => s.write_all(data).await,
            DataStream::Tls(s) => s.write_all(data).await,
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            DataStream::Plain(s) => s.shutdown().await,
            DataStream::Tls(s) => s.shutdown().await,
        }
    }
}

/// Allocate a passive listener from the configured range, cycling through
/// ports and retrying on bind failure a bounded number of times. An empty
/// range falls back to an ephemeral port.
pub async fn open_passive(
    config: &Config,
    cursor: &PortCursor,
    local_ip: IpAddr,
) -> Result<(TcpListener, u16)> {
    if config.pasv_ports.is_empty() {
        let listener = bind_reusable(SocketAddr::new(local_ip, 0))?;
        let port = listener.local_addr()?.port();
        return Ok((listener, port));
    }

    let attempts = config.pasv_ports.len().min(MAX_BIND_ATTEMPTS);
    for _ in 0..attempts {
        let port = match config.pasv_ports.port_at(cursor.next()) {
            Some(p) => p,
            None => break,
        };
        match bind_reusable(SocketAddr::new(local_ip, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                debug!(port, "passive bind failed: {}", e);
            }
        }
    }
    Err(Error::DataChannel("passive port range exhausted".into()))
}

fn bind_reusable(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept the single expected connection on a passive listener. A peer that
/// is not the control peer is an FXP attempt and only passes when policy
/// allows it for this operation.
pub async fn accept_passive(
    listener: TcpListener,
    control_peer: IpAddr,
    fxp_allowed: bool,
    fxp_log: bool,
) -> Result<TcpStream> {
    let (stream, peer) = tokio::time::timeout(ACCEPT_WINDOW, listener.accept())
        .await
        .map_err(|_| Error::DataChannel("accept window elapsed".into()))??;
    if peer.ip() != control_peer {
        if !fxp_allowed {
            return Err(Error::PeerMismatch(peer.ip().to_string()));
        }
        if fxp_log {
            warn!(control = %control_peer, data = %peer.ip(), "FXP data connection");
        }
    }
    Ok(stream)
}

/// Connect out for active mode, binding the local side into the configured
/// active port range when one exists.
pub async fn connect_active(
    config: &Config,
    cursor: &PortCursor,
    local_ip: IpAddr,
    peer: SocketAddr,
) -> Result<TcpStream> {
    let make_socket = || -> Result<TcpSocket> {
        let socket = match peer {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        Ok(socket)
    };

    if !config.active_ports.is_empty() {
        let attempts = config.active_ports.len().min(MAX_BIND_ATTEMPTS);
        for _ in 0..attempts {
            let port = match config.active_ports.port_at(cursor.next()) {
                Some(p) => p,
                None => break,
            };
            let socket = make_socket()?;
            if socket.bind(SocketAddr::new(local_ip, port)).is_err() {
                continue;
            }
            return Ok(socket.connect(peer).await?);
        }
    }
    let socket = make_socket()?;
    socket.bind(SocketAddr::new(local_ip, 0))?;
    Ok(socket.connect(peer).await?)
}

/// Wrap an established data connection in TLS when PROT P was negotiated.
pub async fn maybe_tls(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<DataStream> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            Ok(DataStream::Tls(Box::new(tls)))
        }
        None => Ok(DataStream::Plain(stream)),
    }
}

/// Parse `h1,h2,h3,h4,p1,p2` from PORT.
pub fn parse_port_arg(arg: &str) -> Result<SocketAddr> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(Error::Protocol(format!("bad PORT argument: {}", arg)));
    }
    let mut nums = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        nums[i] = part
            .parse()
            .map_err(|_| Error::Protocol(format!("bad PORT argument: {}", arg)))?;
    }
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parse `|proto|addr|port|` from EPRT (RFC 2428); any delimiter char.
pub fn parse_eprt_arg(arg: &str) -> Result<SocketAddr> {
    let delim = arg
        .chars()
        .next()
        .ok_or_else(|| Error::Protocol("empty EPRT argument".into()))?;
    let fields: Vec<&str> = arg.split(delim).collect();
    // Leading and trailing delimiters produce empty first/last fields.
    if fields.len() != 5 {
        return Err(Error::Protocol(format!("bad EPRT argument: {}", arg)));
    }
    let ip: IpAddr = fields[2]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad EPRT address: {}", fields[2])))?;
    let port: u16 = fields[3]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad EPRT port: {}", fields[3])))?;
    match (fields[1], ip) {
        ("1", IpAddr::V4(_)) | ("2", IpAddr::V6(_)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(Error::Protocol("EPRT protocol/address mismatch".into())),
    }
}

/// `h1,h2,h3,h4,p1,p2` form for the 227 reply.
pub fn format_pasv_addr(ip: IpAddr, port: u16) -> Result<String> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Ok(format!(
                "{},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                port >> 8,
                port & 0xff
            ))
        }
        IpAddr::V6(_) => Err(Error::Protocol(
            "PASV cannot advertise an IPv6 address; use EPSV".into(),
        )),
    }
}

/// ASCII-mode send translation: bare LF becomes CRLF.
pub fn ascii_to_wire(data: &[u8]) -> Vec<u8> {
    ascii_to_wire_cont(data, 0)
}

/// Continuation-aware variant: `prev` is the last byte of the previous
/// chunk, so a CRLF split across chunk boundaries is not doubled.
pub fn ascii_to_wire_cont(data: &[u8], mut prev: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// ASCII-mode receive translation: CR is stripped, leaving canonical LF.
pub fn wire_to_ascii(data: &[u8]) -> Vec<u8> {
    data.iter().copied().filter(|b| *b != b'\r').collect()
}

/// State shared by all sessions for data-port allocation.
pub struct DataPorts {
    pub pasv_cursor: Arc<PortCursor>,
    pub active_cursor: Arc<PortCursor>,
}

impl DataPorts {
    pub fn new() -> Self {
        Self {
            pasv_cursor: Arc::new(PortCursor::default()),
            active_cursor: Arc::new(PortCursor::default()),
        }
    }
}

impl Default for DataPorts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_arg_round_trip() {
        let addr = parse_port_arg("10,0,0,1,19,136").unwrap();
        assert_eq!(addr, "10.0.0.1:5000".parse().unwrap());
        assert_eq!(
            format_pasv_addr(addr.ip(), addr.port()).unwrap(),
            "10,0,0,1,19,136"
        );
    }

    #[test]
    fn port_arg_rejects_garbage() {
        assert!(parse_port_arg("1,2,3").is_err());
        assert!(parse_port_arg("a,b,c,d,e,f").is_err());
        assert!(parse_port_arg("300,0,0,1,0,1").is_err());
    }

    #[test]
    fn eprt_parsing() {
        assert_eq!(
            parse_eprt_arg("|1|10.0.0.1|5000|").unwrap(),
            "10.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_eprt_arg("|2|::1|5000|").unwrap(),
            "[::1]:5000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_eprt_arg("|1|::1|5000|").is_err());
        assert!(parse_eprt_arg("|9|10.0.0.1|5000|").is_err());
        assert!(parse_eprt_arg("").is_err());
    }

    #[test]
    fn ascii_translation() {
        assert_eq!(ascii_to_wire(b"a\nb\n"), b"a\r\nb\r\n");
        // Already-CRLF input is not doubled.
        assert_eq!(ascii_to_wire(b"a\r\nb"), b"a\r\nb");
        assert_eq!(wire_to_ascii(b"a\r\nb\r\n"), b"a\nb\n");
        assert_eq!(wire_to_ascii(b"plain"), b"plain");
    }

    #[tokio::test]
    async fn passive_falls_back_to_ephemeral_without_range() {
        let cfg = Config::parse("sitepath /s\ndatapath /d\nport 21\nvalid_ip 0.0.0.0\n").unwrap();
        let cursor = PortCursor::default();
        let (listener, port) = open_passive(&cfg, &cursor, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn passive_uses_configured_range_round_robin() {
        // Ephemeral-ish high range to avoid collisions.
        let cfg = Config::parse(
            "sitepath /s\ndatapath /d\nport 21\nvalid_ip 0.0.0.0\npasv_ports 42310-42313\n",
        )
        .unwrap();
        let cursor = PortCursor::default();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let (l1, p1) = open_passive(&cfg, &cursor, ip).await.unwrap();
        let (_l2, p2) = open_passive(&cfg, &cursor, ip).await.unwrap();
        assert_ne!(p1, p2);
        assert!((42310..=42313).contains(&p1));
        assert!((42310..=42313).contains(&p2));
        drop(l1);
        // A released port becomes bindable again as the cursor wraps.
        let (_l3, p3) = open_passive(&cfg, &cursor, ip).await.unwrap();
        assert!((42310..=42313).contains(&p3));
    }

    #[tokio::test]
    async fn accept_rejects_foreign_peer_without_fxp() {
        let listener = bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        // Control peer claimed to be elsewhere; local test connection now
        // counts as a mismatch.
        let err = accept_passive(listener, "10.99.99.99".parse().unwrap(), false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerMismatch(_)));
        drop(client);
    }

    #[tokio::test]
    async fn accept_allows_foreign_peer_with_fxp() {
        let listener = bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let stream = accept_passive(listener, "10.99.99.99".parse().unwrap(), true, false).await;
        assert!(stream.is_ok());
    }
}
