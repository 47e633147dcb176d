//! Control channel: buffered CRLF line reads, three-digit replies, and the
//! in-place TLS upgrade behind AUTH TLS.

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::trace;

/// Commands longer than this are protocol errors.
const MAX_LINE: usize = 4096;

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read_buf(buf).await,
            Stream::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(data).await,
            Stream::Tls(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush().await,
            Stream::Tls(s) => s.flush().await,
        }
    }
}

pub struct ControlChannel {
    stream: Option<Stream>,
    rbuf: BytesMut,
    peer: SocketAddr,
    tls: bool,
}

impl ControlChannel {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            rbuf: BytesMut::with_capacity(1024),
            peer,
            tls: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Next command line, without its CRLF. `None` means the peer closed
    /// the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.rbuf.iter().position(|b| *b == b'\n') {
                let mut line = self.rbuf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                trace!(peer = %self.peer, "<- {}", text);
                return Ok(Some(text));
            }
            if self.rbuf.len() > MAX_LINE {
                // Drop the oversized input so the next read can resync.
                self.rbuf.clear();
                return Err(Error::Protocol("command line too long".into()));
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Protocol("channel mid-upgrade".into()))?;
            let n = stream.read_buf(&mut self.rbuf).await?;
            if n == 0 {
                if !self.rbuf.is_empty() {
                    self.rbuf.advance(self.rbuf.len());
                }
                return Ok(None);
            }
        }
    }

    /// Single-line reply: `NNN text\r\n`.
    pub async fn reply(&mut self, code: u16, text: &str) -> Result<()> {
        self.send(&format!("{} {}\r\n", code, text)).await
    }

    /// Multi-line reply in the `NNN-` continuation form with a final
    /// `NNN ` line.
    pub async fn reply_multi(&mut self, code: u16, lines: &[String], last: &str) -> Result<()> {
        let mut out = String::new();
        for line in lines {
            out.push_str(&format!("{}-{}\r\n", code, line));
        }
        out.push_str(&format!("{} {}\r\n", code, last));
        self.send(&out).await
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        trace!(peer = %self.peer, "-> {}", text.trim_end());
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Protocol("channel mid-upgrade".into()))?;
        stream.write_all(text.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Upgrade the control stream to TLS. The 234 reply must already be on
    /// the wire; anything the client pipelined before the handshake is
    /// discarded.
    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        match self.stream.take() {
            Some(Stream::Plain(plain)) => {
                self.rbuf.clear();
                let tls = acceptor.accept(plain).await?;
                self.stream = Some(Stream::Tls(Box::new(tls)));
                self.tls = true;
                Ok(())
            }
            Some(other) => {
                self.stream = Some(other);
                Err(Error::Protocol("control channel already secure".into()))
            }
            None => Err(Error::Protocol("channel mid-upgrade".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (ControlChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (ControlChannel::new(server, peer), client)
    }

    #[tokio::test]
    async fn reads_crlf_and_bare_lf_lines() {
        let (mut channel, mut client) = pair().await;
        client.write_all(b"USER alice\r\nPASS pw\n").await.unwrap();
        assert_eq!(channel.read_line().await.unwrap().unwrap(), "USER alice");
        assert_eq!(channel.read_line().await.unwrap().unwrap(), "PASS pw");
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let (mut channel, client) = pair().await;
        drop(client);
        assert!(channel.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reply_formats() {
        let (mut channel, mut client) = pair().await;
        channel.reply(220, "ready").await.unwrap();
        channel
            .reply_multi(211, &["FEAT".to_string()], "End")
            .await
            .unwrap();
        drop(channel);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"220 ready\r\n211-FEAT\r\n211 End\r\n");
    }

    #[tokio::test]
    async fn oversized_line_is_protocol_error() {
        let (mut channel, mut client) = pair().await;
        let big = vec![b'a'; MAX_LINE + 10];
        client.write_all(&big).await.unwrap();
        client.flush().await.unwrap();
        assert!(matches!(
            channel.read_line().await,
            Err(Error::Protocol(_))
        ));
    }
}
