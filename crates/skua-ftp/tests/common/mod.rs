//! Shared fixture: a real server on a loopback listener, an in-memory
//! store, and a minimal FTP client.
#![allow(dead_code)]

use skua_core::{User, UserStore};
use skua_db::MemoryStore;
use skua_ftp::{Config, ConfigHandle, Server};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub site: TempDir,
}

impl TestServer {
    /// Boot a daemon on an ephemeral port. `extra` is appended to a test
    /// config that disables the TLS obligations the defaults carry.
    pub async fn start(extra: &str) -> Self {
        let site = TempDir::new().unwrap();
        let text = format!(
            "sitepath {}\ndatapath {}\nport 2121\nvalid_ip 127.0.0.1\n\
             tls_control !*\ntls_listing !*\n{}",
            site.path().display(),
            site.path().display(),
            extra
        );
        let config = Config::parse(&text).unwrap();
        let handle = ConfigHandle::new(config);
        let store = Arc::new(MemoryStore::new());

        let server = Server::new(handle, store.clone(), store.clone()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));

        Self { addr, store, site }
    }

    pub fn add_user(&self, name: &str, password: &str, flags: &str, ratio: i32) -> User {
        let salt = skua_ftp::auth::new_salt();
        let hash = skua_ftp::auth::hash_password(&salt, password);
        self.store.insert_user(User {
            uid: 0,
            name: name.to_string(),
            primary_gid: 1,
            secondary_gids: vec![],
            flags: flags.to_string(),
            default_ratio: ratio,
            section_ratios: HashMap::new(),
            credits_kb: HashMap::new(),
            weekly_allotment_kb: 0,
            home_dir: "/".to_string(),
            expires_at: None,
            tagline: String::new(),
            uploaded_files: 0,
            uploaded_kb: 0,
            downloaded_files: 0,
            downloaded_kb: 0,
            password_salt: salt,
            password_hash: hash,
            requires_tls: false,
            last_login: None,
            created_at: chrono::Utc::now(),
        })
    }

    pub async fn credits(&self, uid: i32, section: &str) -> i64 {
        self.store.credits(uid, section).await.unwrap()
    }
}

pub struct Reply {
    pub code: u16,
    pub text: String,
    pub lines: Vec<String>,
}

pub struct FtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FtpClient {
    /// Connect and consume the greeting.
    pub async fn connect(addr: SocketAddr) -> (Self, Reply) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };
        let greeting = client.read_reply().await;
        (client, greeting)
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Read one full reply, following `NNN-` continuations to the final
    /// `NNN ` line.
    pub async fn read_reply(&mut self) -> Reply {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "server closed mid-reply; got {:?}", lines);
            let line = line.trim_end().to_string();
            let code: u16 = line[..3].parse().expect("three-digit reply code");
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.clone());
            if done {
                return Reply {
                    code,
                    text: line[4.min(line.len())..].to_string(),
                    lines,
                };
            }
        }
    }

    pub async fn cmd(&mut self, line: &str) -> Reply {
        self.send(line).await;
        self.read_reply().await
    }

    /// True when the server has closed the control connection.
    pub async fn closed(&mut self) -> bool {
        let mut buf = String::new();
        self.reader.read_line(&mut buf).await.unwrap_or(0) == 0
    }

    pub async fn login(&mut self, user: &str, password: &str) {
        let reply = self.cmd(&format!("USER {}", user)).await;
        assert_eq!(reply.code, 331);
        let reply = self.cmd(&format!("PASS {}", password)).await;
        assert_eq!(reply.code, 230, "login failed: {}", reply.text);
    }

    /// Issue PASV and dial the advertised address.
    pub async fn pasv(&mut self) -> TcpStream {
        let reply = self.cmd("PASV").await;
        assert_eq!(reply.code, 227, "PASV failed: {}", reply.text);
        let start = reply.text.find('(').unwrap() + 1;
        let end = reply.text.find(')').unwrap();
        let parts: Vec<u16> = reply.text[start..end]
            .split(',')
            .map(|p| p.trim().parse().unwrap())
            .collect();
        let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
        let port = parts[4] * 256 + parts[5];
        TcpStream::connect(format!("{}:{}", ip, port)).await.unwrap()
    }

    /// STOR `path` with `content` over a fresh passive connection.
    pub async fn stor(&mut self, path: &str, content: &[u8]) -> Reply {
        let mut data = self.pasv().await;
        let opening = self.cmd(&format!("STOR {}", path)).await;
        assert_eq!(opening.code, 150, "STOR not opened: {}", opening.text);
        data.write_all(content).await.unwrap();
        data.shutdown().await.unwrap();
        drop(data);
        self.read_reply().await
    }

    /// RETR `path` over a fresh passive connection, returning the bytes.
    pub async fn retr(&mut self, path: &str) -> (Reply, Vec<u8>) {
        let mut data = self.pasv().await;
        let opening = self.cmd(&format!("RETR {}", path)).await;
        assert_eq!(opening.code, 150, "RETR not opened: {}", opening.text);
        let mut content = Vec::new();
        data.read_to_end(&mut content).await.unwrap();
        drop(data);
        (self.read_reply().await, content)
    }
}
