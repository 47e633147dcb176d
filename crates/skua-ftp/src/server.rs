//! The daemon's accept loop: one task per control connection.

use crate::audit::AuditEvent;
use crate::config::ConfigHandle;
use crate::data::DataPorts;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::tracker::SessionTracker;
use skua_core::{GroupStore, UserStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything sessions share. Immutable after startup except the config
/// handle, which swaps snapshots on reload.
pub struct SharedState {
    pub config: ConfigHandle,
    pub users: Arc<dyn UserStore>,
    pub groups: Arc<dyn GroupStore>,
    pub tracker: Arc<SessionTracker>,
    pub ports: DataPorts,
    pub tls: Option<TlsAcceptor>,
}

pub struct Server {
    shared: Arc<SharedState>,
}

impl Server {
    pub fn new(
        config: ConfigHandle,
        users: Arc<dyn UserStore>,
        groups: Arc<dyn GroupStore>,
    ) -> Result<Self> {
        let snapshot = config.current();
        let tls = match &snapshot.tls_certificate {
            Some(path) => Some(crate::tls::load_acceptor(path)?),
            None => None,
        };
        Ok(Self {
            shared: Arc::new(SharedState {
                config,
                users,
                groups,
                tracker: Arc::new(SessionTracker::new()),
                ports: DataPorts::new(),
                tls,
            }),
        })
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Bind `valid_ip:port` and serve until the listener fails.
    pub async fn run(self) -> Result<()> {
        let config = self.shared.config.current();
        let bind_ip = config
            .valid_ip
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("valid_ip is empty".into()))?;
        let addr = format!("{}:{}", bind_ip, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "skua listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener. Tests bind their
    /// own ephemeral listener and call this directly.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let session_id = Uuid::new_v4();
                AuditEvent::ConnectionEstablished {
                    session_id,
                    client_ip: peer.ip(),
                    timestamp: chrono::Utc::now(),
                }
                .log();
                shared.tracker.register(session_id, peer.ip());
                let started = std::time::Instant::now();

                let mut session = Session::new(session_id, shared.clone(), stream, peer);
                let username = match session.run().await {
                    Ok(username) => username,
                    Err(e) => {
                        error!(session = %session_id, "session ended with error: {}", e);
                        None
                    }
                };

                shared.tracker.unregister(&session_id);
                AuditEvent::ConnectionClosed {
                    session_id,
                    username,
                    duration_secs: started.elapsed().as_secs() as i64,
                }
                .log();
            });
        }
    }
}
