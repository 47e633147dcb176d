//! TLS context construction.
//!
//! One certificate file in PEM form carries both the chain and the private
//! key (`tls_certificate`). The resulting acceptor is used as a stream
//! upgrade primitive on both the control channel (AUTH TLS) and data
//! channels (PROT P).

use crate::error::{Error, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub fn load_acceptor(cert_path: &Path) -> Result<TlsAcceptor> {
    let pem = std::fs::read(cert_path)
        .map_err(|e| Error::Config(format!("unable to read {}: {}", cert_path.display(), e)))?;

    let cert_chain: Vec<Certificate> = certs(&mut pem.as_slice())
        .map_err(|e| Error::Config(format!("bad certificate: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let mut keys = pkcs8_private_keys(&mut pem.as_slice())
        .map_err(|e| Error::Config(format!("bad private key: {}", e)))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut pem.as_slice())
            .map_err(|e| Error::Config(format!("bad private key: {}", e)))?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| Error::Config(format!("no private key in {}", cert_path.display())))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Config(format!("TLS config rejected: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
