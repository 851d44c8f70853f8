//! TLS/SSL support for VeloxMQ transport channels
//!
//! This module provides the TLS material the acceptor and connector need:
//! certificate loading, a server-side acceptor, and a client-side
//! connector. Negotiated sessions are torn down gracefully by
//! `Connection::close` before the underlying channel is closed.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// TLS-related errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read certificate file: {0}")]
    CertificateRead(#[from] std::io::Error),

    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(#[from] rustls::Error),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no private keys found in key file")]
    NoPrivateKeys,

    #[error("no certificates found in certificate file")]
    NoCertificates,
}

/// Server-side TLS configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TlsServerConfig {
    /// Path to the certificate chain file (PEM format)
    pub cert_path: String,

    /// Path to the private key file (PEM format)
    pub key_path: String,
}

impl TlsServerConfig {
    pub fn new<P: Into<String>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// Client-side TLS configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TlsClientConfig {
    /// Path to the CA certificate file used to verify the broker (PEM format)
    pub ca_cert_path: String,

    /// Server name presented for SNI and certificate verification
    pub server_name: String,
}

impl TlsClientConfig {
    pub fn new<P: Into<String>>(ca_cert_path: P, server_name: P) -> Self {
        Self {
            ca_cert_path: ca_cert_path.into(),
            server_name: server_name.into(),
        }
    }
}

/// TLS acceptor wrapper for inbound connections
pub struct VeloxTlsAcceptor {
    acceptor: TlsAcceptor,
    config: TlsServerConfig,
}

impl VeloxTlsAcceptor {
    /// Create a new TLS acceptor from configuration
    pub fn new(config: TlsServerConfig) -> Result<Self, TlsError> {
        info!(
            "initializing TLS with cert: {}, key: {}",
            config.cert_path, config.key_path
        );

        let certs = load_certs(&config.cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let mut keys = load_private_keys(&config.key_path)?;
        if keys.is_empty() {
            return Err(TlsError::NoPrivateKeys);
        }

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, keys.remove(0))?;

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        info!("TLS acceptor initialized");

        Ok(Self { acceptor, config })
    }

    /// Accept a TLS session on an inbound TCP stream
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> Result<tokio_rustls::server::TlsStream<IO>, TlsError>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match self.acceptor.accept(stream).await {
            Ok(tls_stream) => Ok(tls_stream),
            Err(e) => {
                warn!("TLS handshake failed: {}", e);
                Err(TlsError::HandshakeFailed(e.to_string()))
            }
        }
    }

    /// Get the TLS configuration
    pub fn config(&self) -> &TlsServerConfig {
        &self.config
    }
}

/// TLS connector wrapper for outbound connections
pub struct VeloxTlsConnector {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    config: TlsClientConfig,
}

impl VeloxTlsConnector {
    /// Create a new TLS connector from configuration
    pub fn new(config: TlsClientConfig) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&config.ca_cert_path)? {
            roots.add(cert)?;
        }
        if roots.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(config.server_name.clone()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            config,
        })
    }

    /// Complete a TLS handshake over an established TCP stream
    pub async fn connect<IO>(
        &self,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>, TlsError>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
        {
            Ok(tls_stream) => Ok(tls_stream),
            Err(e) => {
                warn!("TLS handshake failed: {}", e);
                Err(TlsError::HandshakeFailed(e.to_string()))
            }
        }
    }

    /// Get the TLS configuration
    pub fn config(&self) -> &TlsClientConfig {
        &self.config
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let cert_file = File::open(path)?;
    let mut reader = BufReader::new(cert_file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    info!("loaded {} certificates from {}", certs.len(), path);

    Ok(certs)
}

/// Load private keys from a PEM file
fn load_private_keys(path: &str) -> Result<Vec<PrivateKeyDer<'static>>, TlsError> {
    let key_file = File::open(path)?;
    let mut reader = BufReader::new(key_file);

    let keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
        .into_iter()
        .map(|k| k.into())
        .collect();

    if keys.is_empty() {
        // Fall back to RSA keys when no PKCS8 keys are present
        let key_file = File::open(path)?;
        let mut reader = BufReader::new(key_file);

        let rsa_keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
            .into_iter()
            .map(|k| k.into())
            .collect();

        info!("loaded {} RSA private keys from {}", rsa_keys.len(), path);
        Ok(rsa_keys)
    } else {
        info!("loaded {} PKCS8 private keys from {}", keys.len(), path);
        Ok(keys)
    }
}
