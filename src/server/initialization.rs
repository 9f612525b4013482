// src/server/initialization.rs

//! Handles the complete server initialization process: persistence
//! replay, state setup, TLS, and the dual listening sockets.

use super::context::{ServerContext, SessionQueues};
use super::control::ControlLoop;
use crate::config::Config;
use crate::core::persistence::Freezer;
use crate::core::state::{ServerCore, SharedState};
use anyhow::{Result, anyhow};
use rustls::DigitallySignedStruct;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::info;

const EVENT_QUEUE_DEPTH: usize = 1024;
const AUTH_QUEUE_DEPTH: usize = 64;
const VOICE_QUEUE_DEPTH: usize = 256;
const CONFIG_QUEUE_DEPTH: usize = 64;
const UDP_OUT_QUEUE_DEPTH: usize = 512;

/// Initializes all server components before starting the accept loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    config.validate()?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config)?;

    // Rebuild durable state: snapshot, then the op log, then a fresh log.
    let (freezer, image) = Freezer::open(
        config.snapshot_path(),
        config.log_path(),
        config.persistence.snapshot_ops,
    )
    .await?;

    let shared = Arc::new(SharedState::new(config.clone()));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (auth_tx, auth_rx) = mpsc::channel(AUTH_QUEUE_DEPTH);
    let (voice_tx, voice_rx) = mpsc::channel(VOICE_QUEUE_DEPTH);
    let (cfg_tx, cfg_rx) = mpsc::channel(CONFIG_QUEUE_DEPTH);
    let (udp_tx, udp_rx) = mpsc::channel(UDP_OUT_QUEUE_DEPTH);

    let mut core = ServerCore::new(config.server_id, shared.clone(), udp_tx.clone());
    core.freezer = Some(freezer);
    core.restore(image)?;
    info!(
        "Server state restored: {} channels, {} registered users",
        core.tree.len(),
        shared.users.read().len()
    );

    let control = ControlLoop::new(
        core,
        events_rx,
        auth_rx,
        voice_rx,
        cfg_rx,
        shutdown_tx.subscribe(),
    );

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let udp_socket = Arc::new(UdpSocket::bind((config.host.as_str(), config.port)).await?);
    info!(
        "Timbre listening on {}:{} (stream and datagram)",
        config.host, config.port
    );

    Ok(ServerContext {
        shared,
        listener,
        udp_socket,
        acceptor,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        queues: SessionQueues {
            events_tx,
            auth_tx,
            voice_tx,
        },
        cfg_tx,
        udp_tx,
        control: Some(control),
        udp_rx: Some(udp_rx),
    })
}

/// Builds the TLS acceptor. Client certificates are requested and
/// accepted without chain validation; identity is the certificate digest,
/// which authentication matches against the registry.
fn setup_tls(config: &Config) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.tls.cert_path)?;
    let key = load_key(&config.tls.key_path)?;
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let verifier = Arc::new(AnyClientCert {
        provider: Arc::new(provider),
    });
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file =
        File::open(path).map_err(|e| anyhow!("Failed to open certificate file '{path}': {e}"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{path}'"));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file =
        File::open(path).map_err(|e| anyhow!("Failed to open private key file '{path}': {e}"))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{path}'"))
}

/// Accepts any client certificate: clients identify with self-signed
/// certificates whose digest stands in for a trust chain.
#[derive(Debug)]
struct AnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
