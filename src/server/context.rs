// src/server/context.rs

//! The bag of initialized components handed from setup to the spawner
//! and the acceptor loop.

use super::control::ControlLoop;
use crate::core::ServerError;
use crate::core::events::{AuthOutcome, ConfigUpdate, ControlEvent, UdpOut, VoiceEnvelope};
use crate::core::state::SharedState;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// The queue senders every accepted connection gets a clone of.
#[derive(Clone)]
pub struct SessionQueues {
    pub events_tx: mpsc::Sender<ControlEvent>,
    pub auth_tx: mpsc::Sender<AuthOutcome>,
    pub voice_tx: mpsc::Sender<VoiceEnvelope>,
}

pub struct ServerContext {
    pub shared: Arc<SharedState>,
    pub listener: TcpListener,
    pub udp_socket: Arc<UdpSocket>,
    pub acceptor: TlsAcceptor,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), ServerError>>,
    pub queues: SessionQueues,
    /// Feed for the loop's configuration-update queue.
    pub cfg_tx: mpsc::Sender<ConfigUpdate>,
    /// Work for the serialized datagram sender.
    pub udp_tx: mpsc::Sender<UdpOut>,
    /// Consumed by the spawner.
    pub control: Option<ControlLoop>,
    pub udp_rx: Option<mpsc::Receiver<UdpOut>>,
}
