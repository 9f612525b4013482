// src/server/control.rs

//! The server control loop: the single task that owns `ServerCore` and
//! serializes every state-mutating event.
//!
//! Four bounded queues are multiplexed: decoded control messages (and
//! disconnects), authentication completions, voice broadcast requests,
//! and configuration updates. A repeating timer drives public-server
//! re-registration; the snapshot condition is probed after every handled
//! item. Per-session failures panic only the offending session; the loop
//! itself dies only when persistence or the system RNG fails.

use super::registration;
use crate::core::ServerError;
use crate::core::events::{AuthOutcome, ConfigUpdate, ControlEvent, VoiceEnvelope};
use crate::core::state::ServerCore;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

pub struct ControlLoop {
    core: ServerCore,
    events_rx: mpsc::Receiver<ControlEvent>,
    auth_rx: mpsc::Receiver<AuthOutcome>,
    voice_rx: mpsc::Receiver<VoiceEnvelope>,
    cfg_rx: mpsc::Receiver<ConfigUpdate>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlLoop {
    pub fn new(
        core: ServerCore,
        events_rx: mpsc::Receiver<ControlEvent>,
        auth_rx: mpsc::Receiver<AuthOutcome>,
        voice_rx: mpsc::Receiver<VoiceEnvelope>,
        cfg_rx: mpsc::Receiver<ConfigUpdate>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            core,
            events_rx,
            auth_rx,
            voice_rx,
            cfg_rx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), ServerError> {
        // Stagger re-registration across server ids so fleets do not all
        // phone home at once.
        let period = 3600 + (u64::from(self.core.server_id) * 60) % 600;
        let mut timer = tokio::time::interval(Duration::from_secs(period));
        info!("Control loop running (registration period {period}s)");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await?,
                Some(outcome) = self.auth_rx.recv() => {
                    let session = outcome.session.clone();
                    let result = self.core.finish_authenticate(outcome).await;
                    self.absorb(Some(&session), result)?;
                }
                Some(envelope) = self.voice_rx.recv() => self.core.route_voice(envelope),
                Some(update) = self.cfg_rx.recv() => self.core.apply_config_update(update).await?,
                _ = timer.tick() => self.periodic(),
            }
            // A failed snapshot is fatal: running on without durability
            // would silently lose mutations.
            self.core.maybe_snapshot().await?;
        }

        info!("Control loop shutting down; writing final snapshot.");
        self.core.snapshot_now().await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: ControlEvent) -> Result<(), ServerError> {
        match event {
            ControlEvent::Message { session, message } => {
                let result = self.core.dispatch(session.clone(), message).await;
                self.absorb(Some(&session), result)
            }
            ControlEvent::Disconnected { session } => {
                let result = self.core.remove_session(&session).await;
                self.absorb(Some(&session), result)
            }
        }
    }

    /// Fatal errors propagate; anything else panics the offending session
    /// and the loop carries on.
    fn absorb(
        &self,
        session: Option<&std::sync::Arc<crate::connection::session::ClientSession>>,
        result: Result<(), ServerError>,
    ) -> Result<(), ServerError> {
        match result {
            Ok(()) => Ok(()),
            Err(e @ (ServerError::Persistence(_) | ServerError::Rng(_))) => Err(e),
            Err(e) => {
                match session {
                    Some(session) => {
                        error!("Panicking session {}: {}", session.id(), e);
                        session.shutdown();
                    }
                    None => error!("Control loop absorbed error: {e}"),
                }
                Ok(())
            }
        }
    }

    /// Timer tick: kick off public-server re-registration. The snapshot
    /// probe runs right after, like for every other queue item.
    fn periodic(&mut self) {
        let config = self.core.shared.config.read();
        if !config.registration_enabled() {
            return;
        }
        let doc = registration::Registration {
            name: config.register.name.clone(),
            host: if config.register.host.is_empty() {
                config.host.clone()
            } else {
                config.register.host.clone()
            },
            port: config.port,
            users: self.core.shared.user_count.load(Ordering::Acquire),
            max_users: config.max_users,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let url = config.register.url.clone();
        drop(config);
        // Registration must never block the loop on a slow registry.
        tokio::spawn(registration::publish(url, doc));
    }
}
