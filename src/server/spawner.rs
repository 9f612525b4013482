// src/server/spawner.rs

//! Spawns the server's long-running background tasks: the control loop
//! and the two datagram tasks.

use super::context::ServerContext;
use super::udp;
use crate::core::ServerError;
use tracing::info;

pub fn spawn_all(ctx: &mut ServerContext) -> Result<(), ServerError> {
    let control = ctx
        .control
        .take()
        .ok_or_else(|| ServerError::Internal("control loop already spawned".into()))?;
    ctx.background_tasks.spawn(control.run());

    let udp_rx = ctx
        .udp_rx
        .take()
        .ok_or_else(|| ServerError::Internal("datagram sender already spawned".into()))?;
    ctx.background_tasks.spawn({
        let socket = ctx.udp_socket.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        async move {
            udp::run_sender(socket, udp_rx, shutdown_rx).await;
            Ok(())
        }
    });

    ctx.background_tasks.spawn({
        let socket = ctx.udp_socket.clone();
        let shared = ctx.shared.clone();
        let udp_tx = ctx.udp_tx.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        async move {
            udp::run_receiver(socket, shared, udp_tx, shutdown_rx).await;
            Ok(())
        }
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
