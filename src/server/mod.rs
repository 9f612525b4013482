// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod registration;
mod spawner;
mod udp;

pub mod control;
pub mod handlers;

pub use context::{ServerContext, SessionQueues};
pub use control::ControlLoop;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Replay persistence, build state, bind sockets, set up TLS.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn the control loop and the datagram tasks.
    spawner::spawn_all(&mut server_context)?;

    // 3. Accept connections until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
