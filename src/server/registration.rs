// src/server/registration.rs

//! Public-server registration: a periodic JSON POST to the configured
//! registry. Failures are logged and retried on the next timer tick.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub users: u32,
    pub max_users: u32,
    pub version: String,
}

pub async fn publish(url: String, registration: Registration) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Registration client could not be built: {e}");
            return;
        }
    };
    match client.post(&url).json(&registration).send().await {
        Ok(response) if response.status().is_success() => {
            debug!("Registered {:?} with {url}", registration.name);
        }
        Ok(response) => {
            warn!("Registration with {url} failed: HTTP {}", response.status());
        }
        Err(e) => {
            warn!("Registration with {url} failed: {e}");
        }
    }
}
