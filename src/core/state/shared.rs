// src/core/state/shared.rs

//! The few pieces of state reachable from outside the control loop.
//!
//! Everything else the server owns is mutated only on the loop. The two
//! locked indices here exist because other tasks must consult them
//! synchronously: the datagram receiver resolves packet sources through
//! the host index, and the acceptor screens peers against the ban list.
//! Lock holds must stay brief and never span an await.

use crate::config::Config;
use crate::connection::session::ClientSession;
use crate::core::bans::BanList;
use crate::core::users::UserRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// Maps datagram sources to sessions. A session is listed under its stream
/// IP from finish-authenticate on; the (address, port) binding appears
/// after its first successfully decrypted datagram.
#[derive(Debug, Default)]
pub struct HostIndex {
    by_addr: HashMap<SocketAddr, Arc<ClientSession>>,
    by_ip: HashMap<IpAddr, Vec<Arc<ClientSession>>>,
}

impl HostIndex {
    /// Registers a session under its stream IP.
    pub fn insert_session(&mut self, session: Arc<ClientSession>) {
        self.by_ip
            .entry(session.peer_addr.ip())
            .or_default()
            .push(session);
    }

    /// Binds a datagram (address, port) to a session.
    pub fn bind_addr(&mut self, addr: SocketAddr, session: Arc<ClientSession>) {
        self.by_addr.insert(addr, session);
    }

    pub fn lookup_addr(&self, addr: &SocketAddr) -> Option<Arc<ClientSession>> {
        self.by_addr.get(addr).cloned()
    }

    /// Sessions sharing a source IP, candidates for decrypt-demux.
    pub fn sessions_for_ip(&self, ip: IpAddr) -> Vec<Arc<ClientSession>> {
        self.by_ip.get(&ip).cloned().unwrap_or_default()
    }

    /// Removes every trace of a session. Idempotent.
    pub fn remove_session(&mut self, session: &Arc<ClientSession>) {
        if let Some(list) = self.by_ip.get_mut(&session.peer_addr.ip()) {
            list.retain(|s| !Arc::ptr_eq(s, session));
            if list.is_empty() {
                self.by_ip.remove(&session.peer_addr.ip());
            }
        }
        self.by_addr.retain(|_, s| !Arc::ptr_eq(s, session));
    }
}

/// Handles shared across tasks. The control loop is the only writer of
/// `config`, `users`, and `bans`; other tasks take read leases.
#[derive(Debug)]
pub struct SharedState {
    pub config: RwLock<Config>,
    pub users: RwLock<UserRegistry>,
    pub bans: RwLock<BanList>,
    pub host_index: Mutex<HostIndex>,
    /// Number of sessions in `Ready`, for the probe reply.
    pub user_count: AtomicU32,
}

impl SharedState {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
            users: RwLock::new(UserRegistry::new()),
            bans: RwLock::new(BanList::default()),
            host_index: Mutex::new(HostIndex::default()),
            user_count: AtomicU32::new(0),
        }
    }
}
