// src/core/bans.rs

//! The ban list: CIDR prefixes with optional expiry, matched against peer
//! addresses at accept time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One ban entry. `duration_secs == 0` means permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub address: IpAddr,
    pub prefix_len: u8,
    pub name: String,
    pub cert_digest: String,
    pub reason: String,
    pub start: DateTime<Utc>,
    pub duration_secs: u32,
}

impl Ban {
    /// True while the ban has not expired at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.duration_secs == 0 {
            return true;
        }
        let end = self.start + chrono::Duration::seconds(i64::from(self.duration_secs));
        now < end
    }

    /// True when this ban's prefix covers `ip`. IPv4-mapped IPv6 addresses
    /// are compared in their canonical form.
    pub fn covers(&self, ip: IpAddr) -> bool {
        match (self.address.to_canonical(), ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                let bits = self.prefix_len.min(32);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - u32::from(bits));
                (u32::from(net) & mask) == (u32::from(host) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                let bits = self.prefix_len.min(128);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - u32::from(bits));
                (u128::from(net) & mask) == (u128::from(host) & mask)
            }
            _ => false,
        }
    }
}

/// The mutable ban list. Writes happen on the control loop; the acceptor
/// takes concurrent read leases through the surrounding lock.
#[derive(Debug, Default)]
pub struct BanList {
    bans: Vec<Ban>,
}

impl BanList {
    pub fn new(bans: Vec<Ban>) -> Self {
        Self { bans }
    }

    /// True when any active ban covers `ip`.
    pub fn is_banned(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.bans
            .iter()
            .any(|ban| ban.is_active(now) && ban.covers(ip))
    }

    /// Replaces the whole list, as `BanList` messages do.
    pub fn replace(&mut self, bans: Vec<Ban>) {
        self.bans = bans;
    }

    pub fn push(&mut self, ban: Ban) {
        self.bans.push(ban);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ban> {
        self.bans.iter()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    pub fn snapshot_bans(&self) -> Vec<Ban> {
        self.bans.clone()
    }
}
