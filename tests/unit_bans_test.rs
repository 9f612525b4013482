use chrono::{Duration, Utc};
use std::net::IpAddr;
use timbre::core::bans::{Ban, BanList};

fn ban(address: &str, prefix_len: u8, duration_secs: u32) -> Ban {
    Ban {
        address: address.parse().unwrap(),
        prefix_len,
        name: String::new(),
        cert_digest: String::new(),
        reason: "test".into(),
        start: Utc::now(),
        duration_secs,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_exact_host_ban() {
    let ban = ban("192.0.2.7", 32, 0);
    assert!(ban.covers(ip("192.0.2.7")));
    assert!(!ban.covers(ip("192.0.2.8")));
}

#[test]
fn test_prefix_ban_covers_the_network() {
    let net = ban("10.1.0.0", 16, 0);
    assert!(net.covers(ip("10.1.200.3")));
    assert!(!net.covers(ip("10.2.0.1")));

    // A zero-length prefix covers everything.
    assert!(ban("0.0.0.0", 0, 0).covers(ip("8.8.8.8")));
}

#[test]
fn test_ipv6_prefix_ban() {
    let ban = ban("2001:db8::", 32, 0);
    assert!(ban.covers(ip("2001:db8::1")));
    assert!(ban.covers(ip("2001:db8:ffff::9")));
    assert!(!ban.covers(ip("2001:db9::1")));
    assert!(!ban.covers(ip("192.0.2.1")));
}

#[test]
fn test_mapped_ipv4_matches_v4_ban() {
    let ban = ban("192.0.2.7", 32, 0);
    assert!(ban.covers(ip("::ffff:192.0.2.7")));
}

#[test]
fn test_expiry() {
    let now = Utc::now();
    let mut timed = ban("192.0.2.7", 32, 60);
    assert!(timed.is_active(now));
    assert!(!timed.is_active(now + Duration::seconds(61)));

    timed.duration_secs = 0;
    assert!(timed.is_active(now + Duration::days(365)));
}

#[test]
fn test_banlist_expired_behaves_like_no_ban() {
    let now = Utc::now();
    let target = ip("192.0.2.7");

    let empty = BanList::default();
    let mut list = BanList::default();
    list.push(ban("192.0.2.7", 32, 60));

    assert!(list.is_banned(target, now));
    let after = now + Duration::seconds(120);
    assert_eq!(list.is_banned(target, after), empty.is_banned(target, after));
}

#[test]
fn test_replace_swaps_the_whole_list() {
    let mut list = BanList::default();
    list.push(ban("192.0.2.7", 32, 0));
    list.replace(vec![ban("198.51.100.0", 24, 0)]);

    let now = Utc::now();
    assert!(!list.is_banned(ip("192.0.2.7"), now));
    assert!(list.is_banned(ip("198.51.100.9"), now));
    assert_eq!(list.len(), 1);
}
