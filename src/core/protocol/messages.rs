// src/core/protocol/messages.rs

//! Typed control messages and their payload codec.
//!
//! Message kinds follow the Mumble control-channel numbering. Payloads use a
//! deterministic field-ordered binary encoding: strings and byte blobs are
//! u32-length-prefixed, optional fields carry a one-byte presence marker,
//! and repeated fields a u16 element count. Decoders tolerate trailing bytes
//! so that newer peers can append fields.

use crate::core::ServerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod kind {
    pub const VERSION: u16 = 0;
    pub const AUTHENTICATE: u16 = 2;
    pub const PING: u16 = 3;
    pub const REJECT: u16 = 4;
    pub const SERVER_SYNC: u16 = 5;
    pub const CHANNEL_REMOVE: u16 = 6;
    pub const CHANNEL_STATE: u16 = 7;
    pub const USER_REMOVE: u16 = 8;
    pub const USER_STATE: u16 = 9;
    pub const BAN_LIST: u16 = 10;
    pub const TEXT_MESSAGE: u16 = 11;
    pub const PERMISSION_DENIED: u16 = 12;
    pub const ACL: u16 = 13;
    pub const QUERY_USERS: u16 = 14;
    pub const CRYPT_SETUP: u16 = 15;
    pub const USER_LIST: u16 = 18;
    pub const VOICE_TARGET: u16 = 19;
    pub const PERMISSION_QUERY: u16 = 20;
    pub const CODEC_VERSION: u16 = 21;
    pub const USER_STATS: u16 = 22;
    pub const REQUEST_BLOB: u16 = 23;
    pub const SERVER_CONFIG: u16 = 24;
}

// --- Field codec helpers ---

const MAX_STRING_LEN: usize = 4 * 1024 * 1024;
const MAX_LIST_LEN: usize = 4096;

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u32(b.len() as u32);
    dst.extend_from_slice(b);
}

fn get_bytes(src: &mut Bytes) -> Result<Bytes, ServerError> {
    if src.remaining() < 4 {
        return Err(ServerError::IncompleteFrame);
    }
    let len = src.get_u32() as usize;
    if len > MAX_STRING_LEN || src.remaining() < len {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.split_to(len))
}

fn put_string(dst: &mut BytesMut, s: &str) {
    put_bytes(dst, s.as_bytes());
}

fn get_string(src: &mut Bytes) -> Result<String, ServerError> {
    let raw = get_bytes(src)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

fn put_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(u8::from(v));
}

fn get_bool(src: &mut Bytes) -> Result<bool, ServerError> {
    if src.remaining() < 1 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_u8() != 0)
}

fn get_u8(src: &mut Bytes) -> Result<u8, ServerError> {
    if src.remaining() < 1 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16, ServerError> {
    if src.remaining() < 2 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> Result<u32, ServerError> {
    if src.remaining() < 4 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_u32())
}

fn get_i32(src: &mut Bytes) -> Result<i32, ServerError> {
    if src.remaining() < 4 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_i32())
}

fn get_u64(src: &mut Bytes) -> Result<u64, ServerError> {
    if src.remaining() < 8 {
        return Err(ServerError::IncompleteFrame);
    }
    Ok(src.get_u64())
}

fn put_opt<T>(dst: &mut BytesMut, v: &Option<T>, put: impl Fn(&mut BytesMut, &T)) {
    match v {
        Some(inner) => {
            dst.put_u8(1);
            put(dst, inner);
        }
        None => dst.put_u8(0),
    }
}

fn get_opt<T>(
    src: &mut Bytes,
    get: impl Fn(&mut Bytes) -> Result<T, ServerError>,
) -> Result<Option<T>, ServerError> {
    if get_u8(src)? == 0 {
        return Ok(None);
    }
    get(src).map(Some)
}

fn put_opt_u32(dst: &mut BytesMut, v: &Option<u32>) {
    put_opt(dst, v, |d, x| d.put_u32(*x));
}

fn get_opt_u32(src: &mut Bytes) -> Result<Option<u32>, ServerError> {
    get_opt(src, get_u32)
}

fn put_opt_bool(dst: &mut BytesMut, v: &Option<bool>) {
    put_opt(dst, v, |d, x| d.put_u8(u8::from(*x)));
}

fn get_opt_bool(src: &mut Bytes) -> Result<Option<bool>, ServerError> {
    get_opt(src, get_bool)
}

fn put_opt_string(dst: &mut BytesMut, v: &Option<String>) {
    put_opt(dst, v, |d, s| put_string(d, s));
}

fn get_opt_string(src: &mut Bytes) -> Result<Option<String>, ServerError> {
    get_opt(src, get_string)
}

fn put_opt_bytes(dst: &mut BytesMut, v: &Option<Bytes>) {
    put_opt(dst, v, |d, b| put_bytes(d, b));
}

fn get_opt_bytes(src: &mut Bytes) -> Result<Option<Bytes>, ServerError> {
    get_opt(src, get_bytes)
}

fn put_list<T>(dst: &mut BytesMut, items: &[T], put: impl Fn(&mut BytesMut, &T)) {
    dst.put_u16(items.len() as u16);
    for item in items {
        put(dst, item);
    }
}

fn get_list<T>(
    src: &mut Bytes,
    get: impl Fn(&mut Bytes) -> Result<T, ServerError>,
) -> Result<Vec<T>, ServerError> {
    let count = get_u16(src)? as usize;
    if count > MAX_LIST_LEN {
        return Err(ServerError::Protocol(format!(
            "repeated field of {count} elements exceeds the {MAX_LIST_LEN} element limit"
        )));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(get(src)?);
    }
    Ok(items)
}

fn put_u32_list(dst: &mut BytesMut, items: &[u32]) {
    put_list(dst, items, |d, x| d.put_u32(*x));
}

fn get_u32_list(src: &mut Bytes) -> Result<Vec<u32>, ServerError> {
    get_list(src, get_u32)
}

fn put_i32_list(dst: &mut BytesMut, items: &[i32]) {
    put_list(dst, items, |d, x| d.put_i32(*x));
}

fn get_i32_list(src: &mut Bytes) -> Result<Vec<i32>, ServerError> {
    get_list(src, get_i32)
}

fn put_string_list(dst: &mut BytesMut, items: &[String]) {
    put_list(dst, items, |d, s| put_string(d, s));
}

fn get_string_list(src: &mut Bytes) -> Result<Vec<String>, ServerError> {
    get_list(src, get_string)
}

// --- Message structs ---

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Version {
    pub version: u32,
    pub release: String,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authenticate {
    pub username: String,
    pub password: String,
    pub tokens: Vec<String>,
    pub celt_versions: Vec<i32>,
    pub opus: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ping {
    pub timestamp: u64,
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    None = 0,
    WrongVersion = 1,
    InvalidUsername = 2,
    WrongUserPassword = 3,
    WrongServerPassword = 4,
    UsernameInUse = 5,
    ServerFull = 6,
    NoCertificate = 7,
}

impl RejectReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RejectReason::WrongVersion,
            2 => RejectReason::InvalidUsername,
            3 => RejectReason::WrongUserPassword,
            4 => RejectReason::WrongServerPassword,
            5 => RejectReason::UsernameInUse,
            6 => RejectReason::ServerFull,
            7 => RejectReason::NoCertificate,
            _ => RejectReason::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub reason: RejectReason,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSync {
    pub session: u32,
    pub max_bandwidth: u32,
    pub welcome_text: String,
    pub permissions: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelRemove {
    pub channel_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
    /// `None` asks the server to create a channel.
    pub channel_id: Option<u32>,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub links: Vec<u32>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
    pub description: Option<String>,
    pub description_hash: Option<Bytes>,
    pub temporary: Option<bool>,
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRemove {
    pub session: u32,
    pub actor: Option<u32>,
    pub reason: String,
    pub ban: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserState {
    /// `None` in a client-sent message means "myself".
    pub session: Option<u32>,
    pub actor: Option<u32>,
    pub name: Option<String>,
    pub user_id: Option<u32>,
    pub channel_id: Option<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub priority_speaker: Option<bool>,
    pub recording: Option<bool>,
    pub texture: Option<Bytes>,
    pub texture_hash: Option<Bytes>,
    pub comment: Option<String>,
    pub comment_hash: Option<Bytes>,
    pub plugin_context: Option<Bytes>,
    pub plugin_identity: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BanEntry {
    /// Raw address bytes, 4 for IPv4 or 16 for IPv6.
    pub address: Bytes,
    /// Prefix length of the banned network.
    pub mask: u32,
    pub name: String,
    pub hash: String,
    pub reason: String,
    /// RFC 3339 timestamp of when the ban was placed.
    pub start: String,
    /// Seconds the ban lasts; 0 is permanent.
    pub duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BanList {
    pub bans: Vec<BanEntry>,
    pub query: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMessage {
    pub actor: Option<u32>,
    pub sessions: Vec<u32>,
    pub channels: Vec<u32>,
    pub trees: Vec<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DenyKind {
    Text = 0,
    Permission = 1,
    SuperUser = 2,
    ChannelName = 3,
    TextTooLong = 4,
    TemporaryChannel = 6,
    MissingCertificate = 7,
    UserName = 8,
    ChannelFull = 9,
}

impl DenyKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DenyKind::Permission,
            2 => DenyKind::SuperUser,
            3 => DenyKind::ChannelName,
            4 => DenyKind::TextTooLong,
            6 => DenyKind::TemporaryChannel,
            7 => DenyKind::MissingCertificate,
            8 => DenyKind::UserName,
            9 => DenyKind::ChannelFull,
            _ => DenyKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDenied {
    pub what: DenyKind,
    pub permission: u64,
    pub channel_id: u32,
    pub session: u32,
    pub reason: String,
    pub name: String,
}

impl Default for PermissionDenied {
    fn default() -> Self {
        Self {
            what: DenyKind::Permission,
            permission: 0,
            channel_id: 0,
            session: 0,
            reason: String::new(),
            name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub name: String,
    pub inherited: bool,
    pub inherit: bool,
    pub inheritable: bool,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
    pub inherited_members: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AclSpec {
    pub apply_here: bool,
    pub apply_subs: bool,
    pub inherited: bool,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: u64,
    pub deny: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AclMessage {
    pub channel_id: u32,
    pub inherit_acls: bool,
    pub groups: Vec<GroupSpec>,
    pub acls: Vec<AclSpec>,
    pub query: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryUsers {
    pub ids: Vec<u32>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptSetup {
    pub key: Bytes,
    pub client_nonce: Bytes,
    pub server_nonce: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserListEntry {
    pub user_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserList {
    pub users: Vec<UserListEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceTargetSpec {
    pub sessions: Vec<u32>,
    pub channel_id: Option<u32>,
    pub group: Option<String>,
    pub links: bool,
    pub children: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceTarget {
    pub id: u32,
    pub targets: Vec<VoiceTargetSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionQuery {
    pub channel_id: u32,
    pub permissions: u64,
    pub flush: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecVersion {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CryptStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStats {
    pub session: u32,
    pub stats_only: bool,
    pub from_client: CryptStats,
    pub from_server: CryptStats,
    pub online_secs: u32,
    pub idle_secs: u32,
    pub address: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBlob {
    pub session_texture: Vec<u32>,
    pub session_comment: Vec<u32>,
    pub channel_description: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    pub max_bandwidth: u32,
    pub welcome_text: String,
    pub allow_html: bool,
    pub message_length: u32,
    pub image_message_length: u32,
    pub max_users: u32,
}

/// A tagged variant over the finite message-kind set. Unknown kinds decode
/// to `Unknown` and are dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Version(Version),
    Authenticate(Authenticate),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    BanList(BanList),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    Acl(AclMessage),
    QueryUsers(QueryUsers),
    CryptSetup(CryptSetup),
    UserList(UserList),
    VoiceTarget(VoiceTarget),
    PermissionQuery(PermissionQuery),
    CodecVersion(CodecVersion),
    UserStats(UserStats),
    RequestBlob(RequestBlob),
    ServerConfig(ServerConfig),
    Unknown(u16),
}

impl ControlMessage {
    pub fn kind(&self) -> u16 {
        match self {
            ControlMessage::Version(_) => kind::VERSION,
            ControlMessage::Authenticate(_) => kind::AUTHENTICATE,
            ControlMessage::Ping(_) => kind::PING,
            ControlMessage::Reject(_) => kind::REJECT,
            ControlMessage::ServerSync(_) => kind::SERVER_SYNC,
            ControlMessage::ChannelRemove(_) => kind::CHANNEL_REMOVE,
            ControlMessage::ChannelState(_) => kind::CHANNEL_STATE,
            ControlMessage::UserRemove(_) => kind::USER_REMOVE,
            ControlMessage::UserState(_) => kind::USER_STATE,
            ControlMessage::BanList(_) => kind::BAN_LIST,
            ControlMessage::TextMessage(_) => kind::TEXT_MESSAGE,
            ControlMessage::PermissionDenied(_) => kind::PERMISSION_DENIED,
            ControlMessage::Acl(_) => kind::ACL,
            ControlMessage::QueryUsers(_) => kind::QUERY_USERS,
            ControlMessage::CryptSetup(_) => kind::CRYPT_SETUP,
            ControlMessage::UserList(_) => kind::USER_LIST,
            ControlMessage::VoiceTarget(_) => kind::VOICE_TARGET,
            ControlMessage::PermissionQuery(_) => kind::PERMISSION_QUERY,
            ControlMessage::CodecVersion(_) => kind::CODEC_VERSION,
            ControlMessage::UserStats(_) => kind::USER_STATS,
            ControlMessage::RequestBlob(_) => kind::REQUEST_BLOB,
            ControlMessage::ServerConfig(_) => kind::SERVER_CONFIG,
            ControlMessage::Unknown(k) => *k,
        }
    }

    /// Human-readable kind name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Version(_) => "Version",
            ControlMessage::Authenticate(_) => "Authenticate",
            ControlMessage::Ping(_) => "Ping",
            ControlMessage::Reject(_) => "Reject",
            ControlMessage::ServerSync(_) => "ServerSync",
            ControlMessage::ChannelRemove(_) => "ChannelRemove",
            ControlMessage::ChannelState(_) => "ChannelState",
            ControlMessage::UserRemove(_) => "UserRemove",
            ControlMessage::UserState(_) => "UserState",
            ControlMessage::BanList(_) => "BanList",
            ControlMessage::TextMessage(_) => "TextMessage",
            ControlMessage::PermissionDenied(_) => "PermissionDenied",
            ControlMessage::Acl(_) => "Acl",
            ControlMessage::QueryUsers(_) => "QueryUsers",
            ControlMessage::CryptSetup(_) => "CryptSetup",
            ControlMessage::UserList(_) => "UserList",
            ControlMessage::VoiceTarget(_) => "VoiceTarget",
            ControlMessage::PermissionQuery(_) => "PermissionQuery",
            ControlMessage::CodecVersion(_) => "CodecVersion",
            ControlMessage::UserStats(_) => "UserStats",
            ControlMessage::RequestBlob(_) => "RequestBlob",
            ControlMessage::ServerConfig(_) => "ServerConfig",
            ControlMessage::Unknown(_) => "Unknown",
        }
    }

    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            ControlMessage::Version(m) => {
                dst.put_u32(m.version);
                put_string(dst, &m.release);
                put_string(dst, &m.os);
                put_string(dst, &m.os_version);
            }
            ControlMessage::Authenticate(m) => {
                put_string(dst, &m.username);
                put_string(dst, &m.password);
                put_string_list(dst, &m.tokens);
                put_i32_list(dst, &m.celt_versions);
                put_bool(dst, m.opus);
            }
            ControlMessage::Ping(m) => {
                dst.put_u64(m.timestamp);
                dst.put_u32(m.good);
                dst.put_u32(m.late);
                dst.put_u32(m.lost);
                dst.put_u32(m.resync);
            }
            ControlMessage::Reject(m) => {
                dst.put_u8(m.reason as u8);
                put_string(dst, &m.description);
            }
            ControlMessage::ServerSync(m) => {
                dst.put_u32(m.session);
                dst.put_u32(m.max_bandwidth);
                put_string(dst, &m.welcome_text);
                dst.put_u64(m.permissions);
            }
            ControlMessage::ChannelRemove(m) => {
                dst.put_u32(m.channel_id);
            }
            ControlMessage::ChannelState(m) => {
                put_opt_u32(dst, &m.channel_id);
                put_opt_u32(dst, &m.parent);
                put_opt_string(dst, &m.name);
                put_u32_list(dst, &m.links);
                put_u32_list(dst, &m.links_add);
                put_u32_list(dst, &m.links_remove);
                put_opt_string(dst, &m.description);
                put_opt_bytes(dst, &m.description_hash);
                put_opt_bool(dst, &m.temporary);
                put_opt(dst, &m.position, |d, x| d.put_i32(*x));
            }
            ControlMessage::UserRemove(m) => {
                dst.put_u32(m.session);
                put_opt_u32(dst, &m.actor);
                put_string(dst, &m.reason);
                put_bool(dst, m.ban);
            }
            ControlMessage::UserState(m) => {
                put_opt_u32(dst, &m.session);
                put_opt_u32(dst, &m.actor);
                put_opt_string(dst, &m.name);
                put_opt_u32(dst, &m.user_id);
                put_opt_u32(dst, &m.channel_id);
                put_opt_bool(dst, &m.mute);
                put_opt_bool(dst, &m.deaf);
                put_opt_bool(dst, &m.suppress);
                put_opt_bool(dst, &m.self_mute);
                put_opt_bool(dst, &m.self_deaf);
                put_opt_bool(dst, &m.priority_speaker);
                put_opt_bool(dst, &m.recording);
                put_opt_bytes(dst, &m.texture);
                put_opt_bytes(dst, &m.texture_hash);
                put_opt_string(dst, &m.comment);
                put_opt_bytes(dst, &m.comment_hash);
                put_opt_bytes(dst, &m.plugin_context);
                put_opt_string(dst, &m.plugin_identity);
                put_opt_string(dst, &m.hash);
            }
            ControlMessage::BanList(m) => {
                put_list(dst, &m.bans, |d, b| {
                    put_bytes(d, &b.address);
                    d.put_u32(b.mask);
                    put_string(d, &b.name);
                    put_string(d, &b.hash);
                    put_string(d, &b.reason);
                    put_string(d, &b.start);
                    d.put_u32(b.duration);
                });
                put_bool(dst, m.query);
            }
            ControlMessage::TextMessage(m) => {
                put_opt_u32(dst, &m.actor);
                put_u32_list(dst, &m.sessions);
                put_u32_list(dst, &m.channels);
                put_u32_list(dst, &m.trees);
                put_string(dst, &m.message);
            }
            ControlMessage::PermissionDenied(m) => {
                dst.put_u8(m.what as u8);
                dst.put_u64(m.permission);
                dst.put_u32(m.channel_id);
                dst.put_u32(m.session);
                put_string(dst, &m.reason);
                put_string(dst, &m.name);
            }
            ControlMessage::Acl(m) => {
                dst.put_u32(m.channel_id);
                put_bool(dst, m.inherit_acls);
                put_list(dst, &m.groups, |d, g| {
                    put_string(d, &g.name);
                    put_bool(d, g.inherited);
                    put_bool(d, g.inherit);
                    put_bool(d, g.inheritable);
                    put_u32_list(d, &g.add);
                    put_u32_list(d, &g.remove);
                    put_u32_list(d, &g.inherited_members);
                });
                put_list(dst, &m.acls, |d, a| {
                    put_bool(d, a.apply_here);
                    put_bool(d, a.apply_subs);
                    put_bool(d, a.inherited);
                    put_opt_u32(d, &a.user_id);
                    put_opt_string(d, &a.group);
                    d.put_u64(a.grant);
                    d.put_u64(a.deny);
                });
                put_bool(dst, m.query);
            }
            ControlMessage::QueryUsers(m) => {
                put_u32_list(dst, &m.ids);
                put_string_list(dst, &m.names);
            }
            ControlMessage::CryptSetup(m) => {
                put_bytes(dst, &m.key);
                put_bytes(dst, &m.client_nonce);
                put_bytes(dst, &m.server_nonce);
            }
            ControlMessage::UserList(m) => {
                put_list(dst, &m.users, |d, u| {
                    d.put_u32(u.user_id);
                    put_string(d, &u.name);
                });
            }
            ControlMessage::VoiceTarget(m) => {
                dst.put_u32(m.id);
                put_list(dst, &m.targets, |d, t| {
                    put_u32_list(d, &t.sessions);
                    put_opt_u32(d, &t.channel_id);
                    put_opt_string(d, &t.group);
                    put_bool(d, t.links);
                    put_bool(d, t.children);
                });
            }
            ControlMessage::PermissionQuery(m) => {
                dst.put_u32(m.channel_id);
                dst.put_u64(m.permissions);
                put_bool(dst, m.flush);
            }
            ControlMessage::CodecVersion(m) => {
                dst.put_i32(m.alpha);
                dst.put_i32(m.beta);
                put_bool(dst, m.prefer_alpha);
                put_bool(dst, m.opus);
            }
            ControlMessage::UserStats(m) => {
                dst.put_u32(m.session);
                put_bool(dst, m.stats_only);
                for stats in [&m.from_client, &m.from_server] {
                    dst.put_u32(stats.good);
                    dst.put_u32(stats.late);
                    dst.put_u32(stats.lost);
                    dst.put_u32(stats.resync);
                }
                dst.put_u32(m.online_secs);
                dst.put_u32(m.idle_secs);
                put_bytes(dst, &m.address);
            }
            ControlMessage::RequestBlob(m) => {
                put_u32_list(dst, &m.session_texture);
                put_u32_list(dst, &m.session_comment);
                put_u32_list(dst, &m.channel_description);
            }
            ControlMessage::ServerConfig(m) => {
                dst.put_u32(m.max_bandwidth);
                put_string(dst, &m.welcome_text);
                put_bool(dst, m.allow_html);
                dst.put_u32(m.message_length);
                dst.put_u32(m.image_message_length);
                dst.put_u32(m.max_users);
            }
            ControlMessage::Unknown(_) => {}
        }
    }

    pub fn decode(kind_tag: u16, mut src: Bytes) -> Result<Self, ServerError> {
        let src = &mut src;
        let msg = match kind_tag {
            kind::VERSION => ControlMessage::Version(Version {
                version: get_u32(src)?,
                release: get_string(src)?,
                os: get_string(src)?,
                os_version: get_string(src)?,
            }),
            kind::AUTHENTICATE => ControlMessage::Authenticate(Authenticate {
                username: get_string(src)?,
                password: get_string(src)?,
                tokens: get_string_list(src)?,
                celt_versions: get_i32_list(src)?,
                opus: get_bool(src)?,
            }),
            kind::PING => ControlMessage::Ping(Ping {
                timestamp: get_u64(src)?,
                good: get_u32(src)?,
                late: get_u32(src)?,
                lost: get_u32(src)?,
                resync: get_u32(src)?,
            }),
            kind::REJECT => ControlMessage::Reject(Reject {
                reason: RejectReason::from_u8(get_u8(src)?),
                description: get_string(src)?,
            }),
            kind::SERVER_SYNC => ControlMessage::ServerSync(ServerSync {
                session: get_u32(src)?,
                max_bandwidth: get_u32(src)?,
                welcome_text: get_string(src)?,
                permissions: get_u64(src)?,
            }),
            kind::CHANNEL_REMOVE => ControlMessage::ChannelRemove(ChannelRemove {
                channel_id: get_u32(src)?,
            }),
            kind::CHANNEL_STATE => ControlMessage::ChannelState(ChannelState {
                channel_id: get_opt_u32(src)?,
                parent: get_opt_u32(src)?,
                name: get_opt_string(src)?,
                links: get_u32_list(src)?,
                links_add: get_u32_list(src)?,
                links_remove: get_u32_list(src)?,
                description: get_opt_string(src)?,
                description_hash: get_opt_bytes(src)?,
                temporary: get_opt_bool(src)?,
                position: get_opt(src, get_i32)?,
            }),
            kind::USER_REMOVE => ControlMessage::UserRemove(UserRemove {
                session: get_u32(src)?,
                actor: get_opt_u32(src)?,
                reason: get_string(src)?,
                ban: get_bool(src)?,
            }),
            kind::USER_STATE => ControlMessage::UserState(UserState {
                session: get_opt_u32(src)?,
                actor: get_opt_u32(src)?,
                name: get_opt_string(src)?,
                user_id: get_opt_u32(src)?,
                channel_id: get_opt_u32(src)?,
                mute: get_opt_bool(src)?,
                deaf: get_opt_bool(src)?,
                suppress: get_opt_bool(src)?,
                self_mute: get_opt_bool(src)?,
                self_deaf: get_opt_bool(src)?,
                priority_speaker: get_opt_bool(src)?,
                recording: get_opt_bool(src)?,
                texture: get_opt_bytes(src)?,
                texture_hash: get_opt_bytes(src)?,
                comment: get_opt_string(src)?,
                comment_hash: get_opt_bytes(src)?,
                plugin_context: get_opt_bytes(src)?,
                plugin_identity: get_opt_string(src)?,
                hash: get_opt_string(src)?,
            }),
            kind::BAN_LIST => ControlMessage::BanList(BanList {
                bans: get_list(src, |s| {
                    Ok(BanEntry {
                        address: get_bytes(s)?,
                        mask: get_u32(s)?,
                        name: get_string(s)?,
                        hash: get_string(s)?,
                        reason: get_string(s)?,
                        start: get_string(s)?,
                        duration: get_u32(s)?,
                    })
                })?,
                query: get_bool(src)?,
            }),
            kind::TEXT_MESSAGE => ControlMessage::TextMessage(TextMessage {
                actor: get_opt_u32(src)?,
                sessions: get_u32_list(src)?,
                channels: get_u32_list(src)?,
                trees: get_u32_list(src)?,
                message: get_string(src)?,
            }),
            kind::PERMISSION_DENIED => ControlMessage::PermissionDenied(PermissionDenied {
                what: DenyKind::from_u8(get_u8(src)?),
                permission: get_u64(src)?,
                channel_id: get_u32(src)?,
                session: get_u32(src)?,
                reason: get_string(src)?,
                name: get_string(src)?,
            }),
            kind::ACL => ControlMessage::Acl(AclMessage {
                channel_id: get_u32(src)?,
                inherit_acls: get_bool(src)?,
                groups: get_list(src, |s| {
                    Ok(GroupSpec {
                        name: get_string(s)?,
                        inherited: get_bool(s)?,
                        inherit: get_bool(s)?,
                        inheritable: get_bool(s)?,
                        add: get_u32_list(s)?,
                        remove: get_u32_list(s)?,
                        inherited_members: get_u32_list(s)?,
                    })
                })?,
                acls: get_list(src, |s| {
                    Ok(AclSpec {
                        apply_here: get_bool(s)?,
                        apply_subs: get_bool(s)?,
                        inherited: get_bool(s)?,
                        user_id: get_opt_u32(s)?,
                        group: get_opt_string(s)?,
                        grant: get_u64(s)?,
                        deny: get_u64(s)?,
                    })
                })?,
                query: get_bool(src)?,
            }),
            kind::QUERY_USERS => ControlMessage::QueryUsers(QueryUsers {
                ids: get_u32_list(src)?,
                names: get_string_list(src)?,
            }),
            kind::CRYPT_SETUP => ControlMessage::CryptSetup(CryptSetup {
                key: get_bytes(src)?,
                client_nonce: get_bytes(src)?,
                server_nonce: get_bytes(src)?,
            }),
            kind::USER_LIST => ControlMessage::UserList(UserList {
                users: get_list(src, |s| {
                    Ok(UserListEntry {
                        user_id: get_u32(s)?,
                        name: get_string(s)?,
                    })
                })?,
            }),
            kind::VOICE_TARGET => ControlMessage::VoiceTarget(VoiceTarget {
                id: get_u32(src)?,
                targets: get_list(src, |s| {
                    Ok(VoiceTargetSpec {
                        sessions: get_u32_list(s)?,
                        channel_id: get_opt_u32(s)?,
                        group: get_opt_string(s)?,
                        links: get_bool(s)?,
                        children: get_bool(s)?,
                    })
                })?,
            }),
            kind::PERMISSION_QUERY => ControlMessage::PermissionQuery(PermissionQuery {
                channel_id: get_u32(src)?,
                permissions: get_u64(src)?,
                flush: get_bool(src)?,
            }),
            kind::CODEC_VERSION => ControlMessage::CodecVersion(CodecVersion {
                alpha: get_i32(src)?,
                beta: get_i32(src)?,
                prefer_alpha: get_bool(src)?,
                opus: get_bool(src)?,
            }),
            kind::USER_STATS => {
                let session = get_u32(src)?;
                let stats_only = get_bool(src)?;
                let mut pair = [CryptStats::default(); 2];
                for stats in pair.iter_mut() {
                    stats.good = get_u32(src)?;
                    stats.late = get_u32(src)?;
                    stats.lost = get_u32(src)?;
                    stats.resync = get_u32(src)?;
                }
                ControlMessage::UserStats(UserStats {
                    session,
                    stats_only,
                    from_client: pair[0],
                    from_server: pair[1],
                    online_secs: get_u32(src)?,
                    idle_secs: get_u32(src)?,
                    address: get_bytes(src)?,
                })
            }
            kind::REQUEST_BLOB => ControlMessage::RequestBlob(RequestBlob {
                session_texture: get_u32_list(src)?,
                session_comment: get_u32_list(src)?,
                channel_description: get_u32_list(src)?,
            }),
            kind::SERVER_CONFIG => ControlMessage::ServerConfig(ServerConfig {
                max_bandwidth: get_u32(src)?,
                welcome_text: get_string(src)?,
                allow_html: get_bool(src)?,
                message_length: get_u32(src)?,
                image_message_length: get_u32(src)?,
                max_users: get_u32(src)?,
            }),
            other => ControlMessage::Unknown(other),
        };
        Ok(msg)
    }
}
