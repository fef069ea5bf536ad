//!
//! Multi-tier tracker handling: an ordered, tiered [`TrackerList`] of
//! announce endpoints, with HTTP(S) and UDP transports. Transports run as
//! spawned tasks and report back through an outcome channel the embedder
//! drains on its main loop, so all list mutation stays single-threaded.
//!

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use undertow_core::hash_id::Id20;

mod http;
mod tracker;
mod tracker_list;
mod udp;

pub use tracker::{Tracker, TrackerKind};
pub use tracker_list::{TrackerList, TrackerListEvents};

pub const DEFAULT_NORMAL_INTERVAL: u32 = 1800;
pub const DEFAULT_MIN_INTERVAL: u32 = 600;

/// Announce events, in wire order: the UDP announce writes the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrackerEvent {
    None = 0,
    Started = 1,
    Stopped = 2,
    Completed = 3,
    Scrape = 4,
}

impl TrackerEvent {
    /// Bit for this event in close/disown selection masks.
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            TrackerEvent::None => "none",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Scrape => "scrape",
        }
    }

    /// Value of the `event` query parameter, absent for a plain update.
    pub const fn query_value(self) -> Option<&'static str> {
        match self {
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Stopped => Some("stopped"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::None | TrackerEvent::Scrape => None,
        }
    }
}

impl std::fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Snapshot source for announce counters, implemented by the download.
pub trait StatsProvider: Send + Sync {
    fn stats(&self) -> TransferStats;
}

impl StatsProvider for () {
    fn stats(&self) -> TransferStats {
        TransferStats::default()
    }
}

/// Per-torrent announce parameters that do not change per request.
#[derive(Debug, Clone)]
pub struct AnnounceCtx {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub key: u32,
    pub port: u16,
    /// Negative means "let the tracker decide".
    pub numwant: i32,
    pub compact: bool,
    /// Configured bind address; `None` or an unspecified address means
    /// wildcard.
    pub bind_addr: Option<IpAddr>,
    /// Known local addresses of the opposite family, advertised as hints
    /// when the bind is wildcard.
    pub alt_ipv4: Option<Ipv4Addr>,
    pub alt_ipv6: Option<Ipv6Addr>,
}

impl AnnounceCtx {
    pub fn new(info_hash: Id20, peer_id: Id20, port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            key: rand::random(),
            port,
            numwant: 50,
            compact: true,
            bind_addr: None,
            alt_ipv4: None,
            alt_ipv6: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub udp_tries: u32,
    pub udp_timeout: Duration,
    pub announce_timeout: Duration,
    pub dht_allowed: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            udp_tries: 3,
            udp_timeout: Duration::from_secs(10),
            announce_timeout: Duration::from_secs(120),
            dht_allowed: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeTotals {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// Fields a tracker may report alongside either success or failure. On a
/// failed announce these are still absorbed before the failure is surfaced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerFields {
    pub normal_interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
}

/// What a transport task reports back when its request resolves.
#[derive(Debug)]
pub enum TrackerReply {
    Announce {
        fields: ServerFields,
        addrs: Vec<SocketAddr>,
    },
    Scrape {
        totals: ScrapeTotals,
    },
    Failure {
        message: String,
        fields: ServerFields,
    },
}

/// Stable identity of a tracker within its list; outcome routing survives
/// promotion and tier rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(pub u64);

#[derive(Debug)]
pub struct TrackerOutcome {
    pub tracker: TrackerId,
    pub reply: TrackerReply,
}

pub(crate) fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
