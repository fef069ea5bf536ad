use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use tracing::trace;
use undertow_core::compact_ip::{iter_compact_v4, iter_compact_v6};
use undertow_core::hash_id::Id20;

use crate::{
    AnnounceCtx, DEFAULT_MIN_INTERVAL, DEFAULT_NORMAL_INTERVAL, ScrapeTotals, ServerFields,
    TrackerEvent, TrackerReply, TransferStats,
};

/// Scrape exists iff the last path segment of the URL is `/announce`.
pub(crate) fn can_scrape(url: &str) -> bool {
    match url.rfind('/') {
        Some(pos) => url[pos..].starts_with("/announce"),
        None => false,
    }
}

/// The URL already ends in a query string; parameters are appended with `&`
/// instead of `?`.
pub(crate) fn drop_delimiter(url: &str) -> bool {
    match url.rfind('?') {
        Some(pos) => !url[pos..].contains('/'),
        None => false,
    }
}

/// Substitute `/announce` with `/scrape` at the last path segment.
pub(crate) fn scrape_url_from(url: &str) -> String {
    match url.rfind('/') {
        Some(pos) if url[pos..].starts_with("/announce") => {
            format!("{}/scrape{}", &url[..pos], &url[pos + "/announce".len()..])
        }
        _ => url.to_owned(),
    }
}

pub(crate) fn build_announce_url(
    base: &str,
    drop_delim: bool,
    ctx: &AnnounceCtx,
    stats: TransferStats,
    event: TrackerEvent,
    tracker_id: Option<&str>,
) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(base.len() + 256);
    s.push_str(base);
    s.push(if drop_delim { '&' } else { '?' });
    s.push_str("info_hash=");
    s.push_str(urlencoding::encode_binary(&ctx.info_hash.0).as_ref());
    s.push_str("&peer_id=");
    s.push_str(urlencoding::encode_binary(&ctx.peer_id.0).as_ref());

    if ctx.key != 0 {
        write!(s, "&key={:08x}", ctx.key).unwrap();
    }
    if let Some(tracker_id) = tracker_id {
        write!(s, "&trackerid={}", urlencoding::encode(tracker_id)).unwrap();
    }

    match ctx.bind_addr {
        Some(ip) if !ip.is_unspecified() => {
            write!(s, "&ip={ip}").unwrap();
        }
        bind => {
            // Wildcard bind: advertise the opposite-family address we know
            // of, if any, so dual-stack trackers can hand us out both ways.
            if matches!(bind, None | Some(IpAddr::V4(_))) {
                if let Some(v6) = ctx.alt_ipv6 {
                    write!(s, "&ipv6={}", urlencoding::encode(&v6.to_string())).unwrap();
                }
            } else if let Some(v4) = ctx.alt_ipv4 {
                write!(s, "&ipv4={v4}").unwrap();
            }
        }
    }

    if ctx.compact {
        s.push_str("&compact=1");
    }
    if ctx.numwant >= 0 && event != TrackerEvent::Stopped {
        write!(s, "&numwant={}", ctx.numwant).unwrap();
    }
    if ctx.port != 0 {
        write!(s, "&port={}", ctx.port).unwrap();
    }
    write!(
        s,
        "&uploaded={}&downloaded={}&left={}",
        stats.uploaded, stats.downloaded, stats.left
    )
    .unwrap();
    if let Some(event) = event.query_value() {
        write!(s, "&event={event}").unwrap();
    }

    s
}

pub(crate) fn build_scrape_url(base: &str, drop_delim: bool, info_hash: &Id20) -> String {
    let mut s = scrape_url_from(base);
    s.push(if drop_delim { '&' } else { '?' });
    s.push_str("info_hash=");
    s.push_str(urlencoding::encode_binary(&info_hash.0).as_ref());
    s
}

/// Compact peer string, or a list of `{ip, port}` dicts. Some trackers send
/// the wrong representation when they have no peers, so both are accepted
/// everywhere.
#[derive(Debug)]
pub(crate) enum Peers {
    Compact(Vec<u8>),
    Dict(Vec<SocketAddr>),
}

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Peers;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a compact peer string or a list of peer dicts")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Peers::Compact(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Peers::Compact(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Peers::Compact(v.as_bytes().to_vec()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                #[derive(Deserialize)]
                struct DictPeer {
                    ip: ByteBuf,
                    port: u16,
                }

                let mut addrs = Vec::new();
                while let Some(peer) = seq.next_element::<DictPeer>()? {
                    if let Ok(ip) = std::str::from_utf8(&peer.ip)
                        .unwrap_or_default()
                        .parse::<IpAddr>()
                    {
                        addrs.push(SocketAddr::new(ip, peer.port));
                    }
                }
                Ok(Peers::Dict(addrs))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct HttpTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(rename = "tracker id", default)]
    tracker_id: Option<ByteBuf>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    downloaded: Option<i64>,
    #[serde(default)]
    peers: Option<Peers>,
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

fn clamped(v: Option<i64>) -> Option<u32> {
    v.map(|v| v.max(0).min(u32::MAX as i64) as u32)
}

fn server_fields(resp: &HttpTrackerResponse) -> ServerFields {
    ServerFields {
        normal_interval: clamped(resp.interval),
        min_interval: clamped(resp.min_interval),
        tracker_id: resp
            .tracker_id
            .as_ref()
            .map(|t| String::from_utf8_lossy(t).into_owned()),
        complete: clamped(resp.complete),
        incomplete: clamped(resp.incomplete),
        downloaded: clamped(resp.downloaded),
    }
}

pub(crate) fn parse_announce_response(bytes: &[u8]) -> TrackerReply {
    let resp: HttpTrackerResponse = match serde_bencode::from_bytes(bytes) {
        Ok(resp) => resp,
        Err(e) => {
            return TrackerReply::Failure {
                message: format!("could not parse bencoded data: {e}"),
                fields: ServerFields::default(),
            };
        }
    };

    let mut fields = server_fields(&resp);

    if let Some(reason) = &resp.failure_reason {
        return TrackerReply::Failure {
            message: format!("failure reason \"{}\"", String::from_utf8_lossy(reason)),
            fields,
        };
    }

    fields.normal_interval.get_or_insert(DEFAULT_NORMAL_INTERVAL);
    fields.min_interval.get_or_insert(DEFAULT_MIN_INTERVAL);

    if resp.peers.is_none() && resp.peers6.is_none() {
        return TrackerReply::Failure {
            message: "No peers returned".to_owned(),
            fields,
        };
    }

    let mut addrs = Vec::new();
    match &resp.peers {
        Some(Peers::Compact(buf)) => addrs.extend(iter_compact_v4(buf)),
        Some(Peers::Dict(list)) => addrs.extend(list.iter().copied()),
        None => {}
    }
    if let Some(peers6) = &resp.peers6 {
        addrs.extend(iter_compact_v6(peers6));
    }

    TrackerReply::Announce { fields, addrs }
}

#[derive(Deserialize, Debug, Default)]
struct ScrapeFile {
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    downloaded: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
struct ScrapeResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(default)]
    files: Option<std::collections::BTreeMap<ByteBuf, ScrapeFile>>,
}

pub(crate) fn parse_scrape_response(bytes: &[u8], info_hash: &Id20) -> TrackerReply {
    let resp: ScrapeResponse = match serde_bencode::from_bytes(bytes) {
        Ok(resp) => resp,
        Err(e) => {
            return TrackerReply::Failure {
                message: format!("could not parse bencoded data: {e}"),
                fields: ServerFields::default(),
            };
        }
    };

    if let Some(reason) = &resp.failure_reason {
        return TrackerReply::Failure {
            message: format!("failure reason \"{}\"", String::from_utf8_lossy(reason)),
            fields: ServerFields::default(),
        };
    }

    let Some(files) = &resp.files else {
        return TrackerReply::Failure {
            message: "scrape reply has no files entry".to_owned(),
            fields: ServerFields::default(),
        };
    };

    let Some((_, stats)) = files
        .iter()
        .find(|(hash, _)| hash.as_slice() == info_hash.0.as_slice())
    else {
        return TrackerReply::Failure {
            message: "scrape reply did not contain the info hash".to_owned(),
            fields: ServerFields::default(),
        };
    };

    TrackerReply::Scrape {
        totals: ScrapeTotals {
            complete: clamped(stats.complete).unwrap_or(0),
            incomplete: clamped(stats.incomplete).unwrap_or(0),
            downloaded: clamped(stats.downloaded).unwrap_or(0),
        },
    }
}

async fn fetch(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Vec<u8>, String> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| format!("http request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("tracker responded with {}", response.status()));
    }
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| format!("error reading tracker response: {e}"))
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn announce(
    client: &reqwest::Client,
    url: &str,
    drop_delim: bool,
    ctx: &AnnounceCtx,
    stats: TransferStats,
    event: TrackerEvent,
    tracker_id: Option<&str>,
    timeout: Duration,
) -> TrackerReply {
    let full = build_announce_url(url, drop_delim, ctx, stats, event, tracker_id);
    trace!(url = %full, "tracker http request");
    match fetch(client, &full, timeout).await {
        Ok(bytes) => parse_announce_response(&bytes),
        Err(message) => TrackerReply::Failure {
            message,
            fields: ServerFields::default(),
        },
    }
}

pub(crate) async fn scrape(
    client: &reqwest::Client,
    url: &str,
    drop_delim: bool,
    info_hash: &Id20,
    timeout: Duration,
) -> TrackerReply {
    let full = build_scrape_url(url, drop_delim, info_hash);
    trace!(url = %full, "tracker http scrape");
    match fetch(client, &full, timeout).await {
        Ok(bytes) => parse_scrape_response(&bytes, info_hash),
        Err(message) => TrackerReply::Failure {
            message,
            fields: ServerFields::default(),
        },
    }
}
