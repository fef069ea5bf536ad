use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use undertow_core::compact_ip::{iter_compact_v4, iter_compact_v6};
use undertow_core::hash_id::Id20;

use crate::{
    AnnounceCtx, DEFAULT_MIN_INTERVAL, ServerFields, TrackerConfig, TrackerEvent, TrackerReply,
    TransferStats,
};

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

pub const CONNECTION_ID_MAGIC: u64 = 0x41727101980;
pub const CONNECT_REQUEST_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;

pub type TransactionId = u32;

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

#[derive(Debug)]
pub struct AnnounceFields {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    /// Explicit IPv4 address in network byte order, 0 for wildcard.
    pub ip: u32,
    pub key: u32,
    pub numwant: i32,
    pub port: u16,
}

#[derive(Debug)]
pub enum Request {
    Connect,
    Announce(u64, AnnounceFields),
}

impl Request {
    pub fn serialize(&self, transaction_id: TransactionId, buf: &mut [u8]) -> anyhow::Result<usize> {
        struct W<'a> {
            buf: &'a mut [u8],
            offset: usize,
        }
        impl W<'_> {
            fn extend_from_slice(&mut self, s: &[u8]) -> anyhow::Result<()> {
                if self.buf.len() < self.offset + s.len() {
                    bail!("not enough space in buffer")
                }
                self.buf[self.offset..self.offset + s.len()].copy_from_slice(s);
                self.offset += s.len();
                Ok(())
            }
        }

        let mut w = W { buf, offset: 0 };

        match self {
            Request::Connect => {
                w.extend_from_slice(&CONNECTION_ID_MAGIC.to_be_bytes())?;
                w.extend_from_slice(&ACTION_CONNECT.to_be_bytes())?;
                w.extend_from_slice(&transaction_id.to_be_bytes())?;
            }
            Request::Announce(connection_id, fields) => {
                w.extend_from_slice(&connection_id.to_be_bytes())?;
                w.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes())?;
                w.extend_from_slice(&transaction_id.to_be_bytes())?;
                w.extend_from_slice(&fields.info_hash.0)?;
                w.extend_from_slice(&fields.peer_id.0)?;
                w.extend_from_slice(&fields.downloaded.to_be_bytes())?;
                w.extend_from_slice(&fields.left.to_be_bytes())?;
                w.extend_from_slice(&fields.uploaded.to_be_bytes())?;
                w.extend_from_slice(&fields.event.to_be_bytes())?;
                w.extend_from_slice(&fields.ip.to_be_bytes())?;
                w.extend_from_slice(&fields.key.to_be_bytes())?;
                w.extend_from_slice(&fields.numwant.to_be_bytes())?;
                w.extend_from_slice(&fields.port.to_be_bytes())?;

                if w.offset != ANNOUNCE_REQUEST_LEN {
                    bail!(
                        "announce request must be exactly {} bytes, built {}",
                        ANNOUNCE_REQUEST_LEN,
                        w.offset
                    );
                }
            }
        }
        Ok(w.offset)
    }
}

#[derive(Debug)]
pub struct UdpAnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug)]
pub enum Response {
    Connect(u64),
    Announce(UdpAnnounceResponse),
    Error(String),
}

fn take<const N: usize>(buf: &[u8]) -> anyhow::Result<([u8; N], &[u8])> {
    if buf.len() < N {
        bail!("expected {} bytes, got {}", N, buf.len());
    }
    let (head, rest) = buf.split_at(N);
    Ok((head.try_into().unwrap(), rest))
}

fn take_u32(buf: &[u8]) -> anyhow::Result<(u32, &[u8])> {
    let (bytes, rest) = take::<4>(buf)?;
    Ok((u32::from_be_bytes(bytes), rest))
}

fn take_u64(buf: &[u8]) -> anyhow::Result<(u64, &[u8])> {
    let (bytes, rest) = take::<8>(buf)?;
    Ok((u64::from_be_bytes(bytes), rest))
}

impl Response {
    pub fn parse(buf: &[u8], is_ipv6: bool) -> anyhow::Result<(TransactionId, Self)> {
        let (action, buf) = take_u32(buf)?;
        let (tid, buf) = take_u32(buf)?;

        let response = match action {
            ACTION_CONNECT => {
                let (connection_id, _) = take_u64(buf)?;
                Response::Connect(connection_id)
            }
            ACTION_ANNOUNCE => {
                let (interval, buf) = take_u32(buf)?;
                let (leechers, buf) = take_u32(buf)?;
                let (seeders, buf) = take_u32(buf)?;
                // Compact records follow; a trailing partial record is
                // ignored.
                let addrs = if is_ipv6 {
                    iter_compact_v6(buf).collect()
                } else {
                    iter_compact_v4(buf).collect()
                };
                Response::Announce(UdpAnnounceResponse {
                    interval,
                    leechers,
                    seeders,
                    addrs,
                })
            }
            ACTION_ERROR => {
                Response::Error(String::from_utf8_lossy(buf).into_owned())
            }
            other => bail!("unsupported action {other}"),
        };

        Ok((tid, response))
    }
}

enum Phase {
    Connect,
    Announce,
}

/// Send `payload` and wait for a reply carrying our transaction id and an
/// action fitting the phase. Datagrams with a foreign transaction id are
/// ignored. Each timeout burns one try; running out fails the request.
async fn exchange(
    sock: &UdpSocket,
    target: SocketAddr,
    payload: &[u8],
    tid: TransactionId,
    tries: u32,
    timeout: Duration,
    phase: Phase,
) -> Result<Response, String> {
    let mut read_buf = [0u8; 4096];
    let mut tries_left = tries.max(1);

    loop {
        sock.send_to(payload, target)
            .await
            .map_err(|e| format!("error sending to tracker: {e}"))?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let response = loop {
            tokio::select! {
                _ = &mut deadline => break None,
                r = sock.recv_from(&mut read_buf) => {
                    let (len, _) = match r {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("error receiving from tracker: {e}");
                            continue;
                        }
                    };
                    match Response::parse(&read_buf[..len], target.is_ipv6()) {
                        Ok((rtid, response)) if rtid == tid => match (&response, &phase) {
                            (Response::Connect(_), Phase::Connect)
                            | (Response::Announce(_), Phase::Announce)
                            | (Response::Error(_), _) => break Some(response),
                            _ => {
                                trace!("response action does not fit the current phase");
                                continue;
                            }
                        },
                        Ok((rtid, _)) => {
                            trace!(rtid, expected = tid, "transaction id mismatch, ignoring");
                            continue;
                        }
                        Err(e) => {
                            trace!("unparseable datagram: {e:#}");
                            continue;
                        }
                    }
                }
            }
        };

        if let Some(response) = response {
            return Ok(response);
        }

        tries_left -= 1;
        if tries_left == 0 {
            return Err("unable to connect to UDP tracker".to_owned());
        }
        trace!(tries_left, "timed out, resending");
    }
}

fn parse_udp_url(raw: &str) -> Result<(url::Url, u16), String> {
    const BAD: &str = "could not parse hostname or port";
    let parsed = url::Url::parse(raw).map_err(|_| BAD.to_owned())?;
    if parsed.scheme() != "udp" {
        return Err(BAD.to_owned());
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(BAD.to_owned());
    }
    let port = parsed.port().filter(|p| *p != 0).ok_or_else(|| BAD.to_owned())?;
    Ok((parsed, port))
}

async fn resolve(url: &url::Url, port: u16) -> Result<SocketAddr, String> {
    match url.host() {
        Some(url::Host::Domain(name)) => tokio::net::lookup_host((name, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| "could not resolve hostname".to_owned()),
        Some(url::Host::Ipv4(ip)) => Ok((ip, port).into()),
        Some(url::Host::Ipv6(ip)) => Ok((ip, port).into()),
        None => Err("could not parse hostname or port".to_owned()),
    }
}

async fn bind_socket(target: SocketAddr, bind_addr: Option<IpAddr>) -> Result<UdpSocket, String> {
    let local: SocketAddr = match bind_addr {
        Some(ip) if ip.is_ipv4() == target.is_ipv4() => (ip, 0).into(),
        _ if target.is_ipv4() => (Ipv4Addr::UNSPECIFIED, 0).into(),
        _ => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local)
        .await
        .map_err(|e| format!("could not open UDP socket: {e}"))
}

pub(crate) async fn announce(
    raw_url: &str,
    ctx: &AnnounceCtx,
    stats: TransferStats,
    event: TrackerEvent,
    config: &TrackerConfig,
) -> TrackerReply {
    match announce_inner(raw_url, ctx, stats, event, config).await {
        Ok(reply) => reply,
        Err(message) => TrackerReply::Failure {
            message,
            fields: ServerFields::default(),
        },
    }
}

async fn announce_inner(
    raw_url: &str,
    ctx: &AnnounceCtx,
    stats: TransferStats,
    event: TrackerEvent,
    config: &TrackerConfig,
) -> Result<TrackerReply, String> {
    let (url, port) = parse_udp_url(raw_url)?;
    let target = resolve(&url, port).await?;
    trace!(?target, "address found");

    let sock = bind_socket(target, ctx.bind_addr).await?;

    let connect_tid = new_transaction_id();
    let mut write_buf = [0u8; 128];
    let len = Request::Connect
        .serialize(connect_tid, &mut write_buf)
        .map_err(|e| e.to_string())?;
    let connection_id = match exchange(
        &sock,
        target,
        &write_buf[..len],
        connect_tid,
        config.udp_tries,
        config.udp_timeout,
        Phase::Connect,
    )
    .await?
    {
        Response::Connect(connection_id) => connection_id,
        Response::Error(message) => return Err(format!("received error message: {message}")),
        other => return Err(format!("unexpected response {other:?} to connect")),
    };
    trace!(connection_id, "connected");

    let ip = match ctx.bind_addr {
        Some(IpAddr::V4(v4)) if !v4.is_unspecified() => u32::from(v4),
        _ => 0,
    };
    let fields = AnnounceFields {
        info_hash: ctx.info_hash,
        peer_id: ctx.peer_id,
        downloaded: stats.downloaded,
        left: stats.left,
        uploaded: stats.uploaded,
        event: event as u32,
        ip,
        key: ctx.key,
        numwant: ctx.numwant,
        port: ctx.port,
    };
    let announce_tid = new_transaction_id();
    let len = Request::Announce(connection_id, fields)
        .serialize(announce_tid, &mut write_buf)
        .map_err(|e| e.to_string())?;

    // An announce timeout keeps retrying with the cached connection id.
    match exchange(
        &sock,
        target,
        &write_buf[..len],
        announce_tid,
        config.udp_tries,
        config.udp_timeout,
        Phase::Announce,
    )
    .await?
    {
        Response::Announce(response) => {
            trace!(peers = response.addrs.len(), "received announce response");
            Ok(TrackerReply::Announce {
                fields: ServerFields {
                    normal_interval: Some(response.interval),
                    min_interval: Some(DEFAULT_MIN_INTERVAL),
                    tracker_id: None,
                    complete: Some(response.seeders),
                    incomplete: Some(response.leechers),
                    downloaded: None,
                },
                addrs: response.addrs,
            })
        }
        Response::Error(message) => Err(format!("received error message: {message}")),
        other => Err(format!("unexpected response {other:?} to announce")),
    }
}
