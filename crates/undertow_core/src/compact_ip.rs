use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub const COMPACT_V4_LEN: usize = 6;
pub const COMPACT_V6_LEN: usize = 18;

pub fn compact_v4(addr: &SocketAddrV4) -> [u8; COMPACT_V4_LEN] {
    let mut out = [0u8; COMPACT_V4_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn compact_v6(addr: &SocketAddrV6) -> [u8; COMPACT_V6_LEN] {
    let mut out = [0u8; COMPACT_V6_LEN];
    out[..16].copy_from_slice(&addr.ip().octets());
    out[16..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn socket_addr_v4_from_slice(buf: &[u8]) -> Option<SocketAddrV4> {
    if buf.len() != COMPACT_V4_LEN {
        return None;
    }
    let ip = Ipv4Addr::from(TryInto::<[u8; 4]>::try_into(&buf[..4]).unwrap());
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Some(SocketAddrV4::new(ip, port))
}

pub fn socket_addr_v6_from_slice(buf: &[u8]) -> Option<SocketAddrV6> {
    if buf.len() != COMPACT_V6_LEN {
        return None;
    }
    let ip = Ipv6Addr::from(TryInto::<[u8; 16]>::try_into(&buf[..16]).unwrap());
    let port = u16::from_be_bytes([buf[16], buf[17]]);
    Some(SocketAddrV6::new(ip, port, 0, 0))
}

/// Iterate 6-byte IPv4+port records in a packed buffer. A trailing partial
/// record is ignored.
pub fn iter_compact_v4(buf: &[u8]) -> impl Iterator<Item = SocketAddr> + '_ {
    buf.chunks_exact(COMPACT_V4_LEN)
        .filter_map(|c| socket_addr_v4_from_slice(c).map(SocketAddr::V4))
}

/// Iterate 18-byte IPv6+port records in a packed buffer. A trailing partial
/// record is ignored.
pub fn iter_compact_v6(buf: &[u8]) -> impl Iterator<Item = SocketAddr> + '_ {
    buf.chunks_exact(COMPACT_V6_LEN)
        .filter_map(|c| socket_addr_v6_from_slice(c).map(SocketAddr::V6))
}
