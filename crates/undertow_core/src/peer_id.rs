use crate::hash_id::Id20;

/// Generate an Azureus-style peer id, stable for the lifetime of the
/// returned value.
pub fn generate_peer_id() -> Id20 {
    let mut peer_id = [0u8; 20];

    let u = uuid::Uuid::new_v4();
    peer_id[4..20].copy_from_slice(&u.as_bytes()[..]);

    peer_id[..8].copy_from_slice(b"-UW0001-");

    Id20::new(peer_id)
}
