//! Foundation types shared across the undertow crates: 20-byte ids,
//! piece/block geometry, the compact peer-address codec and instrumented
//! task spawning.

pub mod compact_ip;
pub mod hash_id;
pub mod lengths;
pub mod peer_id;
pub mod spawn_utils;

pub use hash_id::Id20;
