use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

/// Direction of an unchoke slot: letting the peer pull from us, or pulling
/// from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Ordering applied to unchoke candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristics {
    /// Rank by how fast the peer sends to us: reward uploaders.
    UploadLeech,
    /// Rank by how fast the peer accepts from us.
    DownloadLeech,
}

/// A unique download registered with the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadId(pub u64);

/// A peer eligible for unchoking, with its current rate meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCandidate {
    pub key: SocketAddr,
    /// Bytes/s we send to this peer.
    pub up_rate: u64,
    /// Bytes/s this peer sends to us.
    pub down_rate: u64,
}

impl PeerCandidate {
    fn score(&self, heuristics: Heuristics) -> u64 {
        match heuristics {
            Heuristics::UploadLeech => self.down_rate,
            Heuristics::DownloadLeech => self.up_rate,
        }
    }
}

/// Applies choke decisions to actual peer connections. Implemented by the
/// embedder; invoked synchronously during `cycle`.
pub trait ChokeHooks: Send + Sync {
    fn set_choked(&self, peer: SocketAddr, direction: TransferDirection, choked: bool);
}

impl ChokeHooks for () {
    fn set_choked(&self, _peer: SocketAddr, _direction: TransferDirection, _choked: bool) {}
}

#[derive(Debug)]
struct QueueMember {
    download: DownloadId,
    candidate: PeerCandidate,
    unchoked: bool,
}

/// Ordered queue of unchoke candidates for one direction within one group.
pub struct ChokeQueue {
    direction: TransferDirection,
    heuristics: Heuristics,
    members: Vec<QueueMember>,
    unchoked: u32,
    hooks: Arc<dyn ChokeHooks>,
}

impl ChokeQueue {
    pub(crate) fn new(
        direction: TransferDirection,
        heuristics: Heuristics,
        hooks: Arc<dyn ChokeHooks>,
    ) -> Self {
        Self {
            direction,
            heuristics,
            members: Vec::new(),
            unchoked: 0,
            hooks,
        }
    }

    pub fn heuristics(&self) -> Heuristics {
        self.heuristics
    }

    pub fn set_heuristics(&mut self, heuristics: Heuristics) {
        self.heuristics = heuristics;
    }

    /// How many slots this queue would like to fill.
    pub fn requested(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn size_unchoked(&self) -> u32 {
        self.unchoked
    }

    /// Unchoke up to `quota` candidates, best first, choking the rest.
    /// Returns the signed net change in unchoked count. Per-peer decisions
    /// are applied through the hooks as they are made.
    pub fn cycle(&mut self, quota: u32) -> i32 {
        let target = (quota.min(self.requested())) as usize;
        let heuristics = self.heuristics;

        self.members
            .sort_by(|a, b| b.candidate.score(heuristics).cmp(&a.candidate.score(heuristics)));

        let mut delta = 0i32;
        for (i, member) in self.members.iter_mut().enumerate() {
            let unchoke = i < target;
            if unchoke != member.unchoked {
                member.unchoked = unchoke;
                self.hooks
                    .set_choked(member.candidate.key, self.direction, !unchoke);
                delta += if unchoke { 1 } else { -1 };
            }
        }

        self.unchoked = target as u32;
        trace!(
            direction = ?self.direction,
            target,
            delta,
            "choke queue cycled"
        );
        delta
    }

    pub(crate) fn insert_download(&mut self, download: DownloadId, candidates: &[PeerCandidate]) {
        for candidate in candidates {
            self.members.push(QueueMember {
                download,
                candidate: *candidate,
                unchoked: false,
            });
        }
    }

    /// Drop a download's candidates, choking any that held a slot. Returns
    /// the (non-positive) delta in unchoked count.
    pub(crate) fn remove_download(&mut self, download: DownloadId) -> i32 {
        let mut delta = 0i32;
        let direction = self.direction;
        let hooks = self.hooks.clone();
        self.members.retain(|m| {
            if m.download != download {
                return true;
            }
            if m.unchoked {
                hooks.set_choked(m.candidate.key, direction, true);
                delta -= 1;
            }
            false
        });
        self.unchoked = (self.unchoked as i32 + delta) as u32;
        delta
    }

    /// Migrate one download's candidates between queues atomically,
    /// preserving their choke state. The fleet-wide unchoked total does not
    /// change.
    pub(crate) fn move_download(from: &mut ChokeQueue, to: &mut ChokeQueue, download: DownloadId) {
        let mut carried = 0u32;
        let mut moved = Vec::new();
        from.members.retain_mut(|m| {
            if m.download != download {
                return true;
            }
            if m.unchoked {
                carried += 1;
            }
            moved.push(QueueMember {
                download: m.download,
                candidate: m.candidate,
                unchoked: m.unchoked,
            });
            false
        });
        from.unchoked -= carried;
        to.unchoked += carried;
        to.members.extend(moved);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{
        ChokeHooks, ChokeQueue, DownloadId, Heuristics, PeerCandidate, TransferDirection,
    };

    #[derive(Default)]
    pub(crate) struct RecordingHooks {
        pub(crate) calls: Mutex<Vec<(std::net::SocketAddr, TransferDirection, bool)>>,
    }

    impl ChokeHooks for RecordingHooks {
        fn set_choked(&self, peer: std::net::SocketAddr, direction: TransferDirection, choked: bool) {
            self.calls.lock().push((peer, direction, choked));
        }
    }

    fn candidate(n: u8, down_rate: u64) -> PeerCandidate {
        PeerCandidate {
            key: format!("10.0.0.{n}:6881").parse().unwrap(),
            up_rate: 0,
            down_rate,
        }
    }

    #[test]
    fn test_cycle_prefers_fast_peers() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut q = ChokeQueue::new(
            TransferDirection::Upload,
            Heuristics::UploadLeech,
            hooks.clone(),
        );
        q.insert_download(
            DownloadId(1),
            &[candidate(1, 10), candidate(2, 50), candidate(3, 30)],
        );

        assert_eq!(q.requested(), 3);
        assert_eq!(q.cycle(2), 2);
        assert_eq!(q.size_unchoked(), 2);

        let unchoked: Vec<_> = hooks
            .calls
            .lock()
            .iter()
            .filter(|(_, _, choked)| !choked)
            .map(|(p, _, _)| *p)
            .collect();
        assert_eq!(
            unchoked,
            vec![
                "10.0.0.2:6881".parse().unwrap(),
                "10.0.0.3:6881".parse().unwrap()
            ]
        );

        // Shrinking the quota chokes the excess and reports a negative delta.
        assert_eq!(q.cycle(1), -1);
        assert_eq!(q.size_unchoked(), 1);
    }

    #[test]
    fn test_remove_download_chokes_its_peers() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut q = ChokeQueue::new(
            TransferDirection::Upload,
            Heuristics::UploadLeech,
            hooks.clone(),
        );
        q.insert_download(DownloadId(1), &[candidate(1, 10)]);
        q.insert_download(DownloadId(2), &[candidate(2, 20)]);
        q.cycle(10);
        assert_eq!(q.size_unchoked(), 2);

        assert_eq!(q.remove_download(DownloadId(2)), -1);
        assert_eq!(q.size_unchoked(), 1);
        assert_eq!(q.requested(), 1);
    }

    #[test]
    fn test_move_download_preserves_unchoke_state() {
        let hooks = Arc::new(RecordingHooks::default());
        let mut a = ChokeQueue::new(
            TransferDirection::Download,
            Heuristics::DownloadLeech,
            hooks.clone(),
        );
        let mut b = ChokeQueue::new(
            TransferDirection::Download,
            Heuristics::DownloadLeech,
            hooks.clone(),
        );
        a.insert_download(DownloadId(1), &[candidate(1, 0), candidate(2, 0)]);
        a.cycle(1);
        assert_eq!(a.size_unchoked(), 1);

        ChokeQueue::move_download(&mut a, &mut b, DownloadId(1));
        assert_eq!(a.requested(), 0);
        assert_eq!(a.size_unchoked(), 0);
        assert_eq!(b.requested(), 2);
        assert_eq!(b.size_unchoked(), 1);
    }
}
