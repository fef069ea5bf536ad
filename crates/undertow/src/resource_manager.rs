use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::choke_group::ChokeGroup;
use crate::choke_queue::{ChokeHooks, ChokeQueue, DownloadId, PeerCandidate, TransferDirection};
use crate::error::{Error, Result};

pub const MAX_PRIORITY: u32 = 1 << 16;
pub const MAX_UNCHOKED_LIMIT: u32 = 1 << 16;

/// The connection inventory one download exposes to the choke scheduler:
/// its peers with their current rate meters, per direction.
#[derive(Debug, Default, Clone)]
pub struct DownloadPeers {
    pub up: Vec<PeerCandidate>,
    pub down: Vec<PeerCandidate>,
}

/// Handle to one download registered with the resource manager. The peer
/// roster is refreshed by the owning download as connections come and go.
pub struct DownloadHandle {
    id: DownloadId,
    peers: Mutex<DownloadPeers>,
}

impl DownloadHandle {
    pub fn new(id: DownloadId) -> Self {
        Self {
            id,
            peers: Mutex::new(DownloadPeers::default()),
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn set_peers(&self, peers: DownloadPeers) {
        *self.peers.lock() = peers;
    }

    pub fn peers(&self) -> DownloadPeers {
        self.peers.lock().clone()
    }
}

/// One slot in the resource manager's entry vector.
pub struct ResourceEntry {
    download: Arc<DownloadHandle>,
    group: usize,
    priority: u16,
}

impl ResourceEntry {
    pub fn download(&self) -> &Arc<DownloadHandle> {
        &self.download
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }
}

/// Fleet-wide unchoke scheduler. Downloads live in one vector, partitioned
/// contiguously by choke group; every tick redistributes the global unchoke
/// quota across the groups.
pub struct ResourceManager {
    entries: Vec<ResourceEntry>,
    groups: Vec<ChokeGroup>,
    hooks: Arc<dyn ChokeHooks>,
    max_upload_unchoked: u32,
    max_download_unchoked: u32,
    currently_upload_unchoked: u32,
    currently_download_unchoked: u32,
}

impl ResourceManager {
    pub fn new(hooks: Arc<dyn ChokeHooks>) -> Self {
        Self {
            entries: Vec::new(),
            groups: Vec::new(),
            hooks,
            max_upload_unchoked: 0,
            max_download_unchoked: 0,
            currently_upload_unchoked: 0,
            currently_download_unchoked: 0,
        }
    }

    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_at(&self, group: usize) -> Result<&ChokeGroup> {
        self.groups.get(group).ok_or(Error::GroupNotFound(group))
    }

    pub fn group_at_name(&self, name: &str) -> Result<&ChokeGroup> {
        self.groups
            .iter()
            .find(|g| g.name() == name)
            .ok_or_else(|| Error::BadGroupName(name.to_owned()))
    }

    pub fn group_index_of(&self, name: &str) -> Result<usize> {
        self.groups
            .iter()
            .position(|g| g.name() == name)
            .ok_or_else(|| Error::BadGroupName(name.to_owned()))
    }

    pub fn find(&self, id: DownloadId) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.download.id() == id)
    }

    pub fn currently_upload_unchoked(&self) -> u32 {
        self.currently_upload_unchoked
    }

    /// Sum of all entry priorities. Inactive downloads still count.
    pub fn total_weight(&self) -> u32 {
        self.entries.iter().map(|e| e.priority as u32).sum()
    }

    pub fn currently_download_unchoked(&self) -> u32 {
        self.currently_download_unchoked
    }

    /// Append a new choke group. Groups are never removed.
    pub fn push_group(&mut self, name: &str) -> Result<usize> {
        if name.is_empty() || self.groups.iter().any(|g| g.name() == name) {
            return Err(Error::BadGroupName(name.to_owned()));
        }
        self.groups.push(ChokeGroup::new(
            name.to_owned(),
            self.entries.len(),
            self.hooks.clone(),
        ));
        Ok(self.groups.len() - 1)
    }

    fn position(&self, id: DownloadId) -> Option<usize> {
        self.entries.iter().position(|e| e.download.id() == id)
    }

    fn find_group_end(&self, group: usize) -> usize {
        self.entries.partition_point(|e| e.group <= group)
    }

    /// Register a download with a group, keeping the group subsequence
    /// contiguous, and move its peers into the group's queues.
    pub fn insert(
        &mut self,
        download: Arc<DownloadHandle>,
        group: usize,
        priority: u32,
    ) -> Result<()> {
        if group >= self.groups.len() {
            return Err(Error::GroupNotFound(group));
        }
        if priority >= MAX_PRIORITY {
            return Err(Error::PriorityOutOfRange(priority));
        }

        let pos = self.find_group_end(group);
        self.entries.insert(
            pos,
            ResourceEntry {
                download: download.clone(),
                group,
                priority: priority as u16,
            },
        );
        self.groups[group].grow();
        for g in &mut self.groups[group + 1..] {
            g.shift_first(1);
        }

        let peers = download.peers();
        let (up, down) = self.groups[group].queues_mut();
        up.insert_download(download.id(), &peers.up);
        down.insert_download(download.id(), &peers.down);

        trace!(download = download.id().0, group, "download inserted");
        Ok(())
    }

    /// Unregister a download. Its unchoked peers are choked on the way out.
    pub fn erase(&mut self, id: DownloadId) -> Result<()> {
        let pos = self.position(id).ok_or(Error::DownloadNotFound)?;
        let group = self.entries[pos].group;

        let (up_delta, down_delta) = {
            let (up, down) = self.groups[group].queues_mut();
            (up.remove_download(id), down.remove_download(id))
        };
        self.receive_upload_unchoke(up_delta)?;
        self.receive_download_unchoke(down_delta)?;

        self.entries.remove(pos);
        self.groups[group].shrink();
        for g in &mut self.groups[group + 1..] {
            g.shift_first(-1);
        }

        trace!(download = id.0, group, "download erased");
        Ok(())
    }

    /// Atomically reassign a download to another group: its peers migrate
    /// between the queues with their choke state intact, the entry moves to
    /// the end of the target group's subsequence, and only the boundaries
    /// of the groups in between are adjusted.
    pub fn set_group(&mut self, id: DownloadId, new_group: usize) -> Result<()> {
        let pos = self.position(id).ok_or(Error::DownloadNotFound)?;
        let old_group = self.entries[pos].group;
        if old_group == new_group {
            return Ok(());
        }
        if new_group >= self.groups.len() {
            return Err(Error::GroupNotFound(new_group));
        }

        {
            let (src, dst) = two_groups_mut(&mut self.groups, old_group, new_group);
            ChokeQueue::move_download(
                src.queue_mut(TransferDirection::Upload),
                dst.queue_mut(TransferDirection::Upload),
                id,
            );
            ChokeQueue::move_download(
                src.queue_mut(TransferDirection::Download),
                dst.queue_mut(TransferDirection::Download),
                id,
            );
        }

        let mut entry = self.entries.remove(pos);
        entry.group = new_group;
        let ins = self.find_group_end(new_group);
        self.entries.insert(ins, entry);

        if new_group < old_group {
            self.groups[new_group].grow();
            for g in &mut self.groups[new_group + 1..old_group] {
                g.shift_first(1);
            }
            self.groups[old_group].shift_first(1);
            self.groups[old_group].shrink();
        } else {
            self.groups[old_group].shrink();
            for g in &mut self.groups[old_group + 1..new_group] {
                g.shift_first(-1);
            }
            self.groups[new_group].shift_first(-1);
            self.groups[new_group].grow();
        }

        trace!(download = id.0, old_group, new_group, "download regrouped");
        Ok(())
    }

    pub fn set_priority(&mut self, id: DownloadId, priority: u32) -> Result<()> {
        if priority >= MAX_PRIORITY {
            return Err(Error::PriorityOutOfRange(priority));
        }
        let pos = self.position(id).ok_or(Error::DownloadNotFound)?;
        self.entries[pos].priority = priority as u16;
        Ok(())
    }

    /// `0` means unlimited.
    pub fn set_max_upload_unchoked(&mut self, max: u32) -> Result<()> {
        if max >= MAX_UNCHOKED_LIMIT {
            return Err(Error::MaxUnchokedOutOfRange(max));
        }
        self.max_upload_unchoked = max;
        Ok(())
    }

    /// `0` means unlimited.
    pub fn set_max_download_unchoked(&mut self, max: u32) -> Result<()> {
        if max >= MAX_UNCHOKED_LIMIT {
            return Err(Error::MaxUnchokedOutOfRange(max));
        }
        self.max_download_unchoked = max;
        Ok(())
    }

    pub fn receive_upload_unchoke(&mut self, adjust: i32) -> Result<()> {
        debug!(
            currently = self.currently_upload_unchoked,
            adjust, "upload unchoked slots adjust"
        );
        let next = self.currently_upload_unchoked as i64 + adjust as i64;
        if next < 0 {
            return Err(Error::UnchokeWentNegative {
                currently: self.currently_upload_unchoked,
                adjust,
            });
        }
        self.currently_upload_unchoked = next as u32;
        Ok(())
    }

    pub fn receive_download_unchoke(&mut self, adjust: i32) -> Result<()> {
        debug!(
            currently = self.currently_download_unchoked,
            adjust, "download unchoked slots adjust"
        );
        let next = self.currently_download_unchoked as i64 + adjust as i64;
        if next < 0 {
            return Err(Error::UnchokeWentNegative {
                currently: self.currently_download_unchoked,
                adjust,
            });
        }
        self.currently_download_unchoked = next as u32;
        Ok(())
    }

    pub fn retrieve_upload_can_unchoke(&self) -> i32 {
        if self.max_upload_unchoked == 0 {
            return i32::MAX;
        }
        self.max_upload_unchoked as i32 - self.currently_upload_unchoked as i32
    }

    pub fn retrieve_download_can_unchoke(&self) -> i32 {
        if self.max_download_unchoked == 0 {
            return i32::MAX;
        }
        self.max_download_unchoked as i32 - self.currently_download_unchoked as i32
    }

    /// Check that every group's (first, count) delimits exactly the
    /// contiguous run of its entries.
    pub fn validate_group_layout(&self) -> Result<()> {
        let mut expect = 0usize;
        for (gi, g) in self.groups.iter().enumerate() {
            if g.first() != expect {
                return Err(Error::GroupBoundariesBroken);
            }
            let end = expect + g.count();
            if end > self.entries.len()
                || self.entries[expect..end].iter().any(|e| e.group != gi)
            {
                return Err(Error::GroupBoundariesBroken);
            }
            expect = end;
        }
        if expect != self.entries.len() {
            return Err(Error::GroupBoundariesBroken);
        }
        Ok(())
    }

    /// Periodic re-balance of both directions, followed by reconciliation of
    /// the running totals against what the queues report.
    pub fn receive_tick(&mut self) -> Result<()> {
        self.validate_group_layout()?;

        let up_change =
            self.balance_unchoked(self.max_upload_unchoked, TransferDirection::Upload)?;
        self.receive_upload_unchoke(up_change)?;

        let down_change =
            self.balance_unchoked(self.max_download_unchoked, TransferDirection::Download)?;
        self.receive_download_unchoke(down_change)?;

        let up_sum: u32 = self.groups.iter().map(ChokeGroup::up_unchoked).sum();
        let down_sum: u32 = self.groups.iter().map(ChokeGroup::down_unchoked).sum();

        if up_sum != self.currently_upload_unchoked || down_sum != self.currently_download_unchoked
        {
            return Err(Error::UnchokeTotalsMismatch {
                up_total: self.currently_upload_unchoked,
                up_sum,
                down_total: self.currently_download_unchoked,
                down_sum,
            });
        }
        Ok(())
    }

    /// Distribute `max_unchoked` slots across the groups for one direction.
    ///
    /// Groups requesting the fewest slots are served first, so their unused
    /// share flows to the hungrier groups behind them. Each group is given
    /// an equal split of what remains (weighting by priority is a possible
    /// refinement).
    fn balance_unchoked(&mut self, max_unchoked: u32, direction: TransferDirection) -> Result<i32> {
        let mut change = 0i32;

        if max_unchoked == 0 {
            for group in &mut self.groups {
                change += group.queue_mut(direction).cycle(u32::MAX);
            }
            return Ok(change);
        }

        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&i| self.groups[i].queue(direction).requested());

        debug!(
            ?direction,
            currently = match direction {
                TransferDirection::Upload => self.currently_upload_unchoked,
                TransferDirection::Download => self.currently_download_unchoked,
            },
            max_unchoked,
            "unchoked slots cycle"
        );

        let mut quota = max_unchoked;
        let mut weight = self.groups.len() as u32;

        for gi in order {
            let queue = self.groups[gi].queue_mut(direction);
            change += queue.cycle(if weight != 0 { quota / weight } else { 0 });
            quota = quota.saturating_sub(queue.size_unchoked());
            weight -= 1;
        }

        if weight != 0 {
            return Err(Error::WeightNotConsumed);
        }

        Ok(change)
    }

    /// Verify all unchoke slots were returned before teardown.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.currently_upload_unchoked != 0 || self.currently_download_unchoked != 0 {
            return Err(Error::ShutdownUnchoked);
        }
        Ok(())
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.currently_upload_unchoked == 0 && self.currently_download_unchoked == 0,
                "resource manager dropped with peers still unchoked"
            );
        }
    }
}

fn two_groups_mut(groups: &mut [ChokeGroup], a: usize, b: usize) -> (&mut ChokeGroup, &mut ChokeGroup) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = groups.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = groups.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{DownloadHandle, DownloadPeers, ResourceManager};
    use crate::choke_queue::{ChokeHooks, DownloadId, PeerCandidate, TransferDirection};
    use crate::error::Error;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<(SocketAddr, TransferDirection, bool)>>,
    }

    impl ChokeHooks for RecordingHooks {
        fn set_choked(&self, peer: SocketAddr, direction: TransferDirection, choked: bool) {
            self.calls.lock().push((peer, direction, choked));
        }
    }

    fn download_with_up_peers(id: u64, count: usize) -> Arc<DownloadHandle> {
        let d = DownloadHandle::new(DownloadId(id));
        let up = (0..count)
            .map(|i| PeerCandidate {
                key: format!("10.{id}.{}.{}:6881", i / 250, i % 250).parse().unwrap(),
                up_rate: 0,
                down_rate: i as u64,
            })
            .collect();
        d.set_peers(DownloadPeers {
            up,
            down: Vec::new(),
        });
        Arc::new(d)
    }

    fn drain(rm: &mut ResourceManager, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            rm.erase(DownloadId(id)).unwrap();
        }
        assert!(rm.shutdown().is_ok());
    }

    #[test]
    fn test_three_group_quota_balancing() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("g1").unwrap();
        rm.push_group("g2").unwrap();
        rm.push_group("g3").unwrap();

        rm.insert(download_with_up_peers(1, 10), 0, 100).unwrap();
        rm.insert(download_with_up_peers(2, 2), 1, 100).unwrap();
        rm.insert(download_with_up_peers(3, 50), 2, 100).unwrap();

        rm.set_max_upload_unchoked(9).unwrap();
        rm.receive_tick().unwrap();

        // Served in ascending request order (g2, g1, g3): the group wanting
        // two slots leaves its surplus for the hungry ones.
        assert_eq!(rm.group_at(1).unwrap().up_unchoked(), 2);
        assert_eq!(rm.group_at(0).unwrap().up_unchoked(), 3);
        assert_eq!(rm.group_at(2).unwrap().up_unchoked(), 4);
        assert_eq!(rm.currently_upload_unchoked(), 9);
        assert_eq!(rm.retrieve_upload_can_unchoke(), 0);

        drain(&mut rm, [1, 2, 3]);
    }

    #[test]
    fn test_unlimited_unchokes_everyone() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("main").unwrap();
        rm.insert(download_with_up_peers(1, 7), 0, 100).unwrap();

        assert_eq!(rm.retrieve_upload_can_unchoke(), i32::MAX);
        rm.receive_tick().unwrap();
        assert_eq!(rm.currently_upload_unchoked(), 7);

        drain(&mut rm, [1]);
    }

    #[test]
    fn test_group_layout_survives_mutation() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("a").unwrap();
        rm.push_group("b").unwrap();
        rm.push_group("c").unwrap();

        for id in 1..=6u64 {
            rm.insert(download_with_up_peers(id, 2), (id % 3) as usize, 10)
                .unwrap();
            rm.validate_group_layout().unwrap();
        }

        rm.set_group(DownloadId(1), 2).unwrap();
        rm.validate_group_layout().unwrap();
        rm.set_group(DownloadId(5), 0).unwrap();
        rm.validate_group_layout().unwrap();
        rm.erase(DownloadId(3)).unwrap();
        rm.validate_group_layout().unwrap();

        // Entries stay partitioned by group and each group's range matches.
        let entries = rm.entries();
        for gi in 0..rm.group_count() {
            let range = rm.group_at(gi).unwrap().entry_range();
            assert!(entries[range].iter().all(|e| e.group() == gi));
        }
        assert_eq!(rm.find(DownloadId(1)).unwrap().group(), 2);
        assert_eq!(rm.find(DownloadId(5)).unwrap().group(), 0);

        // Peers moved with their download.
        assert_eq!(rm.group_at(0).unwrap().up_requested(), 4);

        drain(&mut rm, [1, 2, 4, 5, 6]);
    }

    #[test]
    fn test_set_group_preserves_unchoked_slots() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("a").unwrap();
        rm.push_group("b").unwrap();
        rm.insert(download_with_up_peers(1, 4), 0, 10).unwrap();

        rm.set_max_upload_unchoked(3).unwrap();
        rm.receive_tick().unwrap();
        assert_eq!(rm.currently_upload_unchoked(), 3);

        rm.set_group(DownloadId(1), 1).unwrap();
        assert_eq!(rm.group_at(1).unwrap().up_unchoked(), 3);
        assert_eq!(rm.currently_upload_unchoked(), 3);
        rm.receive_tick().unwrap();

        drain(&mut rm, [1]);
    }

    #[test]
    fn test_group_name_validation() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("seed").unwrap();
        assert!(matches!(rm.push_group("seed"), Err(Error::BadGroupName(_))));
        assert!(matches!(rm.push_group(""), Err(Error::BadGroupName(_))));
        assert_eq!(rm.group_index_of("seed").unwrap(), 0);
        assert!(rm.group_at_name("nope").is_err());
    }

    #[test]
    fn test_input_validation() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("main").unwrap();

        assert!(matches!(
            rm.insert(download_with_up_peers(1, 0), 7, 0),
            Err(Error::GroupNotFound(7))
        ));
        assert!(matches!(
            rm.insert(download_with_up_peers(1, 0), 0, 1 << 16),
            Err(Error::PriorityOutOfRange(_))
        ));
        assert!(matches!(
            rm.set_max_upload_unchoked(1 << 16),
            Err(Error::MaxUnchokedOutOfRange(_))
        ));
        assert!(matches!(rm.erase(DownloadId(9)), Err(Error::DownloadNotFound)));

        rm.insert(download_with_up_peers(1, 1), 0, 0).unwrap();
        assert!(matches!(
            rm.set_priority(DownloadId(1), 1 << 16),
            Err(Error::PriorityOutOfRange(_))
        ));
        rm.set_priority(DownloadId(1), 1024).unwrap();
        assert_eq!(rm.find(DownloadId(1)).unwrap().priority(), 1024);

        drain(&mut rm, [1]);
    }

    #[test]
    fn test_unchoke_count_cannot_go_negative() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        assert!(matches!(
            rm.receive_upload_unchoke(-1),
            Err(Error::UnchokeWentNegative {
                currently: 0,
                adjust: -1
            })
        ));
    }

    #[test]
    fn test_forged_totals_fail_reconciliation() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("main").unwrap();
        rm.insert(download_with_up_peers(1, 3), 0, 10).unwrap();
        rm.set_max_upload_unchoked(2).unwrap();
        rm.receive_tick().unwrap();

        // An unchoke delta the queues know nothing about must be caught at
        // the next tick.
        rm.receive_upload_unchoke(1).unwrap();
        assert!(matches!(
            rm.receive_tick(),
            Err(Error::UnchokeTotalsMismatch { .. })
        ));

        // Repair the books before teardown.
        rm.receive_upload_unchoke(-1).unwrap();
        drain(&mut rm, [1]);
    }

    #[test]
    fn test_shutdown_reports_outstanding_unchokes() {
        let mut rm = ResourceManager::new(Arc::new(RecordingHooks::default()));
        rm.push_group("main").unwrap();
        rm.insert(download_with_up_peers(1, 2), 0, 10).unwrap();
        rm.receive_tick().unwrap();
        assert!(matches!(rm.shutdown(), Err(Error::ShutdownUnchoked)));
        drain(&mut rm, [1]);
    }
}
