use std::ops::Range;
use std::sync::Arc;

use crate::choke_queue::{ChokeHooks, ChokeQueue, Heuristics, TransferDirection};

/// One tier of downloads sharing an upload queue and a download queue, plus
/// the slice of the resource manager's entry vector it owns. The slice is
/// tracked as (first index, count) into that vector.
pub struct ChokeGroup {
    name: String,
    up_queue: ChokeQueue,
    down_queue: ChokeQueue,
    first: usize,
    count: usize,
}

impl ChokeGroup {
    pub(crate) fn new(name: String, first: usize, hooks: Arc<dyn ChokeHooks>) -> Self {
        Self {
            name,
            up_queue: ChokeQueue::new(
                TransferDirection::Upload,
                Heuristics::UploadLeech,
                hooks.clone(),
            ),
            down_queue: ChokeQueue::new(
                TransferDirection::Download,
                Heuristics::DownloadLeech,
                hooks,
            ),
            first,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up_queue(&self) -> &ChokeQueue {
        &self.up_queue
    }

    pub fn down_queue(&self) -> &ChokeQueue {
        &self.down_queue
    }

    pub(crate) fn queue(&self, direction: TransferDirection) -> &ChokeQueue {
        match direction {
            TransferDirection::Upload => &self.up_queue,
            TransferDirection::Download => &self.down_queue,
        }
    }

    pub(crate) fn queue_mut(&mut self, direction: TransferDirection) -> &mut ChokeQueue {
        match direction {
            TransferDirection::Upload => &mut self.up_queue,
            TransferDirection::Download => &mut self.down_queue,
        }
    }

    pub(crate) fn queues_mut(&mut self) -> (&mut ChokeQueue, &mut ChokeQueue) {
        (&mut self.up_queue, &mut self.down_queue)
    }

    pub fn up_requested(&self) -> u32 {
        self.up_queue.requested()
    }

    pub fn down_requested(&self) -> u32 {
        self.down_queue.requested()
    }

    pub fn up_unchoked(&self) -> u32 {
        self.up_queue.size_unchoked()
    }

    pub fn down_unchoked(&self) -> u32 {
        self.down_queue.size_unchoked()
    }

    /// The contiguous range of resource manager entries in this group.
    pub fn entry_range(&self) -> Range<usize> {
        self.first..self.first + self.count
    }

    pub(crate) fn first(&self) -> usize {
        self.first
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn shift_first(&mut self, by: isize) {
        self.first = (self.first as isize + by) as usize;
    }

    pub(crate) fn grow(&mut self) {
        self.count += 1;
    }

    pub(crate) fn shrink(&mut self) {
        self.count -= 1;
    }
}
