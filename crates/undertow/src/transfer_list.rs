use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::block_list::BlockList;
use crate::error::{Error, Result};

/// The piece-sized buffer shared with the hashing side. The transfer list
/// only ever touches it through comparison and copy, and only while it owns
/// the verdict.
pub trait PieceBuffer {
    /// Compare `[offset, offset + data.len())` of the piece against `data`.
    fn compare(&self, offset: u32, data: &[u8]) -> bool;
    /// Copy `[offset, offset + out.len())` of the piece into `out`.
    fn copy_to(&self, offset: u32, out: &mut [u8]);
    /// Overwrite `[offset, offset + data.len())` of the piece with `data`.
    fn copy_from(&mut self, offset: u32, data: &[u8]);
}

impl PieceBuffer for Vec<u8> {
    fn compare(&self, offset: u32, data: &[u8]) -> bool {
        let off = offset as usize;
        self.get(off..off + data.len()).is_some_and(|s| s == data)
    }

    fn copy_to(&self, offset: u32, out: &mut [u8]) {
        let off = offset as usize;
        out.copy_from_slice(&self[off..off + out.len()]);
    }

    fn copy_from(&mut self, offset: u32, data: &[u8]) {
        let off = offset as usize;
        self[off..off + data.len()].copy_from_slice(data);
    }
}

/// Set by the enclosing download component.
pub trait TransferEvents: Send + Sync {
    fn on_queued(&self, _piece: u32) {}
    /// The piece is fully assembled (or reassembled) and should be hashed.
    fn on_completed(&self, _piece: u32) {}
    fn on_canceled(&self, _piece: u32) {}
    /// The peer supplied data that did not survive verification.
    fn on_corrupt(&self, _peer: SocketAddr) {}
}

impl TransferEvents for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletedEntry {
    pub at_usec: u64,
    pub index: u32,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TransferListStats {
    pub succeeded: u32,
    pub failed: u32,
    pub in_flight: u32,
}

const COMPLETED_PRUNE_TRIGGER_USEC: u64 = 60 * 60 * 1_000_000;
const COMPLETED_RETAIN_USEC: u64 = 30 * 60 * 1_000_000;

/// The in-flight piece set: which pieces are being assembled, which peers
/// contributed which payloads, and what to do when a hash verdict lands.
pub struct TransferList {
    lists: Vec<BlockList>,
    completed: Vec<CompletedEntry>,
    succeeded_count: u32,
    failed_count: u32,
    events: Arc<dyn TransferEvents>,
}

impl TransferList {
    pub fn new(events: Arc<dyn TransferEvents>) -> Self {
        Self {
            lists: Vec::new(),
            completed: Vec::new(),
            succeeded_count: 0,
            failed_count: 0,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn succeeded_count(&self) -> u32 {
        self.succeeded_count
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn stats(&self) -> TransferListStats {
        TransferListStats {
            succeeded: self.succeeded_count,
            failed: self.failed_count,
            in_flight: self.lists.len() as u32,
        }
    }

    /// Timestamped log of recently verified piece indices, pruned so any
    /// consumer polling at half-hour intervals or faster sees every entry.
    pub fn completed_list(&self) -> &[CompletedEntry] {
        &self.completed
    }

    fn position(&self, index: u32) -> Option<usize> {
        self.lists.iter().position(|l| l.index() == index)
    }

    pub fn find(&self, index: u32) -> Option<&BlockList> {
        self.lists.iter().find(|l| l.index() == index)
    }

    pub fn find_mut(&mut self, index: u32) -> Option<&mut BlockList> {
        self.lists.iter_mut().find(|l| l.index() == index)
    }

    pub fn insert(&mut self, index: u32, piece_len: u32, block_len: u32) -> Result<&mut BlockList> {
        if self.position(index).is_some() {
            return Err(Error::DuplicatePieceIndex(index));
        }
        self.lists.push(BlockList::new(index, piece_len, block_len));
        self.events.on_queued(index);
        Ok(self.lists.last_mut().unwrap())
    }

    pub fn erase(&mut self, index: u32) -> Result<()> {
        let pos = self.position(index).ok_or(Error::PieceNotFound(index))?;
        self.lists.remove(pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        for list in &self.lists {
            self.events.on_canceled(list.index());
        }
        self.lists.clear();
    }

    /// Record one peer's payload for one block. The first delivery leads and
    /// its bytes are written into the chunk; a later delivery that differs
    /// from the chunk is retained for reconciliation.
    pub fn deliver(
        &mut self,
        index: u32,
        offset: u32,
        peer: SocketAddr,
        data: &[u8],
        chunk: &mut dyn PieceBuffer,
    ) -> Result<()> {
        let list = self
            .lists
            .iter_mut()
            .find(|l| l.index() == index)
            .ok_or(Error::PieceNotFound(index))?;
        let block = list
            .block_at_offset_mut(offset)
            .ok_or(Error::InvalidTransfer)?;
        if data.len() != block.span().len as usize {
            return Err(Error::InvalidTransfer);
        }
        block.insert_transfer(peer);
        if block.leader_index().is_none() {
            chunk.copy_from(block.span().offset, data);
            block.record_payload(peer, None);
        } else {
            let conflicting = if chunk.compare(block.span().offset, data) {
                None
            } else {
                trace!(piece = index, offset, %peer, "payload differs from leader");
                Some(data.to_vec())
            };
            block.record_payload(peer, conflicting);
        }
        Ok(())
    }

    /// Idempotent completion of one transfer. Emits `on_completed` when this
    /// call finished the last outstanding block of the piece.
    pub fn finished(&mut self, index: u32, offset: u32, peer: SocketAddr) -> Result<()> {
        let list = self
            .lists
            .iter_mut()
            .find(|l| l.index() == index)
            .ok_or(Error::InvalidTransfer)?;
        let block = list
            .block_at_offset_mut(offset)
            .ok_or(Error::InvalidTransfer)?;
        let crossed = block.completed(peer).ok_or(Error::InvalidTransfer)?;
        if crossed && list.is_all_finished() {
            let index = list.index();
            self.events.on_completed(index);
        }
        Ok(())
    }

    pub fn hash_succeeded(&mut self, index: u32, chunk: &dyn PieceBuffer) -> Result<()> {
        self.hash_succeeded_at(index, chunk, now_micros())
    }

    fn hash_succeeded_at(
        &mut self,
        index: u32,
        chunk: &dyn PieceBuffer,
        now_usec: u64,
    ) -> Result<()> {
        let pos = self.position(index).ok_or(Error::PieceNotFound(index))?;
        if !self.lists[pos].is_all_finished() {
            return Err(Error::VerdictBeforeAssembly(index));
        }

        if self.lists[pos].failed() > 0 {
            mark_failed_peers(&mut self.lists[pos], chunk, &*self.events);
        }

        self.completed.push(CompletedEntry {
            at_usec: now_usec,
            index,
        });
        prune_completed(&mut self.completed, now_usec);

        self.succeeded_count += 1;
        self.lists.remove(pos);
        Ok(())
    }

    pub fn hash_failed(&mut self, index: u32, chunk: &mut dyn PieceBuffer) -> Result<()> {
        let pos = self.position(index).ok_or(Error::PieceNotFound(index))?;
        if !self.lists[pos].is_all_finished() {
            return Err(Error::VerdictBeforeAssembly(index));
        }

        self.failed_count += 1;

        if self.lists[pos].attempt() == 0 {
            let promoted = update_failed(&mut self.lists[pos], chunk);

            // Retry only when reassembly can change the chunk: a variant
            // gained ground, or some block's current payload is not the
            // preferred one. Rehashing an unchanged chunk cannot succeed.
            if promoted > 0 || reassembly_would_change(&self.lists[pos]) {
                debug!(piece = index, promoted, "retrying piece from stored payload variants");
                self.lists[pos].set_attempt(1);
                retry_most_popular(&mut self.lists[pos], chunk)?;
                self.events.on_completed(index);
                return Ok(());
            }
        }

        debug!(piece = index, "returning piece for redownload");
        self.lists[pos].do_all_failed();
        Ok(())
    }

    /// Verify the list was drained before teardown.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.lists.is_empty() {
            return Err(Error::ShutdownNonEmpty);
        }
        Ok(())
    }
}

impl Drop for TransferList {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.lists.is_empty(),
                "transfer list dropped with pieces still in flight"
            );
        }
    }
}

/// Either bump the delivery count of a stored payload variant, or record a
/// new one when the data differs from everything seen so far. Returns the
/// number of entries that were promoted into (or held onto) a contested
/// maximum.
fn update_failed(list: &mut BlockList, chunk: &dyn PieceBuffer) -> u32 {
    let mut promoted = 0u32;

    list.inc_failed();

    for block in list.blocks_mut() {
        let span = block.span();
        let leader = block.leader_index();

        // The leader's payload (what is in the chunk right now) is accounted
        // first, so its variant exists before conflicting ones.
        let order: Vec<usize> = leader
            .into_iter()
            .chain((0..block.transfers().len()).filter(|i| Some(*i) != leader))
            .collect();

        for ti in order {
            if !block.transfers()[ti].is_finished() {
                continue;
            }
            let retained: Option<Vec<u8>> =
                block.transfers()[ti].retained_data().map(|d| d.to_vec());

            let variants = block.failed_variants_or_default();
            let matched = match &retained {
                Some(d) => variants.position_of(d),
                None => variants.position_by(|entry| chunk.compare(span.offset, entry)),
            };

            let idx = match matched {
                Some(idx) => {
                    // Promoted when this entry ties the maximum while the
                    // maximum itself is contested. An entry that already was
                    // the sole maximum does not count.
                    let max = variants.max_entry().unwrap();
                    if variants.count(max) == variants.count(idx)
                        && Some(max) != variants.reverse_max_entry()
                    {
                        promoted += 1;
                    }
                    variants.bump(idx);
                    idx
                }
                None => {
                    let data = match retained {
                        Some(d) => d,
                        None => {
                            let mut buf = vec![0u8; span.len as usize];
                            chunk.copy_to(span.offset, &mut buf);
                            buf
                        }
                    };
                    variants.push(data)
                }
            };

            if Some(ti) == leader {
                variants.set_current(Some(idx));
            }
            block.transfers_mut()[ti].set_failed_index(idx as u32);
        }
    }

    promoted
}

fn reassembly_would_change(list: &BlockList) -> bool {
    list.blocks().iter().any(|b| match b.failed_variants() {
        Some(v) => v.reverse_max_entry() != v.current(),
        None => false,
    })
}

/// Copy the payload with the largest delivery count back into the chunk for
/// every block where it is not already there.
fn retry_most_popular(list: &mut BlockList, chunk: &mut dyn PieceBuffer) -> Result<()> {
    let index = list.index();
    for block in list.blocks_mut() {
        let span = block.span();
        let variants = block.failed_variants_or_default();
        let best = variants
            .reverse_max_entry()
            .ok_or(Error::MissingVariant(index))?;
        if variants.current() == Some(best) {
            continue;
        }
        chunk.copy_from(span.offset, variants.data(best));
        variants.set_current(Some(best));
    }
    Ok(())
}

/// The chunk verified, but only after multi-variant reconciliation: every
/// transfer that matched a payload other than the verified one came from a
/// peer that fed us garbage.
fn mark_failed_peers(list: &mut BlockList, chunk: &dyn PieceBuffer, events: &dyn TransferEvents) {
    let mut bad_peers = BTreeSet::new();

    for block in list.blocks_mut() {
        let span = block.span();
        let good = {
            let variants = block.failed_variants_or_default();
            let good = variants.position_by(|d| chunk.compare(span.offset, d));
            variants.set_current(good);
            good
        };

        for transfer in block.transfers() {
            if let Some(fi) = transfer.failed_index() {
                if good != Some(fi as usize) {
                    bad_peers.insert(transfer.peer());
                }
            }
        }
    }

    for peer in bad_peers {
        events.on_corrupt(peer);
    }
}

fn prune_completed(list: &mut Vec<CompletedEntry>, now_usec: u64) {
    let Some(front) = list.first() else {
        return;
    };
    // Prune rarely, retain generously: a consumer polling every half hour
    // never misses an entry.
    if front.at_usec + COMPLETED_PRUNE_TRIGGER_USEC < now_usec {
        let cutoff = now_usec.saturating_sub(COMPLETED_RETAIN_USEC);
        let keep_from = list
            .iter()
            .position(|e| e.at_usec >= cutoff)
            .unwrap_or(list.len());
        list.drain(..keep_from);
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
