use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    DEFAULT_MIN_INTERVAL, DEFAULT_NORMAL_INTERVAL, ScrapeTotals, ServerFields, TrackerEvent,
    TrackerId, TrackerOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Http {
        /// The URL's last path segment is `/announce`, so a scrape variant
        /// exists.
        can_scrape: bool,
        /// The URL already carries a query string; append with `&`.
        drop_delimiter: bool,
    },
    Udp,
    Dht,
}

impl TrackerKind {
    pub const fn name(&self) -> &'static str {
        match self {
            TrackerKind::Http { .. } => "http",
            TrackerKind::Udp => "udp",
            TrackerKind::Dht => "dht",
        }
    }
}

/// Where a transport task reports its result. Disowning clears the slot, so
/// a completion that arrives after the tracker moved on is dropped silently.
pub(crate) struct OutcomeSlot {
    disowned: AtomicBool,
    tx: UnboundedSender<TrackerOutcome>,
}

impl OutcomeSlot {
    pub(crate) fn new(tx: UnboundedSender<TrackerOutcome>) -> Arc<Self> {
        Arc::new(Self {
            disowned: AtomicBool::new(false),
            tx,
        })
    }

    pub(crate) fn deliver(&self, outcome: TrackerOutcome) {
        if self.disowned.load(Ordering::Acquire) {
            trace!(tracker = outcome.tracker.0, "dropping outcome of a disowned request");
            return;
        }
        let _ = self.tx.send(outcome);
    }

    fn disown(&self) {
        self.disowned.store(true, Ordering::Release);
    }
}

pub(crate) struct InflightRequest {
    pub(crate) cancel: CancellationToken,
    pub(crate) slot: Arc<OutcomeSlot>,
}

/// A single announce endpoint with its per-endpoint state: tier, health
/// counters, server-supplied intervals and scrape totals.
pub struct Tracker {
    id: TrackerId,
    url: String,
    kind: TrackerKind,
    group: u32,
    enabled: bool,
    extra: bool,
    latest_event: TrackerEvent,

    success_counter: u32,
    failed_counter: u32,
    scrape_counter: u32,
    request_counter: u32,

    success_time_last: u64,
    failed_time_last: u64,
    scrape_time_last: u64,

    normal_interval: u32,
    min_interval: u32,
    tracker_id: Option<String>,

    scrape_complete: u32,
    scrape_incomplete: u32,
    scrape_downloaded: u32,

    latest_sum_peers: u32,
    latest_new_peers: u32,

    inflight: Option<InflightRequest>,
}

impl Tracker {
    pub(crate) fn new(id: TrackerId, url: String, kind: TrackerKind, extra: bool) -> Self {
        Self {
            id,
            url,
            kind,
            group: 0,
            enabled: true,
            extra,
            latest_event: TrackerEvent::None,
            success_counter: 0,
            failed_counter: 0,
            scrape_counter: 0,
            request_counter: 0,
            success_time_last: 0,
            failed_time_last: 0,
            scrape_time_last: 0,
            normal_interval: DEFAULT_NORMAL_INTERVAL,
            min_interval: DEFAULT_MIN_INTERVAL,
            tracker_id: None,
            scrape_complete: 0,
            scrape_incomplete: 0,
            scrape_downloaded: 0,
            latest_sum_peers: 0,
            latest_new_peers: 0,
            inflight: None,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: u32) {
        self.group = group;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_extra(&self) -> bool {
        self.extra
    }

    pub fn latest_event(&self) -> TrackerEvent {
        self.latest_event
    }

    pub(crate) fn set_latest_event(&mut self, event: TrackerEvent) {
        self.latest_event = event;
    }

    pub fn can_scrape(&self) -> bool {
        matches!(
            self.kind,
            TrackerKind::Http {
                can_scrape: true,
                ..
            }
        )
    }

    pub fn is_usable(&self) -> bool {
        self.enabled
    }

    pub fn is_busy(&self) -> bool {
        self.inflight.is_some()
    }

    pub fn is_busy_not_scrape(&self) -> bool {
        self.is_busy() && self.latest_event != TrackerEvent::Scrape
    }

    pub fn can_request_state(&self) -> bool {
        self.is_usable() && !self.is_busy_not_scrape()
    }

    pub fn success_counter(&self) -> u32 {
        self.success_counter
    }

    pub fn failed_counter(&self) -> u32 {
        self.failed_counter
    }

    pub fn scrape_counter(&self) -> u32 {
        self.scrape_counter
    }

    pub fn request_counter(&self) -> u32 {
        self.request_counter
    }

    pub(crate) fn inc_request_counter(&mut self) {
        self.request_counter += 1;
    }

    pub fn success_time_last(&self) -> u64 {
        self.success_time_last
    }

    pub fn failed_time_last(&self) -> u64 {
        self.failed_time_last
    }

    pub fn scrape_time_last(&self) -> u64 {
        self.scrape_time_last
    }

    /// When this tracker would be due again after a success.
    pub fn success_time_next(&self) -> u64 {
        if self.success_counter == 0 {
            return 0;
        }
        self.success_time_last + self.normal_interval as u64
    }

    /// When this tracker deserves another try after failing; backs off with
    /// the consecutive failure count.
    pub fn failed_time_next(&self) -> u64 {
        if self.failed_counter == 0 {
            return 0;
        }
        self.failed_time_last + failed_backoff_seconds(self.failed_counter)
    }

    pub fn normal_interval(&self) -> u32 {
        self.normal_interval
    }

    pub fn min_interval(&self) -> u32 {
        self.min_interval
    }

    pub(crate) fn set_normal_interval(&mut self, seconds: u32) {
        self.normal_interval = seconds.clamp(60, 8 * 3600);
    }

    pub(crate) fn set_min_interval(&mut self, seconds: u32) {
        self.min_interval = seconds.clamp(60, 4 * 3600);
    }

    pub fn tracker_id(&self) -> Option<&str> {
        self.tracker_id.as_deref()
    }

    pub fn scrape_complete(&self) -> u32 {
        self.scrape_complete
    }

    pub fn scrape_incomplete(&self) -> u32 {
        self.scrape_incomplete
    }

    pub fn scrape_downloaded(&self) -> u32 {
        self.scrape_downloaded
    }

    pub fn latest_sum_peers(&self) -> u32 {
        self.latest_sum_peers
    }

    pub fn latest_new_peers(&self) -> u32 {
        self.latest_new_peers
    }

    pub(crate) fn set_latest_new_peers(&mut self, n: u32) {
        self.latest_new_peers = n;
    }

    pub(crate) fn note_success(&mut self, now: u64, sum_peers: u32) {
        self.success_time_last = now;
        self.success_counter += 1;
        self.failed_counter = 0;
        self.latest_sum_peers = sum_peers;
    }

    pub(crate) fn note_failed(&mut self, now: u64) {
        self.failed_time_last = now;
        self.failed_counter += 1;
    }

    pub(crate) fn note_scrape(&mut self, now: u64) {
        self.scrape_time_last = now;
        self.scrape_counter += 1;
    }

    /// Absorb whatever the server volunteered, success or not.
    pub(crate) fn merge_server_fields(&mut self, fields: &ServerFields, now: u64) {
        if let Some(interval) = fields.normal_interval {
            self.set_normal_interval(interval);
        }
        if let Some(interval) = fields.min_interval {
            self.set_min_interval(interval);
        }
        if let Some(tracker_id) = &fields.tracker_id {
            self.tracker_id = Some(tracker_id.clone());
        }
        if let (Some(complete), Some(incomplete)) = (fields.complete, fields.incomplete) {
            self.scrape_complete = complete;
            self.scrape_incomplete = incomplete;
            self.scrape_time_last = now;
        }
        if let Some(downloaded) = fields.downloaded {
            self.scrape_downloaded = downloaded;
        }
    }

    pub(crate) fn merge_scrape_totals(&mut self, totals: ScrapeTotals) {
        self.scrape_complete = totals.complete;
        self.scrape_incomplete = totals.incomplete;
        self.scrape_downloaded = totals.downloaded;
    }

    pub(crate) fn set_inflight(&mut self, request: InflightRequest) {
        self.inflight = Some(request);
    }

    pub(crate) fn take_inflight(&mut self) -> Option<InflightRequest> {
        self.inflight.take()
    }

    /// Abort the in-flight request; no callback will fire.
    pub fn close(&mut self) {
        if let Some(request) = self.inflight.take() {
            debug!(
                event = %self.latest_event,
                url = %self.url,
                "request cancelled"
            );
            request.cancel.cancel();
        }
    }

    /// Detach the in-flight request so this tracker can move on without
    /// waiting; the request completes against a dead slot.
    pub fn disown(&mut self) {
        if let Some(request) = self.inflight.take() {
            debug!(
                event = %self.latest_event,
                url = %self.url,
                "request disowned"
            );
            request.slot.disown();
        }
    }

    pub(crate) fn clear_stats(&mut self) {
        self.success_counter = 0;
        self.failed_counter = 0;
        self.scrape_counter = 0;
        self.latest_sum_peers = 0;
        self.latest_new_peers = 0;
    }
}

fn failed_backoff_seconds(failed_counter: u32) -> u64 {
    (20u64 << (failed_counter.min(6) - 1)).min(600)
}

#[cfg(test)]
mod tests {
    use super::failed_backoff_seconds;

    #[test]
    fn test_failed_backoff_doubles_and_caps() {
        assert_eq!(failed_backoff_seconds(1), 20);
        assert_eq!(failed_backoff_seconds(2), 40);
        assert_eq!(failed_backoff_seconds(3), 80);
        assert_eq!(failed_backoff_seconds(6), 600);
        assert_eq!(failed_backoff_seconds(60), 600);
    }
}
