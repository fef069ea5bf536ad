use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};
use undertow_core::spawn_utils::spawn_with_cancel;

use crate::tracker::{InflightRequest, OutcomeSlot, Tracker, TrackerKind};
use crate::{
    AnnounceCtx, StatsProvider, TrackerConfig, TrackerEvent, TrackerId, TrackerOutcome,
    TrackerReply, http, now_seconds, udp,
};

/// Trackers are only scraped so often, no matter how eager the embedder is.
const SCRAPE_DAMPER_SECONDS: u64 = 10 * 60;

/// Implemented by the enclosing download; invoked on the thread that drains
/// the outcome channel.
pub trait TrackerListEvents: Send + Sync {
    /// Peers arrived. Returns how many of them were previously unknown.
    fn on_success(&self, tracker: &Tracker, addrs: &[SocketAddr]) -> u32 {
        let _ = (tracker, addrs);
        0
    }
    fn on_failed(&self, _tracker: &Tracker, _msg: &str) {}
    fn on_scrape_success(&self, _tracker: &Tracker) {}
    fn on_scrape_failed(&self, _tracker: &Tracker, _msg: &str) {}
    fn on_tracker_enabled(&self, _tracker: &Tracker) {}
    fn on_tracker_disabled(&self, _tracker: &Tracker) {}
}

impl TrackerListEvents for () {}

/// Ordered list of trackers grouped by tier. Order within a tier matters:
/// the head is tried first, success promotes a tracker to the head, and a
/// stale tier can be rotated one step.
pub struct TrackerList {
    trackers: Vec<Tracker>,
    next_id: u64,
    config: TrackerConfig,
    ctx: AnnounceCtx,
    stats: Arc<dyn StatsProvider>,
    events: Arc<dyn TrackerListEvents>,
    outcome_tx: UnboundedSender<TrackerOutcome>,
    http_client: reqwest::Client,
}

impl TrackerList {
    /// The returned receiver carries transport completions; the embedder
    /// drains it on its main loop and feeds each outcome to [`Self::apply`].
    pub fn new(
        ctx: AnnounceCtx,
        config: TrackerConfig,
        stats: Arc<dyn StatsProvider>,
        events: Arc<dyn TrackerListEvents>,
        http_client: reqwest::Client,
    ) -> (Self, UnboundedReceiver<TrackerOutcome>) {
        let (outcome_tx, outcome_rx) = unbounded_channel();
        (
            Self {
                trackers: Vec::new(),
                next_id: 0,
                config,
                ctx,
                stats,
                events,
                outcome_tx,
                http_client,
            },
            outcome_rx,
        )
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Tracker> {
        self.trackers.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter()
    }

    pub fn position(&self, id: TrackerId) -> Option<usize> {
        self.trackers.iter().position(|t| t.id() == id)
    }

    pub fn tracker(&self, id: TrackerId) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.id() == id)
    }

    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy)
    }

    pub fn has_active_not_scrape(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy_not_scrape)
    }

    pub fn has_usable(&self) -> bool {
        self.trackers.iter().any(Tracker::is_usable)
    }

    pub fn count_active(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_busy()).count()
    }

    pub fn count_usable(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_usable()).count()
    }

    pub fn find_url(&self, url: &str) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.url() == url)
    }

    pub fn clear_stats(&mut self) {
        for tracker in &mut self.trackers {
            tracker.clear_stats();
        }
    }

    fn begin_group(&self, group: u32) -> usize {
        self.trackers
            .iter()
            .position(|t| t.group() >= group)
            .unwrap_or(self.trackers.len())
    }

    fn end_group(&self, group: u32) -> usize {
        self.trackers.partition_point(|t| t.group() <= group)
    }

    /// Append a tracker to its tier (after the tier's last element).
    pub fn insert(&mut self, group: u32, url: String, kind: TrackerKind, extra: bool) -> TrackerId {
        let id = TrackerId(self.next_id);
        self.next_id += 1;

        let mut tracker = Tracker::new(id, url, kind, extra);
        tracker.set_group(group);

        let pos = self.end_group(group);
        self.trackers.insert(pos, tracker);

        debug!(
            group,
            kind = self.trackers[pos].kind().name(),
            url = self.trackers[pos].url(),
            "tracker added"
        );
        self.events.on_tracker_enabled(&self.trackers[pos]);
        id
    }

    /// Pick the transport from the URL scheme and append the tracker to its
    /// tier. Unknown schemes are dropped with a warning, unless the tracker
    /// was explicitly requested, which makes them a caller error.
    pub fn insert_url(
        &mut self,
        group: u32,
        url: &str,
        extra: bool,
    ) -> anyhow::Result<Option<TrackerId>> {
        let kind = if url.starts_with("http://") || url.starts_with("https://") {
            TrackerKind::Http {
                can_scrape: http::can_scrape(url),
                drop_delimiter: http::drop_delimiter(url),
            }
        } else if url.starts_with("udp://") {
            TrackerKind::Udp
        } else if url.starts_with("dht://") && self.config.dht_allowed {
            TrackerKind::Dht
        } else {
            warn!(url, "no matching tracker protocol");
            if extra {
                bail!("no matching tracker protocol (url:{url})");
            }
            return Ok(None);
        };

        Ok(Some(self.insert(group, url.to_owned(), kind, extra)))
    }

    pub fn enable(&mut self, id: TrackerId) {
        let Some(idx) = self.position(id) else { return };
        if self.trackers[idx].is_enabled() {
            return;
        }
        self.trackers[idx].set_enabled(true);
        self.events.on_tracker_enabled(&self.trackers[idx]);
    }

    pub fn disable(&mut self, id: TrackerId) {
        let Some(idx) = self.position(id) else { return };
        if !self.trackers[idx].is_enabled() {
            return;
        }
        self.trackers[idx].close();
        self.trackers[idx].set_enabled(false);
        self.events.on_tracker_disabled(&self.trackers[idx]);
    }

    /// Dispatch an announce with the given event. No-op when the tracker is
    /// unusable or already announcing; an in-flight scrape is closed to make
    /// room.
    pub fn send_state(&mut self, id: TrackerId, event: TrackerEvent) {
        let Some(idx) = self.position(id) else { return };

        if !self.trackers[idx].is_usable() || event == TrackerEvent::Scrape {
            return;
        }
        if self.trackers[idx].is_busy() {
            if self.trackers[idx].latest_event() != TrackerEvent::Scrape {
                return;
            }
            self.trackers[idx].close();
        }

        self.trackers[idx].set_latest_event(event);
        self.trackers[idx].inc_request_counter();
        debug!(
            event = %event,
            group = self.trackers[idx].group(),
            url = self.trackers[idx].url(),
            "sending announce"
        );

        match self.trackers[idx].kind() {
            TrackerKind::Http { drop_delimiter, .. } => {
                self.spawn_http_announce(idx, event, drop_delimiter)
            }
            TrackerKind::Udp => self.spawn_udp_announce(idx, event),
            TrackerKind::Dht => {
                debug!(url = self.trackers[idx].url(), "announce delegated to the dht subsystem");
            }
        }
    }

    /// Dispatch a scrape. No-op when busy, unusable, not scrape-capable, or
    /// scraped recently.
    pub fn send_scrape(&mut self, id: TrackerId) {
        let Some(idx) = self.position(id) else { return };

        if self.trackers[idx].is_busy() || !self.trackers[idx].is_usable() {
            return;
        }
        if !self.trackers[idx].can_scrape() {
            return;
        }
        if self.trackers[idx].scrape_time_last() + SCRAPE_DAMPER_SECONDS > now_seconds() {
            return;
        }

        self.trackers[idx].set_latest_event(TrackerEvent::Scrape);
        self.trackers[idx].inc_request_counter();
        debug!(
            group = self.trackers[idx].group(),
            url = self.trackers[idx].url(),
            "sending scrape"
        );

        let TrackerKind::Http { drop_delimiter, .. } = self.trackers[idx].kind() else {
            return;
        };
        let (cancel, slot) = self.make_inflight(idx);
        let id = self.trackers[idx].id();
        let url = self.trackers[idx].url().to_owned();
        let client = self.http_client.clone();
        let info_hash = self.ctx.info_hash;
        let timeout = self.config.announce_timeout;

        spawn_with_cancel(
            debug_span!("http_tracker_scrape", url = %url),
            cancel,
            async move {
                let reply = http::scrape(&client, &url, drop_delimiter, &info_hash, timeout).await;
                slot.deliver(TrackerOutcome { tracker: id, reply });
                Ok::<_, anyhow::Error>(())
            },
        );
    }

    fn make_inflight(&mut self, idx: usize) -> (CancellationToken, Arc<OutcomeSlot>) {
        let cancel = CancellationToken::new();
        let slot = OutcomeSlot::new(self.outcome_tx.clone());
        self.trackers[idx].set_inflight(InflightRequest {
            cancel: cancel.clone(),
            slot: slot.clone(),
        });
        (cancel, slot)
    }

    fn spawn_http_announce(&mut self, idx: usize, event: TrackerEvent, drop_delimiter: bool) {
        let (cancel, slot) = self.make_inflight(idx);
        let id = self.trackers[idx].id();
        let url = self.trackers[idx].url().to_owned();
        let tracker_id = self.trackers[idx].tracker_id().map(str::to_owned);
        let client = self.http_client.clone();
        let ctx = self.ctx.clone();
        let stats = self.stats.stats();
        let timeout = self.config.announce_timeout;

        spawn_with_cancel(debug_span!("http_tracker", url = %url), cancel, async move {
            let reply = http::announce(
                &client,
                &url,
                drop_delimiter,
                &ctx,
                stats,
                event,
                tracker_id.as_deref(),
                timeout,
            )
            .await;
            slot.deliver(TrackerOutcome { tracker: id, reply });
            Ok::<_, anyhow::Error>(())
        });
    }

    fn spawn_udp_announce(&mut self, idx: usize, event: TrackerEvent) {
        let (cancel, slot) = self.make_inflight(idx);
        let id = self.trackers[idx].id();
        let url = self.trackers[idx].url().to_owned();
        let ctx = self.ctx.clone();
        let stats = self.stats.stats();
        let config = self.config.clone();

        spawn_with_cancel(debug_span!("udp_tracker", url = %url), cancel, async move {
            let reply = udp::announce(&url, &ctx, stats, event, &config).await;
            slot.deliver(TrackerOutcome { tracker: id, reply });
            Ok::<_, anyhow::Error>(())
        });
    }

    /// Close every tracker whose latest event is NOT in the mask.
    pub fn close_all_excluding(&mut self, event_mask: u32) {
        for tracker in &mut self.trackers {
            if event_mask & tracker.latest_event().bit() != 0 {
                continue;
            }
            tracker.close();
        }
    }

    pub fn close_all(&mut self) {
        self.close_all_excluding(0);
    }

    /// Disown every tracker whose latest event IS in the mask.
    pub fn disown_all_including(&mut self, event_mask: u32) {
        for tracker in &mut self.trackers {
            if event_mask & tracker.latest_event().bit() != 0 {
                tracker.disown();
            }
        }
    }

    /// Walk from `from` looking for the tracker to try next: the first
    /// never-failed usable one wins outright; otherwise the failing tracker
    /// that is due soonest, unless a later healthy one is due before that.
    pub fn find_next_to_request(&self, from: usize) -> Option<usize> {
        let mut preferred = (from..self.trackers.len())
            .find(|&i| self.trackers[i].can_request_state())?;

        if self.trackers[preferred].failed_counter() == 0 {
            return Some(preferred);
        }

        for i in preferred + 1..self.trackers.len() {
            let t = &self.trackers[i];
            if !t.can_request_state() {
                continue;
            }
            if t.failed_counter() != 0 {
                if t.failed_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
            } else {
                if t.success_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
                break;
            }
        }

        Some(preferred)
    }

    /// Swap the tracker to the head of its tier. Returns its new position.
    pub fn promote(&mut self, idx: usize) -> usize {
        let first = self.begin_group(self.trackers[idx].group());
        self.trackers.swap(first, idx);
        first
    }

    /// Rotate a tier one step: the head moves to the tail.
    pub fn cycle_group(&mut self, group: u32) {
        let start = self.begin_group(group);
        if start >= self.trackers.len() || self.trackers[start].group() != group {
            return;
        }
        let mut i = start;
        while i + 1 < self.trackers.len() && self.trackers[i + 1].group() == group {
            self.trackers.swap(i, i + 1);
            i += 1;
        }
    }

    /// Shuffle each tier independently. Run once at startup so load spreads
    /// across mirrors of the same tier.
    pub fn randomize_group_entries(&mut self) {
        let mut rng = rand::rng();
        let mut start = 0;
        while start < self.trackers.len() {
            let group = self.trackers[start].group();
            let end = self.end_group(group);
            self.trackers[start..end].shuffle(&mut rng);
            start = end;
        }
    }

    /// Route one transport completion to the right receive path. Outcomes
    /// for closed or removed trackers are dropped, which is what makes
    /// `close` fire no callback.
    pub fn apply(&mut self, outcome: TrackerOutcome) -> anyhow::Result<()> {
        let Some(idx) = self.position(outcome.tracker) else {
            trace!("outcome for a removed tracker, dropping");
            return Ok(());
        };
        if self.trackers[idx].take_inflight().is_none() {
            trace!(
                url = self.trackers[idx].url(),
                "outcome for an idle tracker, dropping"
            );
            return Ok(());
        }

        let scrape = self.trackers[idx].latest_event() == TrackerEvent::Scrape;
        match outcome.reply {
            TrackerReply::Announce { fields, addrs } => {
                self.trackers[idx].merge_server_fields(&fields, now_seconds());
                self.receive_success(outcome.tracker, addrs)
            }
            TrackerReply::Scrape { totals } => {
                self.trackers[idx].merge_scrape_totals(totals);
                self.receive_scrape_success(outcome.tracker)
            }
            TrackerReply::Failure { message, fields } => {
                if scrape {
                    self.receive_scrape_failed(outcome.tracker, &message)
                } else {
                    // A failing announce can still carry usable fields.
                    self.trackers[idx].merge_server_fields(&fields, now_seconds());
                    self.receive_failed(outcome.tracker, &message)
                }
            }
        }
    }

    /// Account a successful announce: promote within the tier, dedup and
    /// sort the addresses, refresh counters, hand the peers up.
    pub fn receive_success(
        &mut self,
        id: TrackerId,
        mut addrs: Vec<SocketAddr>,
    ) -> anyhow::Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| anyhow::anyhow!("tracker is not in the list"))?;
        if self.trackers[idx].is_busy() {
            bail!("receive_success called on a busy tracker");
        }

        let idx = self.promote(idx);

        addrs.sort();
        addrs.dedup();

        debug!(
            peers = addrs.len(),
            url = self.trackers[idx].url(),
            "received peers"
        );

        self.trackers[idx].note_success(now_seconds(), addrs.len() as u32);
        let new_peers = self.events.on_success(&self.trackers[idx], &addrs);
        self.trackers[idx].set_latest_new_peers(new_peers);
        Ok(())
    }

    pub fn receive_failed(&mut self, id: TrackerId, msg: &str) -> anyhow::Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| anyhow::anyhow!("tracker is not in the list"))?;
        if self.trackers[idx].is_busy() {
            bail!("receive_failed called on a busy tracker");
        }

        debug!(
            url = self.trackers[idx].url(),
            msg, "failed to connect to tracker"
        );

        self.trackers[idx].note_failed(now_seconds());
        self.events.on_failed(&self.trackers[idx], msg);
        Ok(())
    }

    pub fn receive_scrape_success(&mut self, id: TrackerId) -> anyhow::Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| anyhow::anyhow!("tracker is not in the list"))?;
        if self.trackers[idx].is_busy() {
            bail!("receive_scrape_success called on a busy tracker");
        }

        debug!(url = self.trackers[idx].url(), "received scrape");

        self.trackers[idx].note_scrape(now_seconds());
        self.events.on_scrape_success(&self.trackers[idx]);
        Ok(())
    }

    pub fn receive_scrape_failed(&mut self, id: TrackerId, msg: &str) -> anyhow::Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| anyhow::anyhow!("tracker is not in the list"))?;
        if self.trackers[idx].is_busy() {
            bail!("receive_scrape_failed called on a busy tracker");
        }

        debug!(
            url = self.trackers[idx].url(),
            msg, "failed to scrape tracker"
        );

        self.events.on_scrape_failed(&self.trackers[idx], msg);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn make_busy(
        &mut self,
        id: TrackerId,
        event: TrackerEvent,
    ) -> Arc<OutcomeSlot> {
        let idx = self.position(id).unwrap();
        let slot = OutcomeSlot::new(self.outcome_tx.clone());
        self.trackers[idx].set_latest_event(event);
        self.trackers[idx].set_inflight(InflightRequest {
            cancel: CancellationToken::new(),
            slot: slot.clone(),
        });
        slot
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{TrackerList, TrackerListEvents};
    use crate::tracker::Tracker;
    use crate::{
        AnnounceCtx, ScrapeTotals, ServerFields, TrackerConfig, TrackerEvent, TrackerId,
        TrackerOutcome, TrackerReply,
    };
    use undertow_core::hash_id::Id20;

    #[derive(Default)]
    struct RecordingEvents {
        success: Mutex<Vec<(String, Vec<SocketAddr>)>>,
        failed: Mutex<Vec<(String, String)>>,
        scrape_success: Mutex<Vec<String>>,
        scrape_failed: Mutex<Vec<(String, String)>>,
        enabled: Mutex<Vec<String>>,
    }

    impl TrackerListEvents for RecordingEvents {
        fn on_success(&self, tracker: &Tracker, addrs: &[SocketAddr]) -> u32 {
            self.success
                .lock()
                .push((tracker.url().to_owned(), addrs.to_vec()));
            addrs.len() as u32
        }
        fn on_failed(&self, tracker: &Tracker, msg: &str) {
            self.failed
                .lock()
                .push((tracker.url().to_owned(), msg.to_owned()));
        }
        fn on_scrape_success(&self, tracker: &Tracker) {
            self.scrape_success.lock().push(tracker.url().to_owned());
        }
        fn on_scrape_failed(&self, tracker: &Tracker, msg: &str) {
            self.scrape_failed
                .lock()
                .push((tracker.url().to_owned(), msg.to_owned()));
        }
        fn on_tracker_enabled(&self, tracker: &Tracker) {
            self.enabled.lock().push(tracker.url().to_owned());
        }
    }

    fn new_list(
        config: TrackerConfig,
    ) -> (
        TrackerList,
        Arc<RecordingEvents>,
        tokio::sync::mpsc::UnboundedReceiver<TrackerOutcome>,
    ) {
        let events = Arc::new(RecordingEvents::default());
        let ctx = AnnounceCtx::new(Id20::new([7u8; 20]), Id20::new([9u8; 20]), 6881);
        let (list, rx) = TrackerList::new(
            ctx,
            config,
            Arc::new(()),
            events.clone(),
            reqwest::Client::new(),
        );
        (list, events, rx)
    }

    fn urls(list: &TrackerList) -> Vec<&str> {
        list.iter().map(|t| t.url()).collect()
    }

    #[test]
    fn test_insert_url_scheme_dispatch() {
        let (mut list, events, _rx) = new_list(TrackerConfig::default());

        let http = list
            .insert_url(0, "http://a.example.com/announce", false)
            .unwrap()
            .unwrap();
        let udp = list
            .insert_url(0, "udp://b.example.com:6969", false)
            .unwrap()
            .unwrap();

        assert!(list.tracker(http).unwrap().can_scrape());
        assert!(!list.tracker(udp).unwrap().can_scrape());

        // DHT is gated globally.
        assert!(list.insert_url(0, "dht://c.example.com", false).unwrap().is_none());

        // Unknown schemes are dropped, unless explicitly requested.
        assert!(list.insert_url(0, "gopher://d.example.com", false).unwrap().is_none());
        assert!(list.insert_url(0, "gopher://d.example.com", true).is_err());

        assert_eq!(list.len(), 2);
        assert_eq!(events.enabled.lock().len(), 2);
        assert_eq!(list.count_usable(), 2);
    }

    #[test]
    fn test_tiers_stay_grouped_and_ordered() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        list.insert_url(1, "http://t1a/announce", false).unwrap();
        list.insert_url(0, "http://t0a/announce", false).unwrap();
        list.insert_url(1, "http://t1b/announce", false).unwrap();
        list.insert_url(0, "http://t0b/announce", false).unwrap();

        assert_eq!(
            urls(&list),
            vec![
                "http://t0a/announce",
                "http://t0b/announce",
                "http://t1a/announce",
                "http://t1b/announce"
            ]
        );
    }

    #[test]
    fn test_cycle_group_is_identity_after_full_rotation() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        for name in ["a", "b", "c"] {
            list.insert_url(0, &format!("http://{name}/announce"), false)
                .unwrap();
        }
        list.insert_url(1, "http://z/announce", false).unwrap();

        let before: Vec<String> = urls(&list).iter().map(|s| s.to_string()).collect();
        list.cycle_group(0);
        assert_eq!(
            urls(&list),
            vec![
                "http://b/announce",
                "http://c/announce",
                "http://a/announce",
                "http://z/announce"
            ]
        );
        list.cycle_group(0);
        list.cycle_group(0);
        assert_eq!(urls(&list), before.iter().map(String::as_str).collect::<Vec<_>>());

        // Rotating a tier that does not exist is a no-op.
        list.cycle_group(9);
        assert_eq!(urls(&list), before.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_failover_promotes_the_survivor() {
        let (mut list, events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();
        let b = list.insert_url(0, "http://b/announce", false).unwrap().unwrap();
        let c = list.insert_url(0, "http://c/announce", false).unwrap().unwrap();

        list.receive_failed(a, "connection refused").unwrap();
        list.receive_failed(b, "connection refused").unwrap();
        list.receive_success(c, vec!["10.0.0.2:6881".parse().unwrap()])
            .unwrap();

        assert_eq!(
            urls(&list),
            vec!["http://c/announce", "http://b/announce", "http://a/announce"]
        );
        assert_eq!(list.tracker(c).unwrap().success_counter(), 1);
        assert_eq!(list.tracker(c).unwrap().failed_counter(), 0);
        assert_eq!(list.tracker(a).unwrap().failed_counter(), 1);
        assert_eq!(events.failed.lock().len(), 2);
        assert_eq!(events.success.lock().len(), 1);
    }

    #[test]
    fn test_receive_success_sorts_and_dedups_addresses() {
        let (mut list, events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();

        let addrs: Vec<SocketAddr> = vec![
            "10.0.0.9:6881".parse().unwrap(),
            "10.0.0.1:6881".parse().unwrap(),
            "10.0.0.9:6881".parse().unwrap(),
        ];
        list.receive_success(a, addrs).unwrap();

        let recorded = events.success.lock();
        assert_eq!(
            recorded[0].1,
            vec![
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.9:6881".parse().unwrap()
            ]
        );
        assert_eq!(list.tracker(a).unwrap().latest_sum_peers(), 2);
        assert_eq!(list.tracker(a).unwrap().latest_new_peers(), 2);
    }

    #[test]
    fn test_find_next_to_request_prefers_never_failed() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();
        let _b = list.insert_url(0, "http://b/announce", false).unwrap().unwrap();

        assert_eq!(list.find_next_to_request(0), Some(0));
        assert_eq!(list.find_next_to_request(1), Some(1));

        // The head failed: the healthy one behind it wins.
        list.receive_failed(a, "timeout").unwrap();
        assert_eq!(list.find_next_to_request(0), Some(1));
        // Identical state, identical answer.
        assert_eq!(list.find_next_to_request(0), Some(1));
    }

    #[test]
    fn test_find_next_to_request_picks_soonest_retry_among_failed() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();
        let b = list.insert_url(0, "http://b/announce", false).unwrap().unwrap();

        // a failed twice (longer backoff), b once.
        list.receive_failed(a, "timeout").unwrap();
        list.receive_failed(a, "timeout").unwrap();
        list.receive_failed(b, "timeout").unwrap();

        let next = list.find_next_to_request(0).unwrap();
        assert_eq!(list.get(next).unwrap().id(), b);
    }

    #[test]
    fn test_close_and_disown_by_event_mask() {
        let (mut list, _events, mut rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();
        let b = list.insert_url(0, "http://b/announce", false).unwrap().unwrap();

        list.make_busy(a, TrackerEvent::Started);
        let scrape_slot = list.make_busy(b, TrackerEvent::Scrape);
        assert_eq!(list.count_active(), 2);
        assert!(list.has_active_not_scrape());

        // Keep announces, close the scrape.
        list.close_all_excluding(
            TrackerEvent::Started.bit()
                | TrackerEvent::Stopped.bit()
                | TrackerEvent::Completed.bit(),
        );
        assert!(list.tracker(a).unwrap().is_busy());
        assert!(!list.tracker(b).unwrap().is_busy());

        // Disown the announce; its late completion goes nowhere.
        let started_slot = list.make_busy(a, TrackerEvent::Started);
        list.disown_all_including(TrackerEvent::Started.bit());
        assert!(!list.tracker(a).unwrap().is_busy());

        started_slot.deliver(TrackerOutcome {
            tracker: a,
            reply: TrackerReply::Scrape {
                totals: ScrapeTotals::default(),
            },
        });
        assert!(rx.try_recv().is_err());

        // A slot that was merely closed still delivers, but apply drops the
        // outcome because the tracker is idle.
        scrape_slot.deliver(TrackerOutcome {
            tracker: b,
            reply: TrackerReply::Failure {
                message: "late".into(),
                fields: ServerFields::default(),
            },
        });
        let outcome = rx.try_recv().unwrap();
        list.apply(outcome).unwrap();
        assert_eq!(list.tracker(b).unwrap().failed_counter(), 0);
    }

    #[test]
    fn test_apply_routes_by_latest_event() {
        let (mut list, events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();

        list.make_busy(a, TrackerEvent::Started);
        list.apply(TrackerOutcome {
            tracker: a,
            reply: TrackerReply::Announce {
                fields: ServerFields {
                    normal_interval: Some(300),
                    min_interval: Some(120),
                    tracker_id: Some("tid".into()),
                    complete: Some(4),
                    incomplete: Some(2),
                    downloaded: Some(11),
                },
                addrs: vec!["10.0.0.1:6881".parse().unwrap()],
            },
        })
        .unwrap();

        let t = list.tracker(a).unwrap();
        assert!(!t.is_busy());
        assert_eq!(t.normal_interval(), 300);
        assert_eq!(t.min_interval(), 120);
        assert_eq!(t.tracker_id(), Some("tid"));
        assert_eq!(t.scrape_complete(), 4);
        assert_eq!(t.scrape_incomplete(), 2);
        assert_eq!(t.scrape_downloaded(), 11);
        assert_eq!(events.success.lock().len(), 1);

        // A failed announce still absorbs server fields.
        list.make_busy(a, TrackerEvent::Started);
        list.apply(TrackerOutcome {
            tracker: a,
            reply: TrackerReply::Failure {
                message: "failure reason \"busy\"".into(),
                fields: ServerFields {
                    normal_interval: Some(777),
                    ..Default::default()
                },
            },
        })
        .unwrap();
        assert_eq!(list.tracker(a).unwrap().normal_interval(), 777);
        assert_eq!(list.tracker(a).unwrap().failed_counter(), 1);
        assert_eq!(events.failed.lock().len(), 1);

        // Scrape outcomes route to the scrape callbacks.
        list.make_busy(a, TrackerEvent::Scrape);
        list.apply(TrackerOutcome {
            tracker: a,
            reply: TrackerReply::Scrape {
                totals: ScrapeTotals {
                    complete: 1,
                    incomplete: 2,
                    downloaded: 3,
                },
            },
        })
        .unwrap();
        assert_eq!(list.tracker(a).unwrap().scrape_counter(), 1);
        assert_eq!(*events.scrape_success.lock(), vec!["http://a/announce"]);
    }

    #[test]
    fn test_scrape_damper_blocks_fresh_scrapes() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        let a = list.insert_url(0, "http://a/announce", false).unwrap().unwrap();

        list.make_busy(a, TrackerEvent::Scrape);
        list.apply(TrackerOutcome {
            tracker: a,
            reply: TrackerReply::Scrape {
                totals: ScrapeTotals::default(),
            },
        })
        .unwrap();
        let requests_before = list.tracker(a).unwrap().request_counter();

        // Just scraped: another scrape is a no-op, busy state untouched.
        list.send_scrape(a);
        assert!(!list.tracker(a).unwrap().is_busy());
        assert_eq!(list.tracker(a).unwrap().request_counter(), requests_before);
    }

    #[test]
    fn test_randomize_keeps_tier_partition() {
        let (mut list, _events, _rx) = new_list(TrackerConfig::default());
        for i in 0..5 {
            list.insert_url(0, &format!("http://t0-{i}/announce"), false)
                .unwrap();
        }
        for i in 0..5 {
            list.insert_url(1, &format!("http://t1-{i}/announce"), false)
                .unwrap();
        }

        list.randomize_group_entries();

        assert!(list.iter().take(5).all(|t| t.group() == 0));
        assert!(list.iter().skip(5).all(|t| t.group() == 1));
    }

    #[tokio::test]
    async fn test_unreachable_http_tracker_reports_failure() {
        let (mut list, events, mut rx) = new_list(TrackerConfig::default());
        // Nothing listens on port 1.
        let a = list
            .insert_url(0, "http://127.0.0.1:1/announce", false)
            .unwrap()
            .unwrap();

        list.send_state(a, TrackerEvent::Started);
        assert!(list.tracker(a).unwrap().is_busy());
        assert_eq!(list.tracker(a).unwrap().request_counter(), 1);

        // While an announce is in flight, another announce is a no-op.
        list.send_state(a, TrackerEvent::Started);
        assert_eq!(list.tracker(a).unwrap().request_counter(), 1);

        let outcome = rx.recv().await.unwrap();
        list.apply(outcome).unwrap();

        assert!(!list.tracker(a).unwrap().is_busy());
        assert_eq!(list.tracker(a).unwrap().failed_counter(), 1);
        assert_eq!(events.failed.lock().len(), 1);
    }
}
