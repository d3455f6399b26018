use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::error::Result;
use crate::market::basis::MarketBasis;
use crate::market::bid::{aggregate_bids, Bid};
use crate::market::price::BidUpdate;

/// A recorded bid with its receipt time.
#[derive(Debug, Clone)]
pub struct CachedBid {
    pub update: BidUpdate,
    pub received_at: DateTime<Utc>,
}

/// Per-child bid numbers captured when an aggregate was formed, used to
/// re-correlate a later price response to each child's own bid.
pub type BidNumberSnapshot = HashMap<Uuid, u64>;

/// An aggregate over the live bids, with the snapshot that produced it.
#[derive(Debug, Clone)]
pub struct AggregatedBid {
    pub bid: Bid,
    pub bid_numbers: BidNumberSnapshot,
}

/// Mutable aggregation state of one matcher node: the last bid received per
/// session, keyed by session id.
///
/// Entries older than the bid timeout are excluded from aggregation (absent,
/// not zero-filled) until a fresh bid replaces them; expiry is evaluated at
/// aggregation time only. Mutated by arbitrary caller tasks and read by the
/// node's scheduled task, so the owning node guards it with its own lock.
#[derive(Debug)]
pub struct BidCache {
    bids: HashMap<Uuid, CachedBid>,
    bid_timeout: Option<Duration>,
    snapshots: VecDeque<(u64, BidNumberSnapshot)>,
    max_snapshots: usize,
}

impl BidCache {
    const DEFAULT_SNAPSHOT_WINDOW: usize = 64;

    /// Creates a cache; `bid_timeout == None` means bids never expire.
    pub fn new(bid_timeout: Option<Duration>) -> Self {
        Self {
            bids: HashMap::new(),
            bid_timeout,
            snapshots: VecDeque::new(),
            max_snapshots: Self::DEFAULT_SNAPSHOT_WINDOW,
        }
    }

    /// Records the latest bid for a session, superseding the previous one.
    /// Returns the superseded bid, if any.
    pub fn update_bid(
        &mut self,
        session_id: Uuid,
        update: BidUpdate,
        now: DateTime<Utc>,
    ) -> Option<BidUpdate> {
        self.bids
            .insert(
                session_id,
                CachedBid {
                    update,
                    received_at: now,
                },
            )
            .map(|cached| cached.update)
    }

    /// Drops the bid of a departed session.
    pub fn remove_session(&mut self, session_id: &Uuid) -> Option<BidUpdate> {
        self.bids.remove(session_id).map(|cached| cached.update)
    }

    /// Last bid number recorded for a session, expiry ignored.
    pub fn last_bid_number(&self, session_id: &Uuid) -> Option<u64> {
        self.bids.get(session_id).map(|cached| cached.update.bid_number)
    }

    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    fn is_live(&self, cached: &CachedBid, now: DateTime<Utc>) -> bool {
        match self.bid_timeout {
            Some(timeout) => now - cached.received_at < timeout,
            None => true,
        }
    }

    /// Sums all non-expired bids. Returns `None` when no live bid exists —
    /// the caller publishes nothing rather than a fabricated flat curve.
    pub fn aggregate(
        &self,
        market_basis: &MarketBasis,
        now: DateTime<Utc>,
    ) -> Result<Option<AggregatedBid>> {
        let mut bid_numbers = BidNumberSnapshot::new();
        let mut live = Vec::new();
        for (session_id, cached) in &self.bids {
            if !self.is_live(cached, now) {
                continue;
            }
            bid_numbers.insert(*session_id, cached.update.bid_number);
            live.push(cached.update.bid.clone());
        }

        if live.is_empty() {
            return Ok(None);
        }

        let bid = aggregate_bids(market_basis, &live)?;
        Ok(Some(AggregatedBid { bid, bid_numbers }))
    }

    /// Remembers which child bid numbers went into the aggregate published
    /// under `aggregate_number`. The history window is bounded so a parent
    /// that never answers cannot grow it without limit.
    pub fn record_snapshot(&mut self, aggregate_number: u64, bid_numbers: BidNumberSnapshot) {
        self.snapshots.push_back((aggregate_number, bid_numbers));
        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_front();
        }
    }

    /// Consumes the snapshot matching a price response's bid number. `None`
    /// means the price answers a bid this node never published (or one that
    /// fell out of the window) and must be ignored.
    pub fn take_snapshot(&mut self, aggregate_number: u64) -> Option<BidNumberSnapshot> {
        let position = self
            .snapshots
            .iter()
            .position(|(number, _)| *number == aggregate_number)?;
        self.snapshots.remove(position).map(|(_, numbers)| numbers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 11, 0.0, 10.0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 9, 14, 30, 0).unwrap()
    }

    fn update(demand: f64, bid_number: u64) -> BidUpdate {
        let bid = Bid::flat(basis(), demand)
            .unwrap()
            .with_bid_number(bid_number);
        BidUpdate::from_bid(bid)
    }

    #[test]
    fn aggregates_live_bids_and_reports_their_numbers() {
        let mut cache = BidCache::new(None);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.update_bid(a, update(-5.0, 3), now());
        cache.update_bid(b, update(-2.0, 7), now());

        let aggregated = cache.aggregate(&basis(), now()).unwrap().unwrap();
        assert_eq!(aggregated.bid.demand_array(), vec![-7.0; 11]);
        assert_eq!(aggregated.bid_numbers[&a], 3);
        assert_eq!(aggregated.bid_numbers[&b], 7);
    }

    #[test]
    fn empty_cache_aggregates_to_none() {
        let cache = BidCache::new(None);
        assert!(cache.aggregate(&basis(), now()).unwrap().is_none());
    }

    #[test]
    fn expired_bids_are_excluded_not_zero_filled() {
        let mut cache = BidCache::new(Some(Duration::seconds(600)));
        let (fresh, stale) = (Uuid::new_v4(), Uuid::new_v4());
        cache.update_bid(stale, update(-5.0, 1), now());
        cache.update_bid(fresh, update(-2.0, 1), now() + Duration::seconds(500));

        let later = now() + Duration::seconds(700);
        let aggregated = cache.aggregate(&basis(), later).unwrap().unwrap();

        // Only the fresh bid contributes; the stale one is absent, not zero.
        assert_eq!(aggregated.bid.demand_array(), vec![-2.0; 11]);
        assert!(!aggregated.bid_numbers.contains_key(&stale));
    }

    #[test]
    fn refreshed_bid_rejoins_the_aggregate() {
        let mut cache = BidCache::new(Some(Duration::seconds(600)));
        let session = Uuid::new_v4();
        cache.update_bid(session, update(-5.0, 1), now());

        let later = now() + Duration::seconds(900);
        assert!(cache.aggregate(&basis(), later).unwrap().is_none());

        cache.update_bid(session, update(-4.0, 2), later);
        let aggregated = cache.aggregate(&basis(), later).unwrap().unwrap();
        assert_eq!(aggregated.bid.demand_array(), vec![-4.0; 11]);
        assert_eq!(aggregated.bid_numbers[&session], 2);
    }

    #[test]
    fn newer_bid_supersedes_the_previous_one() {
        let mut cache = BidCache::new(None);
        let session = Uuid::new_v4();
        cache.update_bid(session, update(-5.0, 1), now());
        let old = cache.update_bid(session, update(-3.0, 2), now()).unwrap();

        assert_eq!(old.bid_number, 1);
        assert_eq!(cache.last_bid_number(&session), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshots_are_consumed_once_and_bounded() {
        let mut cache = BidCache::new(None);
        let session = Uuid::new_v4();

        let mut numbers = BidNumberSnapshot::new();
        numbers.insert(session, 9);
        cache.record_snapshot(1, numbers);

        assert_eq!(cache.take_snapshot(1).unwrap()[&session], 9);
        assert!(cache.take_snapshot(1).is_none());
        assert!(cache.take_snapshot(99).is_none());

        for n in 0..200u64 {
            cache.record_snapshot(n, BidNumberSnapshot::new());
        }
        // The oldest snapshots fell out of the bounded window.
        assert!(cache.take_snapshot(0).is_none());
        assert!(cache.take_snapshot(199).is_some());
    }
}
