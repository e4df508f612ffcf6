use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

use crate::entities::{Offer, OfferRow};

pub type Snapshot = Arc<Vec<Offer>>;

/// Permission to enrich one row. Only the holder of the newest ticket for a
/// ride may write the enriched offer back.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub row: OfferRow,
    pub announce: bool,
    generation: u64,
}

impl Ticket {
    pub fn ride_id(&self) -> Uuid {
        self.row.ride_id
    }
}

#[derive(Debug, Default)]
pub struct Completion {
    /// Set when the ticket asked for an announcement and the ride was new.
    pub inserted: Option<Offer>,
    /// A newer row for the same ride that arrived mid-enrichment.
    pub next: Option<Ticket>,
}

#[derive(Debug, Default)]
struct Track {
    generation: u64,
    enriching: bool,
    rerun: Option<(OfferRow, bool)>,
}

#[derive(Debug, Default)]
struct Inner {
    offers: HashMap<Uuid, Offer>,
    tracks: HashMap<Uuid, Track>,
    seq: u64,
    closed: bool,
}

/// The deduplicated set of active offers, one per ride, published as a
/// distance-sorted snapshot.
#[derive(Debug)]
pub struct CanonicalList {
    inner: Mutex<Inner>,
    snapshot: watch::Sender<Snapshot>,
}

impl Default for CanonicalList {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalList {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            inner: Mutex::new(Inner::default()),
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn get(&self, ride_id: &Uuid) -> Option<Offer> {
        self.lock().offers.get(ride_id).cloned()
    }

    /// Current position in the change sequence; see `touched_since`.
    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    pub fn is_enriching(&self, ride_id: &Uuid) -> bool {
        self.lock()
            .tracks
            .get(ride_id)
            .map(|track| track.enriching)
            .unwrap_or(false)
    }

    /// Whether any event for the ride arrived after `since`.
    pub fn touched_since(&self, ride_id: &Uuid, since: u64) -> bool {
        self.lock()
            .tracks
            .get(ride_id)
            .map(|track| track.generation > since)
            .unwrap_or(false)
    }

    /// Registers a pending row. Returns a ticket if the caller should enrich
    /// it now; if the ride is already being enriched the row is kept and
    /// handed out again when that enrichment completes.
    pub fn begin(&self, row: OfferRow, announce: bool) -> Option<Ticket> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }

        let generation = inner.next_seq();
        let track = inner.tracks.entry(row.ride_id).or_default();
        track.generation = generation;

        if track.enriching {
            let announce = announce || track.rerun.as_ref().map(|r| r.1).unwrap_or(false);
            tracing::debug!(ride_id = %row.ride_id, "enrichment in flight, coalescing");
            track.rerun = Some((row, announce));
            return None;
        }

        track.enriching = true;

        Some(Ticket {
            row,
            announce,
            generation,
        })
    }

    pub fn complete(&self, ticket: Ticket, offer: Option<Offer>) -> Completion {
        let mut inner = self.lock();
        let completion = inner.apply(ticket, offer);
        self.publish(&inner);

        completion
    }

    /// Applies several enrichments and publishes once.
    pub fn complete_batch(&self, results: Vec<(Ticket, Option<Offer>)>) -> Vec<Ticket> {
        let mut inner = self.lock();

        let next = results
            .into_iter()
            .filter_map(|(ticket, offer)| inner.apply(ticket, offer).next)
            .collect();
        self.publish(&inner);

        next
    }

    /// Records a non-pending event for the ride so that enrichments already
    /// in flight are discarded.
    pub fn observe(&self, ride_id: Uuid) {
        let mut inner = self.lock();
        let generation = inner.next_seq();

        let track = inner.tracks.entry(ride_id).or_default();
        track.generation = generation;
        track.rerun = None;
    }

    pub fn remove(&self, ride_id: Uuid) -> Option<Offer> {
        self.observe(ride_id);

        let mut inner = self.lock();
        let removed = inner.offers.remove(&ride_id);
        if removed.is_some() {
            self.publish(&inner);
        }

        removed
    }

    /// Drops offers the server no longer lists as pending, unless an event
    /// for them arrived after `since`. Returns the dropped rides.
    pub fn retain_since(&self, present: &HashSet<Uuid>, since: u64) -> Vec<Uuid> {
        let mut inner = self.lock();

        let stale: Vec<Uuid> = inner
            .offers
            .keys()
            .filter(|ride_id| !present.contains(ride_id))
            .filter(|ride_id| {
                inner
                    .tracks
                    .get(ride_id)
                    .map(|track| track.generation <= since && !track.enriching)
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        for ride_id in &stale {
            inner.offers.remove(ride_id);
        }

        if !stale.is_empty() {
            self.publish(&inner);
        }

        stale
    }

    /// Empties the list and refuses further writes until `open`.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.offers.clear();
        inner.tracks.clear();
        inner.closed = true;
        self.publish(&inner);
    }

    pub fn open(&self) {
        self.lock().closed = false;
    }

    /// Takes the guard so that snapshots go out in the order the map changed.
    fn publish(&self, inner: &Inner) {
        let mut offers: Vec<Offer> = inner.offers.values().cloned().collect();
        offers.sort_by(|a, b| {
            a.distance_to_pickup_km
                .total_cmp(&b.distance_to_pickup_km)
                .then(a.sent_at.cmp(&b.sent_at))
                .then(a.ride_id.cmp(&b.ride_id))
        });

        self.snapshot.send_if_modified(|current| {
            if **current == offers {
                return false;
            }

            *current = Arc::new(offers);
            true
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn apply(&mut self, ticket: Ticket, offer: Option<Offer>) -> Completion {
        let mut completion = Completion::default();

        if self.closed {
            return completion;
        }

        let ride_id = ticket.ride_id();
        let current = self
            .tracks
            .get(&ride_id)
            .map(|track| track.generation == ticket.generation)
            .unwrap_or(false);

        if let (true, Some(offer)) = (current, offer) {
            let is_new = self.offers.insert(ride_id, offer.clone()).is_none();
            if is_new && ticket.announce {
                completion.inserted = Some(offer);
            }
        } else if !current {
            tracing::debug!(%ride_id, "discarding stale enrichment");
        }

        if let Some(track) = self.tracks.get_mut(&ride_id) {
            match track.rerun.take() {
                Some((row, announce)) => {
                    completion.next = Some(Ticket {
                        row,
                        announce: announce || ticket.announce,
                        generation: track.generation,
                    });
                }
                None => track.enriching = false,
            }
        }

        completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::OfferStatus;
    use crate::testing::{offer, offer_row};

    fn enrich(ticket: &Ticket, distance: f64) -> Option<Offer> {
        let mut offer = offer(ticket.ride_id(), distance);
        offer.offer_id = ticket.row.id;
        Some(offer)
    }

    fn upsert(list: &CanonicalList, ride_id: Uuid, distance: f64) -> Completion {
        let ticket = list
            .begin(offer_row(1, ride_id, OfferStatus::Pending), true)
            .unwrap();
        let offer = enrich(&ticket, distance);
        list.complete(ticket, offer)
    }

    fn distances(list: &CanonicalList) -> Vec<f64> {
        list.snapshot()
            .iter()
            .map(|offer| offer.distance_to_pickup_km)
            .collect()
    }

    #[test]
    fn publishes_sorted_by_distance() {
        let list = CanonicalList::new();

        upsert(&list, Uuid::new_v4(), 3.2);
        upsert(&list, Uuid::new_v4(), 0.5);
        upsert(&list, Uuid::new_v4(), 1.8);

        assert_eq!(distances(&list), vec![0.5, 1.8, 3.2]);
    }

    #[test]
    fn one_offer_per_ride() {
        let list = CanonicalList::new();
        let ride_id = Uuid::new_v4();

        let first = upsert(&list, ride_id, 2.0);
        let second = upsert(&list, ride_id, 1.0);

        assert!(first.inserted.is_some());
        assert!(second.inserted.is_none());
        assert_eq!(distances(&list), vec![1.0]);
    }

    #[test]
    fn last_event_decides_membership() {
        let list = CanonicalList::new();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();
        let revived = Uuid::new_v4();

        upsert(&list, kept, 1.0);
        upsert(&list, dropped, 2.0);
        upsert(&list, revived, 3.0);

        list.remove(dropped);
        list.remove(revived);
        upsert(&list, revived, 3.0);

        let rides: HashSet<Uuid> = list.snapshot().iter().map(|o| o.ride_id).collect();
        assert_eq!(rides, [kept, revived].into_iter().collect());
    }

    #[test]
    fn reentry_is_coalesced_not_duplicated() {
        let list = CanonicalList::new();
        let ride_id = Uuid::new_v4();

        let ticket = list
            .begin(offer_row(1, ride_id, OfferStatus::Pending), true)
            .unwrap();
        assert!(list.is_enriching(&ride_id));

        let mut newer = offer_row(2, ride_id, OfferStatus::Pending);
        newer.bid_price = 140;
        assert!(list.begin(newer, false).is_none());

        // the first result is stale; the newer row comes back as a ticket
        let completion = list.complete(ticket.clone(), enrich(&ticket, 1.0));
        assert!(completion.inserted.is_none());
        assert!(list.snapshot().is_empty());

        let next = completion.next.unwrap();
        assert_eq!(next.row.id, 2);
        assert!(next.announce);

        let completion = list.complete(next.clone(), enrich(&next, 1.0));
        assert!(completion.inserted.is_some());
        assert!(completion.next.is_none());
        assert!(!list.is_enriching(&ride_id));
        assert_eq!(list.snapshot()[0].offer_id, 2);
    }

    #[test]
    fn removal_discards_inflight_enrichment() {
        let list = CanonicalList::new();
        let ride_id = Uuid::new_v4();

        let ticket = list
            .begin(offer_row(1, ride_id, OfferStatus::Pending), true)
            .unwrap();
        list.remove(ride_id);

        let completion = list.complete(ticket.clone(), enrich(&ticket, 1.0));
        assert!(completion.inserted.is_none());
        assert!(list.snapshot().is_empty());
        assert!(!list.is_enriching(&ride_id));
    }

    #[test]
    fn unchanged_list_is_not_republished() {
        let list = CanonicalList::new();
        let mut rx = list.subscribe();
        let ride_id = Uuid::new_v4();

        upsert(&list, ride_id, 1.0);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let ticket = list
            .begin(offer_row(1, ride_id, OfferStatus::Pending), false)
            .unwrap();
        let offer = list.get(&ride_id);
        list.complete(ticket, offer);

        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn batch_publishes_once() {
        let list = CanonicalList::new();
        let mut rx = list.subscribe();

        let results = (0..3)
            .map(|i| {
                let ticket = list
                    .begin(offer_row(i, Uuid::new_v4(), OfferStatus::Pending), false)
                    .unwrap();
                let offer = enrich(&ticket, i as f64);
                (ticket, offer)
            })
            .collect();

        assert!(list.complete_batch(results).is_empty());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 3);
    }

    #[test]
    fn retain_keeps_recently_touched_rides() {
        let list = CanonicalList::new();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let listed = Uuid::new_v4();

        upsert(&list, old, 1.0);
        upsert(&list, listed, 2.0);
        let since = list.seq();
        upsert(&list, fresh, 3.0);

        let present: HashSet<Uuid> = [listed].into_iter().collect();
        let dropped = list.retain_since(&present, since);

        assert_eq!(dropped, vec![old]);
        assert_eq!(list.snapshot().len(), 2);
        assert!(list.touched_since(&fresh, since));
        assert!(!list.touched_since(&listed, since));
    }

    #[test]
    fn concurrent_writers_publish_the_final_map() {
        for _ in 0..50 {
            let list = Arc::new(CanonicalList::new());

            let writers: Vec<_> = (0..8)
                .map(|writer| {
                    let list = list.clone();
                    std::thread::spawn(move || {
                        for i in 0..20 {
                            upsert(&list, Uuid::new_v4(), (writer * 20 + i) as f64);
                        }
                    })
                })
                .collect();

            for writer in writers {
                writer.join().unwrap();
            }

            assert_eq!(list.snapshot().len(), 160);
        }
    }

    #[test]
    fn closed_list_ignores_writes() {
        let list = CanonicalList::new();
        upsert(&list, Uuid::new_v4(), 1.0);

        list.close();
        assert!(list.snapshot().is_empty());
        assert!(list
            .begin(offer_row(1, Uuid::new_v4(), OfferStatus::Pending), true)
            .is_none());

        list.open();
        upsert(&list, Uuid::new_v4(), 1.0);
        assert_eq!(list.snapshot().len(), 1);
    }
}
