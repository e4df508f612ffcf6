use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::api::{BookingAPI, ChangeFeedAPI, OfferAPI, API};
use crate::entities::{
    Booking, Change, ChangeStream, CounterOffer, CounterOfferStatus, DriverResponse,
    NewCounterOffer, OfferRow, OfferStatus, RiderProfile,
};
use crate::error::{not_found_error, subscription_error, upstream_error, Error};

type Sender<T> = async_channel::Sender<Result<Change<T>, Error>>;

#[derive(Default)]
struct Tables {
    offers: BTreeMap<i64, OfferRow>,
    bookings: HashMap<Uuid, Booking>,
    profiles: HashMap<String, RiderProfile>,
    counters: Vec<CounterOffer>,
    responses: Vec<DriverResponse>,
    next_offer_id: i64,
}

#[derive(Default)]
struct Faults {
    subscribe_failures: u32,
    pending_fetch_failures: u32,
    bookings: HashSet<Uuid>,
    profiles: bool,
    submissions: bool,
}

#[derive(Default)]
struct Feeds {
    offers: Vec<(String, Sender<OfferRow>)>,
    counters: Vec<(String, Sender<CounterOffer>)>,
}

/// Backend kept entirely in memory. Every write is announced to the change
/// feeds of the driver it belongs to, and failures can be switched on to
/// exercise the engine's recovery paths.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    feeds: Mutex<Feeds>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_booking(&self, booking: Booking) {
        lock(&self.tables).bookings.insert(booking.id, booking);
    }

    pub fn add_profile(&self, profile: RiderProfile) {
        lock(&self.tables)
            .profiles
            .insert(profile.user_id.clone(), profile);
    }

    /// Stores the row, assigning an id when it has none, and announces it.
    pub fn insert_offer(&self, mut row: OfferRow) -> OfferRow {
        {
            let mut tables = lock(&self.tables);
            if row.id == 0 {
                tables.next_offer_id += 1;
                row.id = tables.next_offer_id;
            }
            tables.next_offer_id = tables.next_offer_id.max(row.id);
            tables.offers.insert(row.id, row.clone());
        }

        self.publish_offer(Change::Insert {
            record: row.clone(),
        });

        row
    }

    pub fn update_offer(&self, offer_id: i64, status: OfferStatus) -> Result<OfferRow, Error> {
        let (old, row) = {
            let mut tables = lock(&self.tables);
            let row = tables
                .offers
                .get_mut(&offer_id)
                .ok_or_else(not_found_error)?;

            let old = row.clone();
            row.status = status;
            if status != OfferStatus::Pending {
                row.responded_at = Some(Utc::now().timestamp_millis());
            }

            (old, row.clone())
        };

        self.publish_offer(Change::Update {
            old_record: Some(old),
            record: row.clone(),
        });

        Ok(row)
    }

    pub fn delete_offer(&self, offer_id: i64) -> Option<OfferRow> {
        let row = lock(&self.tables).offers.remove(&offer_id)?;

        self.publish_offer(Change::Delete {
            old_record: row.clone(),
        });

        Some(row)
    }

    pub fn confirm_booking(&self, ride_id: Uuid, driver_id: &str) -> Result<(), Error> {
        lock(&self.tables)
            .bookings
            .get_mut(&ride_id)
            .ok_or_else(not_found_error)?
            .confirm(driver_id);

        Ok(())
    }

    pub fn resolve_counter(&self, id: Uuid, status: CounterOfferStatus) -> Result<(), Error> {
        let (old, counter) = {
            let mut tables = lock(&self.tables);
            let counter = tables
                .counters
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(not_found_error)?;

            let old = counter.clone();
            counter.status = status;

            (old, counter.clone())
        };

        self.publish_counter(Change::Update {
            old_record: Some(old),
            record: counter,
        });

        Ok(())
    }

    /// Pushes an arbitrary item to the driver's offer feeds.
    pub fn publish_raw(&self, driver_id: &str, item: Result<Change<OfferRow>, Error>) {
        lock(&self.feeds)
            .offers
            .retain(|(driver, sender)| driver != driver_id || sender.try_send(item.clone()).is_ok());
    }

    /// Ends every open feed, as a dropped connection would.
    pub fn close_feeds(&self) {
        let mut feeds = lock(&self.feeds);
        feeds.offers.clear();
        feeds.counters.clear();
    }

    pub fn fail_subscriptions(&self, times: u32) {
        lock(&self.faults).subscribe_failures = times;
    }

    pub fn fail_pending_fetches(&self, times: u32) {
        lock(&self.faults).pending_fetch_failures = times;
    }

    pub fn fail_booking(&self, ride_id: Uuid) {
        lock(&self.faults).bookings.insert(ride_id);
    }

    pub fn fail_profiles(&self, fail: bool) {
        lock(&self.faults).profiles = fail;
    }

    pub fn fail_submissions(&self, fail: bool) {
        lock(&self.faults).submissions = fail;
    }

    pub fn offer(&self, offer_id: i64) -> Option<OfferRow> {
        lock(&self.tables).offers.get(&offer_id).cloned()
    }

    pub fn offers(&self) -> Vec<OfferRow> {
        lock(&self.tables).offers.values().cloned().collect()
    }

    pub fn booking(&self, ride_id: Uuid) -> Option<Booking> {
        lock(&self.tables).bookings.get(&ride_id).cloned()
    }

    pub fn counter_offers(&self) -> Vec<CounterOffer> {
        lock(&self.tables).counters.clone()
    }

    pub fn responses(&self) -> Vec<DriverResponse> {
        lock(&self.tables).responses.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let feeds = lock(&self.feeds);
        feeds.offers.len() + feeds.counters.len()
    }

    fn publish_offer(&self, change: Change<OfferRow>) {
        let driver_id = change.record().driver_id.clone();
        self.publish_raw(&driver_id, Ok(change));
    }

    fn publish_counter(&self, change: Change<CounterOffer>) {
        let driver_id = change.record().driver_id.clone();
        let item = Ok(change);

        lock(&self.feeds)
            .counters
            .retain(|(driver, sender)| *driver != driver_id || sender.try_send(item.clone()).is_ok());
    }

    fn check_submission(&self) -> Result<(), Error> {
        if lock(&self.faults).submissions {
            return Err(upstream_error());
        }

        Ok(())
    }

    fn take_failure(counter: &mut u32) -> bool {
        if *counter == 0 {
            return false;
        }

        *counter -= 1;
        true
    }
}

#[async_trait]
impl OfferAPI for MemoryBackend {
    async fn fetch_pending_offers(&self, driver_id: &str) -> Result<Vec<OfferRow>, Error> {
        if Self::take_failure(&mut lock(&self.faults).pending_fetch_failures) {
            return Err(upstream_error());
        }

        Ok(lock(&self.tables)
            .offers
            .values()
            .filter(|row| row.driver_id == driver_id && row.status == OfferStatus::Pending)
            .cloned()
            .collect())
    }

    async fn set_offer_status(&self, offer_id: i64, status: OfferStatus) -> Result<(), Error> {
        self.update_offer(offer_id, status)?;

        Ok(())
    }

    async fn submit_accept(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error> {
        self.check_submission()?;
        self.update_offer(offer_id, OfferStatus::Accepted)?;
        lock(&self.tables).responses.push(response);

        Ok(())
    }

    async fn submit_reject(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error> {
        self.check_submission()?;
        self.update_offer(offer_id, OfferStatus::Rejected)?;
        lock(&self.tables).responses.push(response);

        Ok(())
    }

    async fn submit_counter(&self, offer_id: i64, counter: NewCounterOffer) -> Result<(), Error> {
        self.check_submission()?;
        self.update_offer(offer_id, OfferStatus::CounterOffered)?;

        let counter = CounterOffer {
            id: Uuid::new_v4(),
            ride_id: counter.ride_id,
            driver_id: counter.driver_id,
            user_id: counter.user_id,
            original_amount: counter.original_amount,
            counter_amount: counter.counter_amount,
            offered_by: counter.offered_by,
            status: counter.status,
            message: counter.message,
            created_at: Some(Utc::now()),
        };

        lock(&self.tables).counters.push(counter.clone());
        self.publish_counter(Change::Insert { record: counter });

        Ok(())
    }
}

#[async_trait]
impl BookingAPI for MemoryBackend {
    async fn fetch_booking(&self, ride_id: Uuid) -> Result<Booking, Error> {
        if lock(&self.faults).bookings.contains(&ride_id) {
            return Err(upstream_error());
        }

        self.booking(ride_id).ok_or_else(not_found_error)
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<RiderProfile, Error> {
        if lock(&self.faults).profiles {
            return Err(upstream_error());
        }

        lock(&self.tables)
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(not_found_error)
    }

    async fn check_confirmed(
        &self,
        ride_id: Uuid,
        driver_id: &str,
    ) -> Result<Option<Booking>, Error> {
        let tables = lock(&self.tables);

        let accepted = tables.offers.values().any(|row| {
            row.ride_id == ride_id
                && row.driver_id == driver_id
                && row.status == OfferStatus::Accepted
        });

        Ok(tables
            .bookings
            .get(&ride_id)
            .filter(|booking| accepted && booking.is_confirmed_for(driver_id))
            .cloned())
    }
}

#[async_trait]
impl ChangeFeedAPI for MemoryBackend {
    async fn subscribe_offers(&self, driver_id: &str) -> Result<ChangeStream<OfferRow>, Error> {
        if Self::take_failure(&mut lock(&self.faults).subscribe_failures) {
            return Err(subscription_error());
        }

        let (sender, receiver) = async_channel::unbounded();
        lock(&self.feeds).offers.push((driver_id.into(), sender));

        Ok(Box::pin(receiver))
    }

    async fn subscribe_counter_offers(
        &self,
        driver_id: &str,
    ) -> Result<ChangeStream<CounterOffer>, Error> {
        if Self::take_failure(&mut lock(&self.faults).subscribe_failures) {
            return Err(subscription_error());
        }

        let (sender, receiver) = async_channel::unbounded();
        lock(&self.feeds).counters.push((driver_id.into(), sender));

        Ok(Box::pin(receiver))
    }
}

impl API for MemoryBackend {}
