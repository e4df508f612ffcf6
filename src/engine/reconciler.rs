use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::canonical::{CanonicalList, Snapshot, Ticket};
use super::events::{Activity, DomainEvent, Feed};
use super::retry::with_retry;
use super::subscription::supervise;
use crate::api::{BookingAPI, ChangeFeedAPI, DynAPI, OfferAPI};
use crate::config::ReconcilerConfig;
use crate::entities::{
    Booking, BookingStatus, Change, CounterOffer, CounterOfferStatus, Offer, OfferRow,
    OfferStatus, Proposer, RiderProfile,
};
use crate::error::Error;
use crate::session::Session;

const EVENT_CAPACITY: usize = 64;

/// Turns the raw offer and counter-offer feeds into the canonical offer list
/// and the events the driver hears about.
pub struct Reconciler {
    api: DynAPI,
    session: Arc<Session>,
    config: ReconcilerConfig,
    list: CanonicalList,
    events: broadcast::Sender<DomainEvent>,
    activity: watch::Sender<Activity>,
    tasks: Mutex<JoinSet<()>>,
}

impl Reconciler {
    pub fn new(api: DynAPI, session: Arc<Session>, config: ReconcilerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (activity, _) = watch::channel(Activity::Idle);

        Arc::new(Self {
            api,
            session,
            config,
            list: CanonicalList::new(),
            events,
            activity,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn list(&self) -> &CanonicalList {
        &self.list
    }

    pub fn offers(&self) -> Snapshot {
        self.list.snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub fn activity(&self) -> Activity {
        self.activity.borrow().clone()
    }

    pub fn watch_activity(&self) -> watch::Receiver<Activity> {
        self.activity.subscribe()
    }

    pub fn reset_activity(&self) {
        self.set_activity(Activity::Idle);
    }

    /// Cancels everything in flight and empties the list.
    pub fn shutdown(&self) {
        self.tasks().abort_all();
        self.list.close();
    }

    pub fn open(&self) {
        self.list.open();
    }

    pub(crate) fn api(&self) -> &DynAPI {
        &self.api
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: DomainEvent) {
        tracing::debug!(?event, "domain event");
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn set_activity(&self, activity: Activity) {
        self.activity.send_if_modified(|current| {
            if *current == activity {
                return false;
            }

            *current = activity;
            true
        });
    }

    /// Shows `activity` and returns to idle after `hold`, unless something
    /// else replaced it meanwhile.
    pub(crate) fn flash(self: &Arc<Self>, activity: Activity, hold: Duration) {
        self.set_activity(activity.clone());

        let this = self.clone();
        self.spawn(async move {
            tokio::time::sleep(hold).await;

            this.activity.send_if_modified(|current| {
                if *current != activity {
                    return false;
                }

                *current = Activity::Idle;
                true
            });
        });
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches every pending offer, enriches them in parallel and publishes
    /// the result at once. A failed fetch is retried once after a pause.
    #[tracing::instrument(skip(self), fields(driver_id = %self.session.driver_id()))]
    pub async fn load_pending(self: &Arc<Self>) -> Result<(), Error> {
        self.set_activity(Activity::Loading);

        let rows = match self.fetch_pending().await {
            Ok(rows) => rows,
            Err(err) => {
                self.set_activity(Activity::Error {
                    message: format!("Failed to load ride requests: {}", err),
                });
                tokio::time::sleep(self.config.load_retry_delay).await;

                match self.fetch_pending().await {
                    Ok(rows) => rows,
                    Err(err) => {
                        self.set_activity(Activity::Idle);
                        return Err(err);
                    }
                }
            }
        };

        let tickets: Vec<Ticket> = rows
            .into_iter()
            .filter_map(|row| self.list.begin(row, false))
            .collect();

        tracing::info!(count = tickets.len(), "enriching pending offers");

        let results = join_all(tickets.into_iter().map(|ticket| async move {
            let offer = self.enrich(&ticket.row).await;
            (ticket, offer)
        }))
        .await;

        for ticket in self.list.complete_batch(results) {
            self.spawn_enrichment(ticket);
        }

        self.set_activity(Activity::Idle);

        Ok(())
    }

    /// Re-fetches pending offers to pick up anything the feed missed and to
    /// drop rides the server no longer offers. Rides with an event newer
    /// than the poll are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(self: &Arc<Self>) -> Result<(), Error> {
        let since = self.list.seq();
        let rows = self.fetch_pending().await?;

        let present: HashSet<Uuid> = rows.iter().map(|row| row.ride_id).collect();
        let dropped = self.list.retain_since(&present, since);
        if !dropped.is_empty() {
            tracing::info!(?dropped, "rides no longer pending");
        }

        for row in rows {
            let ride_id = row.ride_id;
            if self.list.get(&ride_id).is_some()
                || self.list.is_enriching(&ride_id)
                || self.list.touched_since(&ride_id, since)
            {
                continue;
            }

            tracing::info!(%ride_id, "picked up missed offer");
            if let Some(ticket) = self.list.begin(row, true) {
                self.spawn_enrichment(ticket);
            }
        }

        Ok(())
    }

    pub async fn run_refresh(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            if let Err(err) = self.refresh().await {
                tracing::warn!("refresh failed: {}", err);
            }
        }
    }

    pub async fn run_offer_feed(self: Arc<Self>) {
        let driver_id = self.session.driver_id();

        let result = supervise(
            Feed::Offers,
            &self.config.feed_policy(),
            || self.api.subscribe_offers(driver_id),
            |change| self.on_offer_change(change),
        )
        .await;

        if let Err(err) = result {
            tracing::error!(feed = %Feed::Offers, "{}", err);
            self.emit(DomainEvent::ConnectionLost { feed: Feed::Offers });
        }
    }

    pub async fn run_counter_feed(self: Arc<Self>) {
        let driver_id = self.session.driver_id();

        let result = supervise(
            Feed::CounterOffers,
            &self.config.feed_policy(),
            || self.api.subscribe_counter_offers(driver_id),
            |change| self.on_counter_change(change),
        )
        .await;

        if let Err(err) = result {
            tracing::error!(feed = %Feed::CounterOffers, "{}", err);
            self.emit(DomainEvent::ConnectionLost {
                feed: Feed::CounterOffers,
            });
        }
    }

    pub fn on_offer_change(self: &Arc<Self>, change: Change<OfferRow>) {
        let row = change.record();
        if row.driver_id != self.session.driver_id() {
            tracing::debug!(ride_id = %row.ride_id, "ignoring another driver's offer");
            return;
        }

        let ride_id = row.ride_id;

        let row = match change {
            Change::Delete { .. } => return self.cancel(ride_id),
            Change::Insert { record } | Change::Update { record, .. } => record,
        };

        match row.status {
            OfferStatus::Pending => {
                if let Some(ticket) = self.list.begin(row, true) {
                    self.spawn_enrichment(ticket);
                }
            }
            OfferStatus::Accepted => {
                self.list.observe(ride_id);

                if self.accepting(ride_id) {
                    tracing::debug!(%ride_id, "accept in progress, leaving confirmation to it");
                    return;
                }

                let this = self.clone();
                self.spawn(async move { this.settle_accepted(ride_id).await });
            }
            OfferStatus::CounterOffered => {
                tracing::debug!(%ride_id, "counter-offer pending");
            }
            status if status.is_terminal() => self.cancel(ride_id),
            status => {
                tracing::warn!(%ride_id, ?status, "offer with unrecognised status");
            }
        }
    }

    pub fn on_counter_change(self: &Arc<Self>, change: Change<CounterOffer>) {
        let counter = match change {
            Change::Update { record, .. } => record,
            Change::Insert { .. } | Change::Delete { .. } => return,
        };

        if counter.driver_id != self.session.driver_id() || counter.offered_by != Proposer::Driver {
            return;
        }

        let ride_id = counter.ride_id;

        match counter.status {
            CounterOfferStatus::Pending => {}
            CounterOfferStatus::Accepted => {
                let this = self.clone();
                self.spawn(async move {
                    tokio::time::sleep(this.config.consistency_delay).await;

                    match this.confirmed_booking(ride_id).await {
                        Some(booking) => {
                            this.list.remove(ride_id);
                            this.emit(DomainEvent::CounterAcceptedAndConfirmed { booking });
                        }
                        None => this.emit(DomainEvent::CounterAccepted { ride_id }),
                    }
                });
            }
            CounterOfferStatus::Rejected => {
                self.list.remove(ride_id);
                self.emit(DomainEvent::CounterRejected { ride_id });
            }
            CounterOfferStatus::Expired => {
                self.list.remove(ride_id);
                self.emit(DomainEvent::CounterExpired { ride_id });
            }
        }
    }

    /// The booking if this driver won the ride. Failures count as not won.
    pub(crate) async fn confirmed_booking(&self, ride_id: Uuid) -> Option<Booking> {
        let driver_id = self.session.driver_id();

        match with_retry(&self.config.fetch_policy(), "check_confirmed", || {
            self.api.check_confirmed(ride_id, driver_id)
        })
        .await
        {
            Ok(booking) => booking,
            Err(err) => {
                tracing::warn!(%ride_id, "confirmation check failed: {}", err);
                None
            }
        }
    }

    async fn settle_accepted(&self, ride_id: Uuid) {
        match self.confirmed_booking(ride_id).await {
            Some(booking) => {
                self.list.remove(ride_id);
                self.emit(DomainEvent::RideWon { booking });
            }
            None => {
                self.list.remove(ride_id);
                self.emit(DomainEvent::TakenByOther { ride_id });
            }
        }
    }

    /// Follows an accepted ride until the rider picks a driver or the offer
    /// leaves the list. Checks back off up to the request timeout.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn await_confirmation(&self, ride_id: Uuid) {
        let policy = self.config.fetch_policy();
        let mut checks = 0;

        loop {
            checks += 1;
            tokio::time::sleep(policy.backoff(checks)).await;

            if self.list.get(&ride_id).is_none() {
                tracing::debug!("offer left the list, no longer waiting");
                return;
            }

            if let Some(booking) = self.confirmed_booking(ride_id).await {
                tracing::info!("ride confirmed");
                self.list.remove(ride_id);
                self.replace_waiting(
                    ride_id,
                    Activity::RideAccepted {
                        booking: booking.clone(),
                    },
                );
                self.emit(DomainEvent::RideWon { booking });
                return;
            }

            let taken = match with_retry(&policy, "fetch_booking", || {
                self.api.fetch_booking(ride_id)
            })
            .await
            {
                Ok(booking) => matches!(
                    booking.status,
                    BookingStatus::Confirmed | BookingStatus::Cancelled | BookingStatus::Completed
                ),
                Err(err) => {
                    tracing::warn!("booking check failed: {}", err);
                    false
                }
            };

            if taken {
                tracing::info!("rider went with another driver");
                self.list.remove(ride_id);
                self.replace_waiting(ride_id, Activity::Idle);
                self.emit(DomainEvent::TakenByOther { ride_id });
                return;
            }
        }
    }

    fn replace_waiting(&self, ride_id: Uuid, activity: Activity) {
        self.activity.send_if_modified(|current| {
            if *current != (Activity::WaitingForConfirmation { ride_id }) {
                return false;
            }

            *current = activity;
            true
        });
    }

    fn accepting(&self, ride_id: Uuid) -> bool {
        match &*self.activity.borrow() {
            Activity::Accepting { ride_id: current }
            | Activity::WaitingForConfirmation { ride_id: current } => *current == ride_id,
            _ => false,
        }
    }

    fn cancel(&self, ride_id: Uuid) {
        if self.list.remove(ride_id).is_some() {
            self.emit(DomainEvent::OfferCancelled { ride_id });
        }
    }

    async fn fetch_pending(&self) -> Result<Vec<OfferRow>, Error> {
        let driver_id = self.session.driver_id();

        let rows = with_retry(&self.config.fetch_policy(), "fetch_pending_offers", || {
            self.api.fetch_pending_offers(driver_id)
        })
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| row.status == OfferStatus::Pending && row.driver_id == driver_id)
            .collect())
    }

    fn spawn_enrichment(self: &Arc<Self>, ticket: Ticket) {
        let this = self.clone();
        self.spawn(async move { this.run_enrichment(ticket).await });
    }

    async fn run_enrichment(&self, mut ticket: Ticket) {
        loop {
            let offer = self.enrich(&ticket.row).await;
            let completion = self.list.complete(ticket, offer);

            if let Some(offer) = completion.inserted {
                self.emit(DomainEvent::NewOffer { offer });
            }

            match completion.next {
                Some(next) => ticket = next,
                None => break,
            }
        }
    }

    /// Joins the row with its booking and rider. Without a booking the offer
    /// cannot be shown and is dropped; a missing rider is replaced by a
    /// placeholder.
    #[tracing::instrument(skip(self, row), fields(ride_id = %row.ride_id))]
    async fn enrich(&self, row: &OfferRow) -> Option<Offer> {
        let policy = self.config.fetch_policy();

        let booking = match with_retry(&policy, "fetch_booking", || {
            self.api.fetch_booking(row.ride_id)
        })
        .await
        {
            Ok(booking) => booking,
            Err(err) => {
                tracing::warn!("dropping offer without booking: {}", err);
                return None;
            }
        };

        let profile = match with_retry(&policy, "fetch_profile", || {
            self.api.fetch_profile(&booking.user_id)
        })
        .await
        {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(user_id = %booking.user_id, "using placeholder rider: {}", err);
                RiderProfile::placeholder(&booking.user_id)
            }
        };

        Some(Offer::new(
            row,
            &booking,
            &profile,
            self.session.last_location(),
        ))
    }
}
