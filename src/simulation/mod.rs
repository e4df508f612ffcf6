mod backend;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Binomial, Distribution, Normal, Uniform};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use backend::MemoryBackend;

use crate::config::Config;
use crate::engine::{DomainEvent, Engine, Outcome, PresentationHost, Responder};
use crate::entities::{
    Booking, BookingStatus, Coordinates, CounterDefaults, CounterOfferStatus, Offer, OfferRow,
    OfferStatus, Proposer, RiderProfile,
};
use crate::error::{unexpected_error, Error};
use crate::server;
use crate::session::Session;

const PLACES: [(&str, f64, f64); 9] = [
    ("Shivaji Nagar, Pune", 18.5308, 73.8475),
    ("Hinjewadi Phase 1, Pune", 18.5912, 73.7389),
    ("Koregaon Park, Pune", 18.5362, 73.8940),
    ("Viman Nagar, Pune", 18.5679, 73.9143),
    ("Kothrud, Pune", 18.5074, 73.8077),
    ("Hadapsar, Pune", 18.5089, 73.9260),
    ("Baner, Pune", 18.5590, 73.7868),
    ("Swargate, Pune", 18.5018, 73.8636),
    ("Pune Railway Station", 18.5289, 73.8744),
];

const RIDERS: [&str; 6] = [
    "Asha Kulkarni",
    "Rohan Deshpande",
    "Meera Joshi",
    "Vikram Patil",
    "Sneha Gokhale",
    "Arjun Shinde",
];

const VEHICLES: [&str; 3] = ["auto", "bike", "cab"];

const MIN_FARE: f64 = 40.0;
const STALE_AFTER_SECS: i64 = 60;
const OTHER_DRIVER: &str = "driver-elsewhere";

fn sample_binomial(n: u64, p: f64) -> u64 {
    Binomial::new(n, p)
        .map(|bin| bin.sample(&mut rand::thread_rng()))
        .unwrap_or(0)
}

fn chance(p: f64) -> bool {
    sample_binomial(1, p) > 0
}

fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>, Error> {
    Normal::new(mean, std_dev).map_err(|_| unexpected_error())
}

/// Riders on one side, the server's bookkeeping on the other, all over an
/// in-memory backend.
pub struct Simulation {
    backend: Arc<MemoryBackend>,
    driver_id: String,
    fare_per_km: Normal<f64>,
    places: Uniform<usize>,
}

impl Simulation {
    pub fn new(backend: Arc<MemoryBackend>, driver_id: &str) -> Result<Self, Error> {
        Ok(Self {
            backend,
            driver_id: driver_id.into(),
            fare_per_km: normal(12.0, 3.0)?,
            places: Uniform::from(0..PLACES.len()),
        })
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn sample_place(&self) -> usize {
        self.places.sample(&mut rand::thread_rng())
    }

    pub fn sample_location(&self) -> Coordinates {
        let (_, latitude, longitude) = PLACES[self.sample_place()];
        Coordinates::new(latitude, longitude)
    }

    /// A rider books a trip and the server forwards it to our driver.
    #[tracing::instrument(skip(self))]
    pub fn add_ride(&self) -> OfferRow {
        let mut rng = rand::thread_rng();

        let pickup = self.sample_place();
        let drop = (pickup + rng.gen_range(1..PLACES.len())) % PLACES.len();
        let (pickup_address, pickup_lat, pickup_lng) = PLACES[pickup];
        let (drop_address, drop_lat, drop_lng) = PLACES[drop];

        let distance_km = Coordinates::new(pickup_lat, pickup_lng)
            .distance_km(&Coordinates::new(drop_lat, drop_lng));
        let fare = (distance_km * self.fare_per_km.sample(&mut rng))
            .max(MIN_FARE)
            .round() as i64;

        let user_id = format!("rider-{}", Uuid::new_v4());
        let name = RIDERS.choose(&mut rng).copied().unwrap_or("Rider");
        let vehicle_type = VEHICLES.choose(&mut rng).copied().unwrap_or("auto");

        self.backend.add_profile(RiderProfile {
            user_id: user_id.clone(),
            name: name.into(),
            phone_number: String::new(),
            profile_initial: None,
            total_rides: rng.gen_range(0..200),
            rating: Some(rng.gen_range(35..=50) as f64 / 10.0),
        });

        let ride_id = Uuid::new_v4();
        self.backend.add_booking(Booking {
            id: ride_id,
            user_id,
            pickup_address: pickup_address.into(),
            pickup_lat,
            pickup_lng,
            drop_address: drop_address.into(),
            drop_lat,
            drop_lng,
            vehicle_type: vehicle_type.into(),
            distance_km: (distance_km * 10.0).round() / 10.0,
            bid: fare,
            note: None,
            status: BookingStatus::Searching,
            confirmed_driver_id: None,
            created_at: Some(Utc::now()),
        });

        let row = self.backend.insert_offer(OfferRow {
            id: 0,
            ride_id,
            driver_id: self.driver_id.clone(),
            pickup_latitude: pickup_lat,
            pickup_longitude: pickup_lng,
            vehicle_type: vehicle_type.into(),
            bid_price: fare,
            status: OfferStatus::Pending,
            sent_at: Some(Utc::now()),
            responded_at: None,
        });

        tracing::info!(offer_id = row.id, %ride_id, fare, "rider requested a ride");

        row
    }

    /// Does what the server and riders would do with the driver's answers:
    /// accepted rides get confirmed, counters get answered and old requests
    /// expire.
    #[tracing::instrument(skip(self))]
    pub fn resolve(&self) {
        for row in self.backend.offers() {
            if row.driver_id != self.driver_id {
                continue;
            }

            match row.status {
                OfferStatus::Accepted => self.settle_accepted(&row),
                OfferStatus::Pending => self.expire_if_stale(&row),
                _ => (),
            }
        }

        for counter in self.backend.counter_offers() {
            if counter.driver_id != self.driver_id
                || counter.offered_by != Proposer::Driver
                || counter.status != CounterOfferStatus::Pending
            {
                continue;
            }

            let status = if chance(0.5) {
                CounterOfferStatus::Accepted
            } else if chance(0.7) {
                CounterOfferStatus::Rejected
            } else {
                CounterOfferStatus::Expired
            };

            if status == CounterOfferStatus::Accepted {
                log_failure(self.backend.confirm_booking(counter.ride_id, &self.driver_id));
            }

            tracing::info!(ride_id = %counter.ride_id, status = %status.name(), "rider answered counter");
            log_failure(self.backend.resolve_counter(counter.id, status));
        }
    }

    fn settle_accepted(&self, row: &OfferRow) {
        let settled = self
            .backend
            .booking(row.ride_id)
            .map(|booking| booking.status == BookingStatus::Confirmed)
            .unwrap_or(true);

        if settled {
            return;
        }

        // most riders take the first driver who accepts
        let driver_id = if chance(0.8) {
            self.driver_id.as_str()
        } else {
            OTHER_DRIVER
        };

        tracing::info!(ride_id = %row.ride_id, driver_id, "rider confirmed booking");
        log_failure(self.backend.confirm_booking(row.ride_id, driver_id));
    }

    fn expire_if_stale(&self, row: &OfferRow) {
        let stale = row
            .sent_at
            .map(|sent_at| (Utc::now() - sent_at).num_seconds() > STALE_AFTER_SECS)
            .unwrap_or(false);

        if stale {
            tracing::info!(offer_id = row.id, "ride request expired");
            log_failure(self.backend.update_offer(row.id, OfferStatus::Expired));
        }
    }
}

fn log_failure<T>(result: Result<T, Error>) {
    if let Err(err) = result {
        tracing::warn!("simulated write failed: {}", err);
    }
}

/// How a simulated driver tends to answer. Whatever is left over after the
/// three shares lets the countdown run out.
#[derive(Clone, Copy, Debug)]
pub struct Odds {
    pub accept: f64,
    pub counter: f64,
    pub reject: f64,
}

impl Default for Odds {
    fn default() -> Self {
        Self {
            accept: 0.5,
            counter: 0.25,
            reject: 0.15,
        }
    }
}

/// Host that answers every presented offer on its own after a short pause.
pub struct SimulatedDriver {
    odds: Odds,
    think_secs: Normal<f64>,
}

impl SimulatedDriver {
    pub fn new(odds: Odds) -> Result<Self, Error> {
        Ok(Self {
            odds,
            think_secs: normal(4.0, 1.5)?,
        })
    }

    fn decide(&self, offer: &Offer) -> Option<Outcome> {
        let mut rng = rand::thread_rng();
        let roll: f64 = rng.gen();

        if roll < self.odds.accept {
            return Some(Outcome::Accept);
        }

        if roll < self.odds.accept + self.odds.counter {
            let defaults = CounterDefaults::for_bid(offer.bid_amount);
            let amount = defaults
                .suggestions
                .choose(&mut rng)
                .copied()
                .unwrap_or(defaults.suggested);

            return Some(Outcome::Counter {
                amount: amount as f64,
                message: Some("Traffic near pickup".into()),
            });
        }

        if roll < self.odds.accept + self.odds.counter + self.odds.reject {
            return Some(Outcome::Reject);
        }

        None
    }

    fn think_time(&self) -> Duration {
        let secs = self.think_secs.sample(&mut rand::thread_rng());
        Duration::from_secs_f64(secs.clamp(0.5, 10.0))
    }
}

#[async_trait]
impl PresentationHost for SimulatedDriver {
    async fn show(&self, offer: &Offer, responder: Responder) -> Result<(), Error> {
        let outcome = self.decide(offer);
        let think = self.think_time();

        tracing::info!(
            ride_id = %offer.ride_id,
            bid = offer.bid_amount,
            ?outcome,
            "driver looking at offer"
        );

        if let Some(outcome) = outcome {
            tokio::spawn(async move {
                tokio::time::sleep(think).await;

                if !responder.is_current() {
                    return;
                }

                if let Err(err) = responder.respond(outcome) {
                    tracing::warn!(ride_id = %responder.ride_id(), "answer refused: {}", err);
                }
            });
        }

        Ok(())
    }

    async fn dismiss(&self, ride_id: Uuid) {
        tracing::debug!(%ride_id, "offer dismissed");
    }

    fn alert(&self, offer: &Offer) {
        tracing::info!(ride_id = %offer.ride_id, "*ding*");
    }
}

async fn log_events(mut events: broadcast::Receiver<DomainEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::info!(?event, "domain event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn riders(simulation: Arc<Simulation>) {
    for _ in 0..3 {
        simulation.add_ride();
    }

    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;

        for _ in 0..sample_binomial(3, 0.4) {
            simulation.add_ride();
        }
    }
}

async fn resolver(simulation: Arc<Simulation>) {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        simulation.resolve();
    }
}

/// Runs the engine against simulated riders and a simulated driver, serving
/// the HTTP interface alongside so the session can be watched and steered.
#[tracing::instrument(skip_all, fields(driver_id = %config.driver_id))]
pub async fn run(mut config: Config) -> Result<(), Error> {
    let backend = Arc::new(MemoryBackend::new());
    let simulation = Arc::new(Simulation::new(backend.clone(), &config.driver_id)?);

    let session = Arc::new(Session::new(config.driver_id.clone()));
    session
        .update_location(simulation.sample_location())
        .await?;

    // waiting rides are only cleared by the poll, so always run it here
    config
        .reconciler
        .refresh_interval
        .get_or_insert(Duration::from_secs(15));

    let host = Arc::new(SimulatedDriver::new(Odds::default())?);
    let engine = Engine::new(backend, session, host, config.clone());

    tokio::spawn(log_events(engine.subscribe_events()));
    tokio::spawn(riders(simulation.clone()));
    tokio::spawn(resolver(simulation));

    engine.go_online().await?;

    tracing::info!(addr = %config.listen_addr, "simulation running");

    server::serve(engine, config.listen_addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OfferAPI;
    use crate::entities::NewCounterOffer;
    use crate::testing::{booking, offer_row, DRIVER_ID};
    use tokio_test::{assert_ok, block_on};

    fn simulation() -> Simulation {
        Simulation::new(Arc::new(MemoryBackend::new()), DRIVER_ID).unwrap()
    }

    #[test]
    fn rides_reach_the_driver() {
        let s = simulation();

        let row = s.add_ride();
        let booking = s.backend().booking(row.ride_id).unwrap();

        assert_eq!(row.driver_id, DRIVER_ID);
        assert_eq!(row.status, OfferStatus::Pending);
        assert!(row.bid_price >= MIN_FARE as i64);
        assert_eq!(booking.bid, row.bid_price);
        assert_ne!(booking.pickup_address, booking.drop_address);

        let rows = block_on(s.backend().fetch_pending_offers(DRIVER_ID)).unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn accepted_rides_get_a_driver() {
        let s = simulation();
        let row = s.add_ride();

        assert_ok!(s.backend().update_offer(row.id, OfferStatus::Accepted));
        s.resolve();

        let booking = s.backend().booking(row.ride_id).unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert!(booking.confirmed_driver_id.is_some());
    }

    #[test]
    fn driver_counters_are_answered() {
        let s = simulation();
        let row = s.add_ride();
        let booking = s.backend().booking(row.ride_id).unwrap();

        let counter = NewCounterOffer {
            ride_id: row.ride_id,
            driver_id: DRIVER_ID.into(),
            user_id: booking.user_id,
            original_amount: row.bid_price as f64,
            counter_amount: row.bid_price as f64 * 1.1,
            offered_by: Proposer::Driver,
            status: CounterOfferStatus::Pending,
            message: None,
        };
        assert_ok!(block_on(s.backend().submit_counter(row.id, counter)));

        s.resolve();

        let counter = &s.backend().counter_offers()[0];
        assert_ne!(counter.status, CounterOfferStatus::Pending);
    }

    #[test]
    fn old_requests_expire() {
        let s = simulation();
        let ride_id = Uuid::new_v4();
        s.backend().add_booking(booking(ride_id));
        let row = s
            .backend()
            .insert_offer(offer_row(0, ride_id, OfferStatus::Pending));
        let fresh = s.add_ride();

        s.resolve();

        assert_eq!(
            s.backend().offer(row.id).map(|row| row.status),
            Some(OfferStatus::Expired)
        );
        assert_eq!(
            s.backend().offer(fresh.id).map(|row| row.status),
            Some(OfferStatus::Pending)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_driver_answers_on_its_own() {
        let s = simulation();
        let row = s.add_ride();

        let odds = Odds {
            accept: 1.0,
            counter: 0.0,
            reject: 0.0,
        };
        let host = Arc::new(SimulatedDriver::new(odds).unwrap());
        let engine = Engine::new(
            s.backend().clone(),
            Arc::new(Session::new(DRIVER_ID)),
            host,
            Config::default(),
        );
        engine.go_online().await.unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(
            s.backend().offer(row.id).map(|row| row.status),
            Some(OfferStatus::Accepted)
        );
        assert_eq!(s.backend().responses().len(), 1);
    }
}
