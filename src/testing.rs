use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::engine::{PresentationHost, Responder};
use crate::entities::{
    Booking, BookingStatus, Coordinates, Offer, OfferRow, OfferStatus, Rider, RiderProfile, Stop,
};
use crate::error::Error;

pub const DRIVER_ID: &str = "driver-1";
pub const RIDER_ID: &str = "user-1";

pub fn sent_at() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn booking(ride_id: Uuid) -> Booking {
    Booking {
        id: ride_id,
        user_id: RIDER_ID.into(),
        pickup_address: "Shivaji Nagar, Pune".into(),
        pickup_lat: 18.5308,
        pickup_lng: 73.8475,
        drop_address: "Hinjewadi Phase 1, Pune".into(),
        drop_lat: 18.5912,
        drop_lng: 73.7389,
        vehicle_type: "auto".into(),
        distance_km: 14.2,
        bid: 100,
        note: None,
        status: BookingStatus::Searching,
        confirmed_driver_id: None,
        created_at: Some(sent_at()),
    }
}

pub fn profile(user_id: &str) -> RiderProfile {
    RiderProfile {
        user_id: user_id.into(),
        name: "Asha Kulkarni".into(),
        phone_number: "+919800000000".into(),
        profile_initial: None,
        total_rides: 12,
        rating: Some(4.8),
    }
}

pub fn offer_row(id: i64, ride_id: Uuid, status: OfferStatus) -> OfferRow {
    OfferRow {
        id,
        ride_id,
        driver_id: DRIVER_ID.into(),
        pickup_latitude: 18.5308,
        pickup_longitude: 73.8475,
        vehicle_type: "auto".into(),
        bid_price: 100,
        status,
        sent_at: Some(sent_at()),
        responded_at: None,
    }
}

/// An enriched offer with a bid of 100 at the given pickup distance.
pub fn offer(ride_id: Uuid, distance_to_pickup_km: f64) -> Offer {
    let booking = booking(ride_id);

    Offer {
        offer_id: 1,
        ride_id,
        rider: Rider {
            id: RIDER_ID.into(),
            name: "Asha Kulkarni".into(),
            initial: "A".into(),
            rating: 4.8,
            total_rides: 12,
        },
        pickup: Stop {
            address: booking.pickup_address,
            coordinates: Coordinates::new(booking.pickup_lat, booking.pickup_lng),
        },
        dropoff: Stop {
            address: booking.drop_address,
            coordinates: Coordinates::new(booking.drop_lat, booking.drop_lng),
        },
        vehicle_type: booking.vehicle_type,
        trip_distance_km: booking.distance_km,
        bid_amount: booking.bid,
        note: None,
        distance_to_pickup_km,
        sent_at: sent_at(),
    }
}

/// Host that remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingHost {
    shown: Mutex<Vec<Uuid>>,
    dismissed: Mutex<Vec<Uuid>>,
    alerts: Mutex<Vec<Uuid>>,
    responder: Mutex<Option<Responder>>,
    fail_next: Mutex<Option<Error>>,
    stall_next: Mutex<bool>,
}

impl RecordingHost {
    pub fn shown(&self) -> Vec<Uuid> {
        lock(&self.shown).clone()
    }

    pub fn dismissed(&self) -> Vec<Uuid> {
        lock(&self.dismissed).clone()
    }

    pub fn alerts(&self) -> Vec<Uuid> {
        lock(&self.alerts).clone()
    }

    pub fn responder(&self) -> Option<Responder> {
        lock(&self.responder).clone()
    }

    pub fn fail_next_show(&self, err: Error) {
        *lock(&self.fail_next) = Some(err);
    }

    /// The next `show` never returns.
    pub fn stall_next_show(&self) {
        *lock(&self.stall_next) = true;
    }
}

#[async_trait]
impl PresentationHost for RecordingHost {
    async fn show(&self, offer: &Offer, responder: Responder) -> Result<(), Error> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }

        let stall = std::mem::take(&mut *lock(&self.stall_next));
        if stall {
            std::future::pending::<()>().await;
        }

        lock(&self.shown).push(offer.ride_id);
        *lock(&self.responder) = Some(responder);

        Ok(())
    }

    async fn dismiss(&self, ride_id: Uuid) {
        lock(&self.dismissed).push(ride_id);
    }

    fn alert(&self, offer: &Offer) {
        lock(&self.alerts).push(offer.ride_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
