use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{
    Booking, ChangeStream, CounterOffer, DriverResponse, NewCounterOffer, OfferRow, OfferStatus,
    RiderProfile,
};
use crate::error::Error;

#[async_trait]
pub trait OfferAPI {
    async fn fetch_pending_offers(&self, driver_id: &str) -> Result<Vec<OfferRow>, Error>;

    async fn set_offer_status(&self, offer_id: i64, status: OfferStatus) -> Result<(), Error>;

    /// Marks the offer accepted and records the driver's response.
    async fn submit_accept(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error>;

    /// Marks the offer rejected and records the driver's response.
    async fn submit_reject(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error>;

    /// Marks the offer counter-offered and stores the counter-offer.
    async fn submit_counter(&self, offer_id: i64, counter: NewCounterOffer) -> Result<(), Error>;
}

#[async_trait]
pub trait BookingAPI {
    async fn fetch_booking(&self, ride_id: Uuid) -> Result<Booking, Error>;

    async fn fetch_profile(&self, user_id: &str) -> Result<RiderProfile, Error>;

    /// Returns the booking when it is confirmed for this driver and the
    /// driver's offer row is accepted.
    async fn check_confirmed(&self, ride_id: Uuid, driver_id: &str)
        -> Result<Option<Booking>, Error>;
}

#[async_trait]
pub trait ChangeFeedAPI {
    async fn subscribe_offers(&self, driver_id: &str) -> Result<ChangeStream<OfferRow>, Error>;

    async fn subscribe_counter_offers(
        &self,
        driver_id: &str,
    ) -> Result<ChangeStream<CounterOffer>, Error>;
}

pub trait API: OfferAPI + BookingAPI + ChangeFeedAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;
