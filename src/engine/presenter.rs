use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::Responder;
use crate::entities::Offer;
use crate::error::Error;

/// Whatever puts an offer in front of the driver.
///
/// `show` returns once the prompt is visible; the driver's answer comes back
/// later through the `Responder`. A failed `show` is retried by the queue.
#[async_trait]
pub trait PresentationHost: Send + Sync {
    async fn show(&self, offer: &Offer, responder: Responder) -> Result<(), Error>;

    async fn dismiss(&self, ride_id: Uuid);

    /// Sound or vibrate for a ride the driver has not seen yet.
    fn alert(&self, offer: &Offer);
}

/// Timer for the presented offer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct Countdown {
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl Countdown {
    pub fn start<F>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + duration;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expire();
        });

        Self { deadline, handle }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Host for setups without a screen; answers arrive through the HTTP surface.
#[derive(Debug, Default)]
pub struct HeadlessHost;

#[async_trait]
impl PresentationHost for HeadlessHost {
    async fn show(&self, offer: &Offer, _responder: Responder) -> Result<(), Error> {
        tracing::info!(
            ride_id = %offer.ride_id,
            bid = offer.bid_amount,
            distance_km = offer.distance_to_pickup_km,
            "presenting offer"
        );

        Ok(())
    }

    async fn dismiss(&self, ride_id: Uuid) {
        tracing::info!(%ride_id, "offer dismissed");
    }

    fn alert(&self, offer: &Offer) {
        tracing::info!(ride_id = %offer.ride_id, rider = %offer.rider.name, "new ride offer");
    }
}
