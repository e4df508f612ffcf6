use std::future::Future;
use std::sync::Arc;

use super::events::{Activity, DomainEvent};
use super::reconciler::Reconciler;
use crate::api::OfferAPI;
use crate::entities::{DriverResponse, NewCounterOffer, Offer};
use crate::error::{timeout_error, Error};

// Writes are not retried: a repeated accept or counter is not harmless.
impl Reconciler {
    #[tracing::instrument(skip(self, offer), fields(ride_id = %offer.ride_id))]
    pub async fn accept(self: &Arc<Self>, offer: &Offer) -> Result<(), Error> {
        let ride_id = offer.ride_id;
        self.set_activity(Activity::Accepting { ride_id });

        let response = DriverResponse::accept(offer, self.session().driver_id());

        if let Err(err) = self
            .bounded(self.api().submit_accept(offer.offer_id, response))
            .await
        {
            self.fail("Failed to accept ride", &err);
            return Err(err);
        }

        tokio::time::sleep(self.config().consistency_delay).await;

        match self.confirmed_booking(ride_id).await {
            Some(booking) => {
                tracing::info!("ride confirmed");
                self.list().remove(ride_id);
                self.set_activity(Activity::RideAccepted {
                    booking: booking.clone(),
                });
                self.emit(DomainEvent::RideAccepted { booking });
            }
            None => {
                tracing::info!("waiting for rider confirmation");
                self.set_activity(Activity::WaitingForConfirmation { ride_id });
                self.emit(DomainEvent::AwaitingConfirmation { ride_id });

                let this = self.clone();
                self.spawn(async move { this.await_confirmation(ride_id).await });
            }
        }

        Ok(())
    }

    /// The offer leaves the list whether or not the server heard about it.
    #[tracing::instrument(skip(self, offer), fields(ride_id = %offer.ride_id))]
    pub async fn reject(self: &Arc<Self>, offer: &Offer) -> Result<(), Error> {
        let ride_id = offer.ride_id;
        self.list().remove(ride_id);

        let response = DriverResponse::reject(offer, self.session().driver_id());

        self.bounded(self.api().submit_reject(offer.offer_id, response))
            .await
            .map_err(|err| {
                tracing::warn!("reject not recorded: {}", err);
                err
            })?;

        self.emit(DomainEvent::OfferRejected { ride_id });

        Ok(())
    }

    #[tracing::instrument(skip(self, offer, message), fields(ride_id = %offer.ride_id))]
    pub async fn counter(
        self: &Arc<Self>,
        offer: &Offer,
        amount: f64,
        message: Option<String>,
    ) -> Result<(), Error> {
        let ride_id = offer.ride_id;
        let counter =
            NewCounterOffer::from_driver(offer, self.session().driver_id(), amount, message)?;

        self.set_activity(Activity::SubmittingCounter { ride_id });

        match self
            .bounded(self.api().submit_counter(offer.offer_id, counter))
            .await
        {
            Ok(()) => {
                self.flash(
                    Activity::CounterSubmitted { ride_id },
                    self.config().counter_banner,
                );
                self.emit(DomainEvent::CounterOfferSent { ride_id, amount });
                Ok(())
            }
            Err(err) => {
                self.fail("Failed to submit counter offer", &err);
                Err(err)
            }
        }
    }

    fn fail(self: &Arc<Self>, what: &str, err: &Error) {
        tracing::error!("{}: {}", what, err);

        self.flash(
            Activity::Error {
                message: format!("{}: {}", what, err),
            },
            self.config().error_banner,
        );
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.config().request_timeout, request)
            .await
            .unwrap_or_else(|_| Err(timeout_error()))
    }
}
