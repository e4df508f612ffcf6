use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entities::{Booking, Offer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    Offers,
    CounterOffers,
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offers => write!(f, "ride_requests"),
            Self::CounterOffers => write!(f, "counter_offers"),
        }
    }
}

/// Something the driver should hear about once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    NewOffer { offer: Offer },
    OfferCancelled { ride_id: Uuid },
    TakenByOther { ride_id: Uuid },
    RideWon { booking: Booking },
    RideAccepted { booking: Booking },
    AwaitingConfirmation { ride_id: Uuid },
    OfferRejected { ride_id: Uuid },
    CounterOfferSent { ride_id: Uuid, amount: f64 },
    CounterAccepted { ride_id: Uuid },
    CounterAcceptedAndConfirmed { booking: Booking },
    CounterRejected { ride_id: Uuid },
    CounterExpired { ride_id: Uuid },
    ConnectionLost { feed: Feed },
}

/// What the driver-facing side is busy with right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Loading,
    Accepting { ride_id: Uuid },
    WaitingForConfirmation { ride_id: Uuid },
    RideAccepted { booking: Booking },
    SubmittingCounter { ride_id: Uuid },
    CounterSubmitted { ride_id: Uuid },
    Error { message: String },
}

/// The driver's verdict on a presented offer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outcome {
    Accept,
    Reject,
    Counter {
        amount: f64,
        #[serde(default)]
        message: Option<String>,
    },
}

/// An outcome the queue settled on, waiting to be sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub offer: Offer,
    pub outcome: Outcome,
    /// Set when the countdown ran out rather than the driver answering.
    pub implicit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_parse_from_requests() {
        let outcome: Outcome = serde_json::from_value(serde_json::json!({
            "action": "counter",
            "amount": 120.0
        }))
        .unwrap();

        assert_eq!(
            outcome,
            Outcome::Counter {
                amount: 120.0,
                message: None
            }
        );
    }

    #[test]
    fn feeds_name_their_tables() {
        assert_eq!(Feed::Offers.to_string(), "ride_requests");
        assert_eq!(Feed::CounterOffers.to_string(), "counter_offers");
    }
}
