use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Offer;
use crate::error::{counter_bounds_error, Error};

pub const COUNTER_MIN_RATIO: f64 = 0.8;
pub const COUNTER_MAX_RATIO: f64 = 1.5;

const SUGGESTED_RATIO: f64 = 1.1;
const SUGGESTION_RATIOS: [f64; 4] = [1.05, 1.10, 1.15, 1.20];

/// A counter-offer row as the backend reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterOffer {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: String,
    pub user_id: String,
    pub original_amount: f64,
    pub counter_amount: f64,
    pub offered_by: Proposer,
    pub status: CounterOfferStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A counter-offer about to be submitted by the driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCounterOffer {
    pub ride_id: Uuid,
    pub driver_id: String,
    pub user_id: String,
    pub original_amount: f64,
    pub counter_amount: f64,
    pub offered_by: Proposer,
    pub status: CounterOfferStatus,
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proposer {
    Driver,
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterOfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl CounterOfferStatus {
    pub fn name(&self) -> String {
        match self {
            Self::Pending => "pending".into(),
            Self::Accepted => "accepted".into(),
            Self::Rejected => "rejected".into(),
            Self::Expired => "expired".into(),
        }
    }
}

impl NewCounterOffer {
    pub fn from_driver(
        offer: &Offer,
        driver_id: &str,
        amount: f64,
        message: Option<String>,
    ) -> Result<Self, Error> {
        validate_counter(amount, offer.bid_amount as f64)?;

        Ok(Self {
            ride_id: offer.ride_id,
            driver_id: driver_id.into(),
            user_id: offer.rider.id.clone(),
            original_amount: offer.bid_amount as f64,
            counter_amount: amount,
            offered_by: Proposer::Driver,
            status: CounterOfferStatus::Pending,
            message: message.filter(|m| !m.trim().is_empty()),
        })
    }
}

pub fn counter_bounds(original: f64) -> (f64, f64) {
    (original * COUNTER_MIN_RATIO, original * COUNTER_MAX_RATIO)
}

pub fn is_valid_counter(amount: f64, original: f64) -> bool {
    let (min, max) = counter_bounds(original);
    amount >= min && amount <= max
}

pub fn validate_counter(amount: f64, original: f64) -> Result<(), Error> {
    if is_valid_counter(amount, original) {
        return Ok(());
    }

    let (min, max) = counter_bounds(original);
    Err(counter_bounds_error(min, max))
}

/// Values a counter-offer form starts from, already checked against the bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterDefaults {
    pub min: i64,
    pub max: i64,
    pub suggested: i64,
    pub suggestions: Vec<i64>,
}

impl CounterDefaults {
    pub fn for_bid(bid: i64) -> Self {
        let original = bid as f64;
        let (min, max) = counter_bounds(original);

        let suggestions = SUGGESTION_RATIOS
            .iter()
            .map(|ratio| (original * ratio) as i64)
            .filter(|amount| is_valid_counter(*amount as f64, original))
            .collect();

        let suggested = (original * SUGGESTED_RATIO) as i64;
        let suggested = if is_valid_counter(suggested as f64, original) {
            suggested
        } else {
            bid
        };

        Self {
            min: min.ceil() as i64,
            max: max.floor() as i64,
            suggested,
            suggestions,
        }
    }
}
