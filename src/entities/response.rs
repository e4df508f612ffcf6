use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Offer;

const AVERAGE_SPEED_KMH: f64 = 30.0;
const MIN_ETA_MINUTES: i64 = 5;

/// Estimated minutes to reach the pickup at city driving speed.
pub fn eta_minutes(distance_to_pickup_km: f64) -> i64 {
    let minutes = (distance_to_pickup_km / AVERAGE_SPEED_KMH * 60.0).round() as i64;
    minutes.max(MIN_ETA_MINUTES)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "bid_accept")]
    BidAccept,
    #[serde(rename = "bid_rejected")]
    BidRejected,
}

/// The driver's answer to an offer, recorded alongside the offer status change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub ride_id: Uuid,
    pub driver_id: String,
    pub offered_price: i64,
    pub estimated_eta: i64,
    pub offer_type: ResponseKind,
    #[serde(default)]
    pub is_confirmed: bool,
}

impl DriverResponse {
    pub fn accept(offer: &Offer, driver_id: &str) -> Self {
        Self {
            ride_id: offer.ride_id,
            driver_id: driver_id.into(),
            offered_price: offer.bid_amount,
            estimated_eta: eta_minutes(offer.distance_to_pickup_km),
            offer_type: ResponseKind::BidAccept,
            is_confirmed: false,
        }
    }

    pub fn reject(offer: &Offer, driver_id: &str) -> Self {
        Self {
            ride_id: offer.ride_id,
            driver_id: driver_id.into(),
            offered_price: 0,
            estimated_eta: 0,
            offer_type: ResponseKind::BidRejected,
            is_confirmed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::offer;

    #[test]
    fn eta_has_a_floor() {
        assert_eq!(eta_minutes(0.0), 5);
        assert_eq!(eta_minutes(2.5), 5);
        assert_eq!(eta_minutes(20.0), 40);
    }

    #[test]
    fn eta_rounds_to_nearest_minute() {
        // 7.3 km at 30 km/h is 14.6 minutes
        assert_eq!(eta_minutes(7.3), 15);
    }

    #[test]
    fn accept_carries_bid_and_eta() {
        let offer = offer(Uuid::new_v4(), 10.0);
        let response = DriverResponse::accept(&offer, "driver-1");

        assert_eq!(response.offered_price, offer.bid_amount);
        assert_eq!(response.estimated_eta, 20);
        assert_eq!(response.offer_type, ResponseKind::BidAccept);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["offer_type"], "bid_accept");
    }

    #[test]
    fn reject_zeroes_price_and_eta() {
        let offer = offer(Uuid::new_v4(), 10.0);
        let response = DriverResponse::reject(&offer, "driver-1");

        assert_eq!(response.offered_price, 0);
        assert_eq!(response.estimated_eta, 0);
        assert_eq!(response.offer_type, ResponseKind::BidRejected);
    }
}
