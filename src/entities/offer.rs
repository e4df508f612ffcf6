use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Booking, Coordinates, RiderProfile};

/// A row of the driver's offer table as the backend stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfferRow {
    pub id: i64,
    pub ride_id: Uuid,
    pub driver_id: String,
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub vehicle_type: String,
    pub bid_price: i64,
    #[serde(default)]
    pub status: OfferStatus,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub responded_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    #[default]
    Pending,
    Accepted,
    CounterOffered,
    Rejected,
    Expired,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl OfferStatus {
    pub fn name(&self) -> String {
        match self {
            Self::Pending => "pending".into(),
            Self::Accepted => "accepted".into(),
            Self::CounterOffered => "counter_offered".into(),
            Self::Rejected => "rejected".into(),
            Self::Expired => "expired".into(),
            Self::Cancelled => "cancelled".into(),
            Self::Unknown => "unknown".into(),
        }
    }

    /// The offer can no longer be won by anyone through this row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Cancelled)
    }
}

impl OfferRow {
    pub fn pickup(&self) -> Coordinates {
        Coordinates::new(self.pickup_latitude, self.pickup_longitude)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rider {
    pub id: String,
    pub name: String,
    pub initial: String,
    pub rating: f64,
    pub total_rides: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub address: String,
    pub coordinates: Coordinates,
}

/// An enriched ride proposal as shown to the driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: i64,
    pub ride_id: Uuid,
    pub rider: Rider,
    pub pickup: Stop,
    pub dropoff: Stop,
    pub vehicle_type: String,
    pub trip_distance_km: f64,
    pub bid_amount: i64,
    pub note: Option<String>,
    pub distance_to_pickup_km: f64,
    pub sent_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        row: &OfferRow,
        booking: &Booking,
        profile: &RiderProfile,
        driver_position: Coordinates,
    ) -> Self {
        Self {
            offer_id: row.id,
            ride_id: booking.id,
            rider: Rider {
                id: booking.user_id.clone(),
                name: profile.name.clone(),
                initial: profile.initial(),
                rating: profile.rating.unwrap_or_default(),
                total_rides: profile.total_rides,
            },
            pickup: Stop {
                address: booking.pickup_address.clone(),
                coordinates: Coordinates::new(booking.pickup_lat, booking.pickup_lng),
            },
            dropoff: Stop {
                address: booking.drop_address.clone(),
                coordinates: Coordinates::new(booking.drop_lat, booking.drop_lng),
            },
            vehicle_type: booking.vehicle_type.clone(),
            trip_distance_km: booking.distance_km,
            bid_amount: row.bid_price,
            note: booking.note.clone(),
            distance_to_pickup_km: driver_position.distance_km(&row.pickup()),
            sent_at: row.sent_at.unwrap_or_else(Utc::now),
        }
    }
}
