use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub pickup_address: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub drop_address: String,
    pub drop_lat: f64,
    pub drop_lng: f64,
    pub vehicle_type: String,
    pub distance_km: f64,
    pub bid: i64,
    #[serde(default)]
    pub note: Option<String>,
    pub status: BookingStatus,
    #[serde(default)]
    pub confirmed_driver_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Searching,
    Confirmed,
    Cancelled,
    Completed,
    #[serde(other)]
    Unknown,
}

impl Booking {
    pub fn is_confirmed_for(&self, driver_id: &str) -> bool {
        self.status == BookingStatus::Confirmed
            && self.confirmed_driver_id.as_deref() == Some(driver_id)
    }

    pub fn confirm(&mut self, driver_id: &str) {
        self.status = BookingStatus::Confirmed;
        self.confirmed_driver_id = Some(driver_id.into());
    }
}
