use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::feed::poll;
use crate::{
    api::{BookingAPI, ChangeFeedAPI, OfferAPI, API},
    config::BackendConfig,
    entities::{
        Booking, BookingStatus, ChangeStream, CounterOffer, DriverResponse, NewCounterOffer,
        OfferRow, OfferStatus, RiderProfile,
    },
    error::{invalid_input_error, not_found_error, upstream_error, Error},
};

const OFFERS: &str = "ride_requests";
const BOOKINGS: &str = "ride_bookings";
const PROFILES: &str = "user_profiles";
const RESPONSES: &str = "driver_ride_responses";
const COUNTER_OFFERS: &str = "counter_offers";

/// Settled rows older than this leave the feed; pending rows never do.
const FEED_HISTORY_HOURS: i64 = 24;

type Query<'a> = [(&'a str, String)];

/// Repository over a PostgREST-style HTTP interface.
#[derive(Clone, Debug)]
pub struct RestBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

#[derive(Debug, Deserialize)]
struct BookingState {
    confirmed_driver_id: Option<String>,
    status: BookingStatus,
}

impl RestBackend {
    pub fn new(config: BackendConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.api_base.trim_end_matches('/'),
            table
        )
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(table))
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query<'_>,
    ) -> Result<Vec<T>, Error> {
        let res = self
            .request(Method::GET, table)
            .query(&[("select", "*")])
            .query(query)
            .send()
            .await?;

        check_status(&res)?;

        Ok(res.json().await?)
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query<'_>,
    ) -> Result<T, Error> {
        self.select(table, query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(not_found_error)
    }

    async fn insert<B: Serialize + ?Sized>(&self, table: &str, body: &B) -> Result<(), Error> {
        let res = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;

        check_status(&res)
    }

    async fn update<B: Serialize + ?Sized>(
        &self,
        table: &str,
        query: &Query<'_>,
        body: &B,
    ) -> Result<(), Error> {
        let res = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=minimal")
            .query(query)
            .json(body)
            .send()
            .await?;

        check_status(&res)
    }

    /// Every pending offer row of the driver plus the recently settled ones.
    async fn driver_offers(&self, driver_id: &str) -> Result<Vec<OfferRow>, Error> {
        self.select(
            OFFERS,
            &[
                ("driver_id", eq(driver_id)),
                ("or", feed_window("sent_at", Utc::now())),
            ],
        )
        .await
    }

    async fn driver_counter_offers(&self, driver_id: &str) -> Result<Vec<CounterOffer>, Error> {
        self.select(
            COUNTER_OFFERS,
            &[
                ("driver_id", eq(driver_id)),
                ("or", feed_window("created_at", Utc::now())),
            ],
        )
        .await
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

fn feed_window(timestamp: &str, now: DateTime<Utc>) -> String {
    let since = now - Duration::hours(FEED_HISTORY_HOURS);

    format!(
        "(status.eq.pending,{}.gte.{})",
        timestamp,
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn check_status(res: &Response) -> Result<(), Error> {
    status_error(res.status().as_u16())
}

fn status_error(status_code: u16) -> Result<(), Error> {
    if (400..500).contains(&status_code) {
        return Err(invalid_input_error());
    } else if !(200..300).contains(&status_code) {
        return Err(upstream_error());
    }

    Ok(())
}

#[async_trait]
impl OfferAPI for RestBackend {
    #[tracing::instrument(skip(self))]
    async fn fetch_pending_offers(&self, driver_id: &str) -> Result<Vec<OfferRow>, Error> {
        self.select(
            OFFERS,
            &[
                ("driver_id", eq(driver_id)),
                ("status", eq(OfferStatus::Pending.name())),
            ],
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn set_offer_status(&self, offer_id: i64, status: OfferStatus) -> Result<(), Error> {
        self.update(
            OFFERS,
            &[("id", eq(offer_id))],
            &json!({ "status": status }),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn submit_accept(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error> {
        self.set_offer_status(offer_id, OfferStatus::Accepted)
            .await?;
        self.insert(RESPONSES, &response).await
    }

    #[tracing::instrument(skip(self))]
    async fn submit_reject(&self, offer_id: i64, response: DriverResponse) -> Result<(), Error> {
        self.set_offer_status(offer_id, OfferStatus::Rejected)
            .await?;
        self.insert(RESPONSES, &response).await
    }

    #[tracing::instrument(skip(self))]
    async fn submit_counter(&self, offer_id: i64, counter: NewCounterOffer) -> Result<(), Error> {
        self.set_offer_status(offer_id, OfferStatus::CounterOffered)
            .await?;
        self.insert(COUNTER_OFFERS, &counter).await
    }
}

#[async_trait]
impl BookingAPI for RestBackend {
    #[tracing::instrument(skip(self))]
    async fn fetch_booking(&self, ride_id: Uuid) -> Result<Booking, Error> {
        self.select_one(BOOKINGS, &[("id", eq(ride_id))]).await
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_profile(&self, user_id: &str) -> Result<RiderProfile, Error> {
        self.select_one(PROFILES, &[("user_id", eq(user_id))])
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn check_confirmed(
        &self,
        ride_id: Uuid,
        driver_id: &str,
    ) -> Result<Option<Booking>, Error> {
        let accepted: Vec<OfferRow> = self
            .select(
                OFFERS,
                &[
                    ("ride_id", eq(ride_id)),
                    ("driver_id", eq(driver_id)),
                    ("status", eq(OfferStatus::Accepted.name())),
                ],
            )
            .await?;

        if accepted.is_empty() {
            return Ok(None);
        }

        let state: Option<BookingState> = self
            .select(BOOKINGS, &[("id", eq(ride_id))])
            .await?
            .into_iter()
            .next();

        let confirmed = state
            .map(|state| {
                state.status == BookingStatus::Confirmed
                    && state.confirmed_driver_id.as_deref() == Some(driver_id)
            })
            .unwrap_or(false);

        if !confirmed {
            return Ok(None);
        }

        Ok(Some(self.fetch_booking(ride_id).await?))
    }
}

#[async_trait]
impl ChangeFeedAPI for RestBackend {
    #[tracing::instrument(skip(self))]
    async fn subscribe_offers(&self, driver_id: &str) -> Result<ChangeStream<OfferRow>, Error> {
        let backend = self.clone();
        let driver_id = driver_id.to_owned();

        poll(
            move || {
                let backend = backend.clone();
                let driver_id = driver_id.clone();
                async move { backend.driver_offers(&driver_id).await }
            },
            |row: &OfferRow| row.id,
            self.config.poll_interval,
            self.config.request_timeout,
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn subscribe_counter_offers(
        &self,
        driver_id: &str,
    ) -> Result<ChangeStream<CounterOffer>, Error> {
        let backend = self.clone();
        let driver_id = driver_id.to_owned();

        poll(
            move || {
                let backend = backend.clone();
                let driver_id = driver_id.clone();
                async move { backend.driver_counter_offers(&driver_id).await }
            },
            |counter: &CounterOffer| counter.id,
            self.config.poll_interval,
            self.config.request_timeout,
        )
        .await
    }
}

impl API for RestBackend {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend(api_base: &str) -> RestBackend {
        RestBackend::new(BackendConfig {
            api_base: api_base.into(),
            api_key: "anon".into(),
            poll_interval: std::time::Duration::from_secs(2),
            request_timeout: std::time::Duration::from_secs(8),
        })
        .unwrap()
    }

    #[test]
    fn table_urls() {
        assert_eq!(
            backend("https://db.example.com/").url(OFFERS),
            "https://db.example.com/rest/v1/ride_requests"
        );
        assert_eq!(
            backend("https://db.example.com").url(COUNTER_OFFERS),
            "https://db.example.com/rest/v1/counter_offers"
        );
    }

    #[test]
    fn status_codes_map_to_errors() {
        assert_eq!(status_error(200), Ok(()));
        assert_eq!(status_error(204), Ok(()));
        assert_eq!(status_error(404), Err(invalid_input_error()));
        assert_eq!(status_error(503), Err(upstream_error()));
        assert_eq!(status_error(302), Err(upstream_error()));
    }

    #[test]
    fn feed_keeps_pending_rows_regardless_of_age() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(
            feed_window("sent_at", now),
            "(status.eq.pending,sent_at.gte.2023-11-13T22:13:20Z)"
        );
    }

    #[test]
    fn filters_use_eq_operator() {
        assert_eq!(eq("driver-1"), "eq.driver-1");
        assert_eq!(eq(42), "eq.42");
    }
}
