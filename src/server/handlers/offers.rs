use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{Engine, Outcome, QueueStatus};
use crate::entities::{CounterDefaults, Offer};
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct CounterParams {
    amount: f64,
    #[serde(default)]
    message: Option<String>,
}

/// The offer in front of the driver and what a counter form needs for it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Presentation {
    offer: Offer,
    remaining_secs: Option<u64>,
    counter: CounterDefaults,
}

pub async fn list(Extension(engine): Extension<Engine>) -> Json<Vec<Offer>> {
    Json(engine.offers().to_vec())
}

pub async fn current(Extension(engine): Extension<Engine>) -> Json<Option<Presentation>> {
    let queue = engine.queue();

    let presentation = queue.current_offer().map(|offer| Presentation {
        remaining_secs: queue.remaining().map(|remaining| remaining.as_secs()),
        counter: CounterDefaults::for_bid(offer.bid_amount),
        offer,
    });

    presentation.into()
}

pub async fn accept(
    Extension(engine): Extension<Engine>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<QueueStatus>, Error> {
    engine.submit_outcome(ride_id, Outcome::Accept)?;

    Ok(engine.queue().status().into())
}

pub async fn reject(
    Extension(engine): Extension<Engine>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<QueueStatus>, Error> {
    engine.submit_outcome(ride_id, Outcome::Reject)?;

    Ok(engine.queue().status().into())
}

pub async fn counter(
    Extension(engine): Extension<Engine>,
    Path(ride_id): Path<Uuid>,
    Json(params): Json<CounterParams>,
) -> Result<Json<QueueStatus>, Error> {
    engine.submit_outcome(
        ride_id,
        Outcome::Counter {
            amount: params.amount,
            message: params.message,
        },
    )?;

    Ok(engine.queue().status().into())
}

pub async fn timeout(
    Extension(engine): Extension<Engine>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<QueueStatus>, Error> {
    engine.on_presentation_timeout(ride_id)?;

    Ok(engine.queue().status().into())
}

pub async fn counter_defaults(
    Extension(engine): Extension<Engine>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<CounterDefaults>, Error> {
    let defaults = engine.counter_defaults(ride_id)?;

    Ok(defaults.into())
}
