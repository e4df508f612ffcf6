mod handlers;

use std::net::SocketAddr;

use axum::{
    extract::Extension,
    routing::{get, patch, post},
    Router,
};

use crate::engine::Engine;
use crate::error::{unexpected_error, Error};
use crate::server::handlers::{offers, session};

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/offers", get(offers::list))
        .route("/offers/current", get(offers::current))
        .route("/offers/:ride_id/accept", post(offers::accept))
        .route("/offers/:ride_id/reject", post(offers::reject))
        .route("/offers/:ride_id/counter", post(offers::counter))
        .route("/offers/:ride_id/timeout", post(offers::timeout))
        .route(
            "/offers/:ride_id/counter_defaults",
            get(offers::counter_defaults),
        )
        .route("/status", get(session::status))
        .route("/session/online", patch(session::update_online))
        .route("/session/location", patch(session::update_location))
        .route("/session/activity/reset", post(session::reset_activity))
        .layer(Extension(engine))
}

pub async fn serve(engine: Engine, addr: SocketAddr) -> Result<(), Error> {
    let app = router(engine);

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            tracing::error!("server error: {}", err);
            unexpected_error()
        })
}
