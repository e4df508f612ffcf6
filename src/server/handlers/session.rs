use axum::extract::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineStatus};
use crate::entities::Coordinates;
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct UpdateOnlineParams {
    online: bool,
    /// Marks a forced drop, e.g. lost location permission.
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct UpdateLocationParams {
    coordinates: Coordinates,
}

pub async fn status(Extension(engine): Extension<Engine>) -> Json<EngineStatus> {
    engine.status().into()
}

pub async fn update_online(
    Extension(engine): Extension<Engine>,
    Json(params): Json<UpdateOnlineParams>,
) -> Result<Json<EngineStatus>, Error> {
    match (params.online, params.reason) {
        (true, _) => engine.go_online().await?,
        (false, Some(reason)) => engine.force_offline(&reason).await?,
        (false, None) => engine.go_offline().await?,
    }

    Ok(engine.status().into())
}

pub async fn update_location(
    Extension(engine): Extension<Engine>,
    Json(params): Json<UpdateLocationParams>,
) -> Result<Json<EngineStatus>, Error> {
    engine.update_location(params.coordinates).await?;

    Ok(engine.status().into())
}

pub async fn reset_activity(Extension(engine): Extension<Engine>) -> Json<EngineStatus> {
    engine.reset_activity();

    engine.status().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::HeadlessHost;
    use crate::session::Session;
    use crate::simulation::MemoryBackend;
    use crate::testing::DRIVER_ID;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(Session::new(DRIVER_ID)),
            Arc::new(HeadlessHost),
            Config::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn online_toggle_and_forced_drop() {
        let engine = engine();

        let Json(status) = update_online(
            Extension(engine.clone()),
            Json(UpdateOnlineParams {
                online: true,
                reason: None,
            }),
        )
        .await
        .unwrap();
        assert!(status.online);

        let Json(status) = update_online(
            Extension(engine.clone()),
            Json(UpdateOnlineParams {
                online: false,
                reason: Some("location services disabled".into()),
            }),
        )
        .await
        .unwrap();
        assert!(!status.online);
        assert_eq!(
            status.offline_reason.as_deref(),
            Some("location services disabled")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn location_is_reported_in_status() {
        let engine = engine();

        let Json(status) = update_location(
            Extension(engine),
            Json(UpdateLocationParams {
                coordinates: Coordinates::new(18.5308, 73.8475),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            status.location.map(|location| location.coordinates),
            Some(Coordinates::new(18.5308, 73.8475))
        );
    }
}
