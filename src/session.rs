use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::fs;
use tokio::sync::watch;

use crate::entities::{Coordinates, DriverLocation};
use crate::error::Error;

/// Used for distances until the driver reports a position.
pub const FALLBACK_LOCATION: Coordinates = Coordinates {
    latitude: 18.5204,
    longitude: 73.8567,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_online: bool,
    #[serde(default)]
    pub last_location: Option<DriverLocation>,
}

/// JSON file holding the state that survives restarts.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<SessionState, Error> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SessionState::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, state: &SessionState) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&self.path, serde_json::to_vec(state)?).await?;

        Ok(())
    }
}

/// The driver's side of the app: identity, availability and position.
#[derive(Debug)]
pub struct Session {
    driver_id: String,
    online: watch::Sender<bool>,
    location: RwLock<Option<DriverLocation>>,
    offline_reason: Mutex<Option<String>>,
    store: Option<SessionStore>,
}

impl Session {
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self::with_state(driver_id.into(), SessionState::default(), None)
    }

    #[tracing::instrument(name = "Session::restore", skip(store))]
    pub async fn restore(driver_id: &str, store: SessionStore) -> Result<Self, Error> {
        let state = store.load().await?;

        tracing::info!(online = state.is_online, "restored session");

        Ok(Self::with_state(driver_id.into(), state, Some(store)))
    }

    fn with_state(driver_id: String, state: SessionState, store: Option<SessionStore>) -> Self {
        let (online, _) = watch::channel(state.is_online);

        Self {
            driver_id,
            online,
            location: RwLock::new(state.last_location),
            offline_reason: Mutex::new(None),
            store,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub async fn set_online(&self, online: bool) -> Result<(), Error> {
        if online {
            *self
                .offline_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
        }

        self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });

        self.persist().await
    }

    /// Drops the driver offline regardless of what they asked for.
    pub async fn force_offline(&self, reason: &str) -> Result<(), Error> {
        tracing::warn!(driver_id = %self.driver_id, reason, "forcing driver offline");

        *self
            .offline_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());

        self.online.send_replace(false);

        self.persist().await
    }

    pub fn offline_reason(&self) -> Option<String> {
        self.offline_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn update_location(&self, coordinates: Coordinates) -> Result<(), Error> {
        *self
            .location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(DriverLocation::new(coordinates));

        self.persist().await
    }

    pub fn location(&self) -> Option<DriverLocation> {
        *self.location.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The last reported position, or the fallback when there is none.
    pub fn last_location(&self) -> Coordinates {
        self.location()
            .map(|location| location.coordinates)
            .unwrap_or(FALLBACK_LOCATION)
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            is_online: self.is_online(),
            last_location: self.location(),
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        match &self.store {
            Some(store) => store.save(&self.state()).await,
            None => Ok(()),
        }
    }
}
