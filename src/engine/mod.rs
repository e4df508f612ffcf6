mod actions;
mod canonical;
mod events;
mod presenter;
mod queue;
mod reconciler;
mod retry;
mod subscription;

pub use canonical::{CanonicalList, Snapshot};
pub use events::{Activity, Decision, DomainEvent, Feed, Outcome};
pub use presenter::{Countdown, HeadlessHost, PresentationHost};
pub use queue::{DispatchQueue, QueueStatus, Responder};
pub use reconciler::Reconciler;
pub use retry::{with_retry, Growth, RetryPolicy};
pub use subscription::supervise;

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    api::DynAPI,
    config::Config,
    entities::{Coordinates, CounterDefaults, DriverLocation},
    error::{not_found_error, Error},
    session::Session,
};

#[derive(Default)]
struct Tasks {
    feeds: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn healthy(&self) -> bool {
        !self.feeds.is_empty() && self.feeds.iter().all(|task| !task.is_finished())
    }

    fn abort_all(&mut self) {
        for task in self.feeds.drain(..).chain(self.background.drain(..)) {
            task.abort();
        }
    }
}

struct Shared {
    config: Config,
    session: Arc<Session>,
    reconciler: Arc<Reconciler>,
    queue: DispatchQueue,
    tasks: Mutex<Tasks>,
}

/// One driver's dispatch pipeline: feeds into the reconciler, the
/// reconciler's list into the queue, the queue's decisions back to the
/// backend. It runs while the session is online.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStatus {
    pub driver_id: String,
    pub online: bool,
    pub offline_reason: Option<String>,
    pub location: Option<DriverLocation>,
    pub activity: Activity,
    pub offers: usize,
    pub queue: QueueStatus,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all, fields(driver_id = %session.driver_id()))]
    pub fn new(
        api: DynAPI,
        session: Arc<Session>,
        host: Arc<dyn PresentationHost>,
        config: Config,
    ) -> Self {
        let reconciler = Reconciler::new(api, session.clone(), config.reconciler.clone());
        let (queue, decisions) = DispatchQueue::new(config.queue.clone(), session.clone(), host);

        let shared = Arc::new(Shared {
            config,
            session: session.clone(),
            reconciler,
            queue,
            tasks: Mutex::new(Tasks::default()),
        });

        tokio::spawn(dispatch(Arc::downgrade(&shared), decisions));
        tokio::spawn(follow_session(
            Arc::downgrade(&shared),
            session.watch_online(),
        ));

        if session.is_online() {
            shared.start();
        }

        Self { shared }
    }

    pub async fn go_online(&self) -> Result<(), Error> {
        self.shared.session.set_online(true).await?;
        self.shared.start();

        Ok(())
    }

    pub async fn go_offline(&self) -> Result<(), Error> {
        self.shared.session.set_online(false).await?;
        self.shared.stop();

        Ok(())
    }

    pub async fn force_offline(&self, reason: &str) -> Result<(), Error> {
        self.shared.session.force_offline(reason).await?;
        self.shared.stop();

        Ok(())
    }

    pub async fn update_location(&self, coordinates: Coordinates) -> Result<(), Error> {
        self.shared.session.update_location(coordinates).await
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.shared.reconciler
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.shared.queue
    }

    pub fn offers(&self) -> Snapshot {
        self.shared.reconciler.offers()
    }

    pub fn subscribe_offers(&self) -> watch::Receiver<Snapshot> {
        self.shared.reconciler.list().subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.shared.reconciler.subscribe_events()
    }

    pub fn activity(&self) -> Activity {
        self.shared.reconciler.activity()
    }

    pub fn watch_activity(&self) -> watch::Receiver<Activity> {
        self.shared.reconciler.watch_activity()
    }

    pub fn reset_activity(&self) {
        self.shared.reconciler.reset_activity()
    }

    pub fn submit_outcome(&self, ride_id: Uuid, outcome: Outcome) -> Result<(), Error> {
        self.shared.queue.submit_outcome(ride_id, outcome)
    }

    pub fn on_presentation_timeout(&self, ride_id: Uuid) -> Result<(), Error> {
        self.shared.queue.on_presentation_timeout(ride_id)
    }

    pub fn counter_defaults(&self, ride_id: Uuid) -> Result<CounterDefaults, Error> {
        let offer = self
            .shared
            .reconciler
            .list()
            .get(&ride_id)
            .or_else(|| {
                self.shared
                    .queue
                    .offers()
                    .into_iter()
                    .find(|offer| offer.ride_id == ride_id)
            })
            .ok_or_else(not_found_error)?;

        Ok(CounterDefaults::for_bid(offer.bid_amount))
    }

    pub fn status(&self) -> EngineStatus {
        let session = &self.shared.session;

        EngineStatus {
            driver_id: session.driver_id().into(),
            online: session.is_online(),
            offline_reason: session.offline_reason(),
            location: session.location(),
            activity: self.activity(),
            offers: self.offers().len(),
            queue: self.shared.queue.status(),
        }
    }
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts feeds, initial load and the list-to-queue bridge. Does nothing
    /// while both feeds are still running.
    fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks();
        if tasks.healthy() {
            return;
        }

        tracing::info!(driver_id = %self.session.driver_id(), "going online");

        tasks.abort_all();
        self.reconciler.shutdown();
        self.reconciler.open();

        let reconciler = &self.reconciler;

        tasks
            .feeds
            .push(tokio::spawn(reconciler.clone().run_offer_feed()));
        tasks
            .feeds
            .push(tokio::spawn(reconciler.clone().run_counter_feed()));

        let loader = reconciler.clone();
        tasks.background.push(tokio::spawn(async move {
            if let Err(err) = loader.load_pending().await {
                tracing::warn!("initial load failed: {}", err);
            }
        }));

        if let Some(interval) = self.config.reconciler.refresh_interval {
            tasks
                .background
                .push(tokio::spawn(reconciler.clone().run_refresh(interval)));
        }

        tasks.background.push(tokio::spawn(bridge(
            reconciler.list().subscribe(),
            self.queue.clone(),
            self.config.queue.debounce,
        )));

        drop(tasks);

        self.queue.resume();
    }

    fn stop(&self) {
        tracing::info!(driver_id = %self.session.driver_id(), "going offline");

        self.tasks().abort_all();
        self.reconciler.shutdown();
        self.queue.clear();
        self.reconciler.reset_activity();
    }
}

/// Feeds the queue from the canonical list, letting bursts of changes
/// settle for `debounce` first.
async fn bridge(mut offers: watch::Receiver<Snapshot>, queue: DispatchQueue, debounce: Duration) {
    loop {
        let snapshot = offers.borrow_and_update().clone();
        queue.sync_queue(&snapshot);

        if offers.changed().await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                changed = offers.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }
    }
}

/// Sends each settled presentation to the backend. Failed accepts and
/// counters go back in the queue.
async fn dispatch(engine: Weak<Shared>, mut decisions: mpsc::UnboundedReceiver<Decision>) {
    while let Some(decision) = decisions.recv().await {
        let shared = match engine.upgrade() {
            Some(shared) => shared,
            None => break,
        };

        let reconciler = shared.reconciler.clone();
        let queue = shared.queue.clone();

        shared.reconciler.spawn(async move {
            let Decision {
                offer,
                outcome,
                implicit,
            } = decision;
            let requeue = !matches!(outcome, Outcome::Reject);

            let result = match outcome {
                Outcome::Accept => reconciler.accept(&offer).await,
                Outcome::Reject => reconciler.reject(&offer).await,
                Outcome::Counter { amount, message } => {
                    reconciler.counter(&offer, amount, message).await
                }
            };

            if let Err(err) = result {
                tracing::warn!(ride_id = %offer.ride_id, implicit, "decision failed: {}", err);

                if requeue {
                    queue.requeue(offer.ride_id);
                }
            }
        });
    }
}

async fn follow_session(engine: Weak<Shared>, mut online: watch::Receiver<bool>) {
    while online.changed().await.is_ok() {
        let is_online = *online.borrow_and_update();

        let shared = match engine.upgrade() {
            Some(shared) => shared,
            None => break,
        };

        if is_online {
            shared.start();
        } else {
            shared.stop();
        }
    }
}
