use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{Decision, Outcome};
use super::presenter::{Countdown, PresentationHost};
use crate::config::QueueConfig;
use crate::entities::{validate_counter, Offer};
use crate::error::{invalid_state_error, timeout_error, Error};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Queued,
    Presenting,
    /// Accepted or countered; waiting for the server to settle the ride.
    Responded,
}

#[derive(Debug)]
struct Entry {
    offer: Offer,
    phase: Phase,
}

#[derive(Debug)]
struct Slot {
    epoch: u64,
    ride_id: Uuid,
    countdown: Option<Countdown>,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    dismissed: HashSet<Uuid>,
    alerted: HashMap<Uuid, Instant>,
    slot: Option<Slot>,
    epoch: u64,
    scheduled: Option<JoinHandle<()>>,
}

impl State {
    fn entry_mut(&mut self, ride_id: &Uuid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.offer.ride_id == *ride_id)
    }
}

#[derive(Debug)]
enum Effect {
    Alert(Offer),
    Show { epoch: u64, offer: Offer },
    Dismiss(Uuid),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub awaiting: usize,
    pub presenting: Option<Uuid>,
}

enum Target {
    Epoch(u64),
    Ride(Uuid),
}

struct Shared {
    config: QueueConfig,
    session: Arc<Session>,
    state: Mutex<State>,
    presented: watch::Sender<Option<Offer>>,
    effects: mpsc::UnboundedSender<Effect>,
    decisions: mpsc::UnboundedSender<Decision>,
}

/// Hands the driver one offer at a time.
///
/// Offers enter through `sync_queue` and leave when the authoritative list
/// drops them, when the driver rejects, or when the countdown runs out.
/// Accepted and countered offers stay tracked until the server settles the
/// ride. Every settled presentation releases the slot and the next offer is
/// shown after the pacing delay.
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
}

/// Lets the host answer the presentation it was given, and only that one.
#[derive(Clone, Debug)]
pub struct Responder {
    queue: Weak<Shared>,
    epoch: u64,
    ride_id: Uuid,
}

impl Responder {
    pub fn ride_id(&self) -> Uuid {
        self.ride_id
    }

    pub fn is_current(&self) -> bool {
        self.queue
            .upgrade()
            .map(|shared| shared.is_current(self.epoch))
            .unwrap_or(false)
    }

    pub fn respond(&self, outcome: Outcome) -> Result<(), Error> {
        let shared = self.queue.upgrade().ok_or_else(invalid_state_error)?;
        shared.resolve(Target::Epoch(self.epoch), outcome, false)
    }
}

impl DispatchQueue {
    pub fn new(
        config: QueueConfig,
        session: Arc<Session>,
        host: Arc<dyn PresentationHost>,
    ) -> (Self, mpsc::UnboundedReceiver<Decision>) {
        let (effects, effects_rx) = mpsc::unbounded_channel();
        let (decisions, decisions_rx) = mpsc::unbounded_channel();
        let (presented, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            config,
            session,
            state: Mutex::new(State::default()),
            presented,
            effects,
            decisions,
        });

        tokio::spawn(pump(Arc::downgrade(&shared), host, effects_rx));

        (Self { shared }, decisions_rx)
    }

    /// Brings the queue in line with the latest authoritative list, which
    /// arrives ordered by pickup distance.
    #[tracing::instrument(skip_all, fields(offers = offers.len()))]
    pub fn sync_queue(&self, offers: &[Offer]) {
        self.shared.sync(offers)
    }

    pub fn submit_outcome(&self, ride_id: Uuid, outcome: Outcome) -> Result<(), Error> {
        self.shared.resolve(Target::Ride(ride_id), outcome, false)
    }

    /// Treats the presentation as rejected because the driver did not answer.
    pub fn on_presentation_timeout(&self, ride_id: Uuid) -> Result<(), Error> {
        self.shared
            .resolve(Target::Ride(ride_id), Outcome::Reject, true)
    }

    /// Puts an answered offer back in line, used when sending the answer failed.
    pub fn requeue(&self, ride_id: Uuid) {
        self.shared.requeue(ride_id)
    }

    /// Forgets everything and cancels any presentation.
    pub fn clear(&self) {
        self.shared.clear()
    }

    /// Presents the next offer if nothing is showing.
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        self.shared.present_next(&mut state);
    }

    pub fn current_offer(&self) -> Option<Offer> {
        self.shared.presented.borrow().clone()
    }

    pub fn subscribe_presented(&self) -> watch::Receiver<Option<Offer>> {
        self.shared.presented.subscribe()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.shared
            .lock()
            .slot
            .as_ref()
            .and_then(|slot| slot.countdown.as_ref())
            .map(Countdown::remaining)
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.shared
            .lock()
            .entries
            .iter()
            .map(|entry| entry.offer.clone())
            .collect()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();

        let count = |phase| state.entries.iter().filter(|e| e.phase == phase).count();

        QueueStatus {
            queued: count(Phase::Queued),
            awaiting: count(Phase::Responded),
            presenting: state.slot.as_ref().map(|slot| slot.ride_id),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock()
            .slot
            .as_ref()
            .map(|slot| slot.epoch == epoch)
            .unwrap_or(false)
    }

    fn effect(&self, effect: Effect) {
        if self.effects.send(effect).is_err() {
            tracing::warn!("presentation host is gone");
        }
    }

    fn sync(self: &Arc<Self>, offers: &[Offer]) {
        let mut state = self.lock();

        let order: HashMap<Uuid, usize> = offers
            .iter()
            .enumerate()
            .map(|(index, offer)| (offer.ride_id, index))
            .collect();

        state
            .entries
            .retain(|entry| order.contains_key(&entry.offer.ride_id));
        state.dismissed.retain(|ride_id| order.contains_key(ride_id));

        let vanished = state
            .slot
            .as_ref()
            .filter(|slot| !order.contains_key(&slot.ride_id))
            .map(|slot| slot.ride_id);

        if let Some(ride_id) = vanished {
            tracing::info!(%ride_id, "presented offer is gone, cancelling");
            state.slot = None;
            self.presented.send_replace(None);
            self.effect(Effect::Dismiss(ride_id));
            self.schedule_next(&mut state, self.config.pacing_delay);
        }

        let now = Instant::now();
        let window = self.config.alert_window;
        state
            .alerted
            .retain(|_, at| now.saturating_duration_since(*at) < window);

        for offer in offers {
            if state.dismissed.contains(&offer.ride_id) {
                continue;
            }

            if let Some(entry) = state.entry_mut(&offer.ride_id) {
                if entry.offer != *offer {
                    entry.offer = offer.clone();
                }
                continue;
            }

            state.entries.push(Entry {
                offer: offer.clone(),
                phase: Phase::Queued,
            });

            if !state.alerted.contains_key(&offer.ride_id) {
                state.alerted.insert(offer.ride_id, now);
                self.effect(Effect::Alert(offer.clone()));
            }
        }

        state
            .entries
            .sort_by_key(|entry| order.get(&entry.offer.ride_id).copied());

        if state.scheduled.is_none() {
            self.present_next(&mut state);
        }
    }

    fn present_next(self: &Arc<Self>, state: &mut State) {
        if state.slot.is_some() || !self.session.is_online() {
            return;
        }

        let entry = match state.entries.iter_mut().find(|e| e.phase == Phase::Queued) {
            Some(entry) => entry,
            None => return,
        };

        entry.phase = Phase::Presenting;
        let offer = entry.offer.clone();

        state.epoch += 1;
        state.slot = Some(Slot {
            epoch: state.epoch,
            ride_id: offer.ride_id,
            countdown: None,
        });

        tracing::info!(ride_id = %offer.ride_id, epoch = state.epoch, "presenting");

        self.presented.send_replace(Some(offer.clone()));
        self.effect(Effect::Show {
            epoch: state.epoch,
            offer,
        });
    }

    fn schedule_next(self: &Arc<Self>, state: &mut State, delay: Duration) {
        if state.scheduled.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);

        state.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if let Some(shared) = weak.upgrade() {
                let mut state = shared.lock();
                state.scheduled = None;
                shared.present_next(&mut state);
            }
        }));
    }

    fn resolve(
        self: &Arc<Self>,
        target: Target,
        outcome: Outcome,
        implicit: bool,
    ) -> Result<(), Error> {
        let mut state = self.lock();

        let slot = match (&state.slot, &target) {
            (Some(slot), Target::Epoch(epoch)) if slot.epoch == *epoch => slot,
            (Some(slot), Target::Ride(ride_id)) if slot.ride_id == *ride_id => slot,
            _ => return Err(invalid_state_error()),
        };
        let ride_id = slot.ride_id;

        let offer = match state.entry_mut(&ride_id) {
            Some(entry) => entry.offer.clone(),
            None => return Err(invalid_state_error()),
        };

        if let Outcome::Counter { amount, .. } = &outcome {
            validate_counter(*amount, offer.bid_amount as f64)?;
        }

        // dropping the slot stops its countdown
        state.slot = None;

        match outcome {
            Outcome::Reject => {
                state.entries.retain(|e| e.offer.ride_id != ride_id);
                state.dismissed.insert(ride_id);
            }
            Outcome::Accept | Outcome::Counter { .. } => {
                if let Some(entry) = state.entry_mut(&ride_id) {
                    entry.phase = Phase::Responded;
                }
            }
        }

        tracing::info!(%ride_id, ?outcome, implicit, "presentation settled");

        self.presented.send_replace(None);
        self.effect(Effect::Dismiss(ride_id));

        let decision = Decision {
            offer,
            outcome,
            implicit,
        };
        if self.decisions.send(decision).is_err() {
            tracing::warn!(%ride_id, "no one is listening for decisions");
        }

        self.schedule_next(&mut state, self.config.pacing_delay);

        Ok(())
    }

    fn arm(self: &Arc<Self>, epoch: u64) {
        let mut state = self.lock();

        let slot = match state.slot.as_mut() {
            Some(slot) if slot.epoch == epoch && slot.countdown.is_none() => slot,
            _ => return,
        };

        let weak = Arc::downgrade(self);

        slot.countdown = Some(Countdown::start(
            self.config.presentation_timeout,
            move || {
                if let Some(shared) = weak.upgrade() {
                    let _ = shared.resolve(Target::Epoch(epoch), Outcome::Reject, true);
                }
            },
        ));
    }

    fn show_failed(self: &Arc<Self>, epoch: u64, err: Error) {
        let mut state = self.lock();

        let ride_id = match &state.slot {
            Some(slot) if slot.epoch == epoch => slot.ride_id,
            _ => return,
        };

        tracing::warn!(%ride_id, "could not present offer: {}", err);

        state.slot = None;
        if let Some(entry) = state.entry_mut(&ride_id) {
            entry.phase = Phase::Queued;
        }

        self.presented.send_replace(None);
        self.schedule_next(&mut state, self.config.pacing_delay);
    }

    fn requeue(self: &Arc<Self>, ride_id: Uuid) {
        let mut state = self.lock();

        match state.entry_mut(&ride_id) {
            Some(entry) if entry.phase == Phase::Responded => entry.phase = Phase::Queued,
            _ => return,
        }

        if state.scheduled.is_none() {
            self.present_next(&mut state);
        }
    }

    fn clear(&self) {
        let mut state = self.lock();

        if let Some(slot) = state.slot.take() {
            self.effect(Effect::Dismiss(slot.ride_id));
        }
        if let Some(scheduled) = state.scheduled.take() {
            scheduled.abort();
        }

        state.entries.clear();
        state.dismissed.clear();
        state.alerted.clear();

        self.presented.send_replace(None);
    }
}

/// Runs host calls in the order the queue asked for them.
async fn pump(
    queue: Weak<Shared>,
    host: Arc<dyn PresentationHost>,
    mut effects: mpsc::UnboundedReceiver<Effect>,
) {
    while let Some(effect) = effects.recv().await {
        match effect {
            Effect::Alert(offer) => host.alert(&offer),
            Effect::Dismiss(ride_id) => host.dismiss(ride_id).await,
            Effect::Show { epoch, offer } => {
                let shared = match queue.upgrade() {
                    Some(shared) => shared,
                    None => break,
                };

                if !shared.is_current(epoch) {
                    continue;
                }

                let responder = Responder {
                    queue: queue.clone(),
                    epoch,
                    ride_id: offer.ride_id,
                };

                let shown =
                    tokio::time::timeout(shared.config.show_timeout, host.show(&offer, responder))
                        .await
                        .unwrap_or_else(|_| Err(timeout_error()));

                match shown {
                    Ok(()) => shared.arm(epoch),
                    Err(err) => shared.show_failed(epoch, err),
                }
            }
        }
    }
}
