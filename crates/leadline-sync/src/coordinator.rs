//! Turns poll ticks, push notifications and manual requests into refresh
//! cycles.
//!
//! At most one cycle runs at a time. A trigger that arrives while a cycle is
//! in flight marks one more cycle as owed; further triggers while one is
//! already owed are absorbed. Push notifications are debounced so a burst of
//! row changes costs a single cycle.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leadline_core::{ChangeEvent, DashboardBundle};
use leadline_ledger::ChangeSubscription;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// One full pass over the ledger. Implementations swallow their own failures
/// and report them in the bundle.
#[async_trait]
pub trait RefreshCycle: Send + Sync + 'static {
    async fn run_cycle(&self, generation: u64) -> DashboardBundle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Poll,
    Push,
    Manual,
}

impl TriggerSource {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Poll => "poll",
            TriggerSource::Push => "push",
            TriggerSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Default)]
struct TriggerCounters {
    push_events: AtomicU64,
    received: AtomicU64,
    launched: AtomicU64,
    deferred: AtomicU64,
    absorbed: AtomicU64,
    discarded: AtomicU64,
}

impl TriggerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStats {
    /// Raw change notifications, before debouncing.
    pub push_events: u64,
    pub received: u64,
    pub launched: u64,
    pub deferred: u64,
    pub absorbed: u64,
    /// Finished cycles dropped because a newer bundle was already published.
    pub discarded: u64,
}

type LatestBundle = Option<Arc<DashboardBundle>>;

/// Publishes `bundle` unless a bundle of the same or a newer generation is
/// already out.
fn publish_if_newer(publisher: &watch::Sender<LatestBundle>, bundle: DashboardBundle) -> bool {
    let generation = bundle.generation;
    publisher.send_if_modified(|slot| match slot {
        Some(current) if current.generation >= generation => false,
        _ => {
            *slot = Some(Arc::new(bundle));
            true
        }
    })
}

async fn join_in_flight(
    slot: &mut Option<JoinHandle<DashboardBundle>>,
) -> Result<DashboardBundle, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_change(subscription: &mut Option<ChangeSubscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

struct Actor {
    cycle: Arc<dyn RefreshCycle>,
    publisher: Arc<watch::Sender<LatestBundle>>,
    counters: Arc<TriggerCounters>,
    in_flight: Option<JoinHandle<DashboardBundle>>,
    /// Source of the deferred trigger, if a cycle is owed.
    owed: Option<TriggerSource>,
    generation: u64,
}

impl Actor {
    fn trigger(&mut self, source: TriggerSource) {
        TriggerCounters::bump(&self.counters.received);
        if self.in_flight.is_none() {
            self.launch(source);
        } else if self.owed.is_none() {
            self.owed = Some(source);
            TriggerCounters::bump(&self.counters.deferred);
            debug!(source = source.as_str(), "refresh in flight; one more owed");
        } else {
            TriggerCounters::bump(&self.counters.absorbed);
            debug!(source = source.as_str(), "refresh already owed; trigger absorbed");
        }
    }

    fn launch(&mut self, source: TriggerSource) {
        self.generation += 1;
        let generation = self.generation;
        let cycle = Arc::clone(&self.cycle);
        TriggerCounters::bump(&self.counters.launched);
        debug!(source = source.as_str(), generation, "launching refresh cycle");
        self.in_flight = Some(tokio::spawn(async move { cycle.run_cycle(generation).await }));
    }

    fn finish(&mut self, joined: Result<DashboardBundle, JoinError>) {
        self.in_flight = None;
        match joined {
            Ok(bundle) => {
                let generation = bundle.generation;
                if !publish_if_newer(&self.publisher, bundle) {
                    TriggerCounters::bump(&self.counters.discarded);
                    debug!(generation, "stale refresh result discarded");
                }
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => warn!(error = %err, "refresh cycle task failed"),
        }
        if let Some(source) = self.owed.take() {
            self.launch(source);
        }
    }

    async fn teardown(&mut self, subscription: Option<&mut ChangeSubscription>) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.owed = None;
    }
}

async fn run_actor(
    mut actor: Actor,
    mut subscription: Option<ChangeSubscription>,
    mut manual_rx: mpsc::Receiver<()>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut debounce: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            joined = join_in_flight(&mut actor.in_flight), if actor.in_flight.is_some() => {
                actor.finish(joined);
            }
            _ = ticker.tick() => actor.trigger(TriggerSource::Poll),
            Some(()) = manual_rx.recv() => actor.trigger(TriggerSource::Manual),
            event = next_change(&mut subscription), if subscription.is_some() => match event {
                Some(event) => {
                    TriggerCounters::bump(&actor.counters.push_events);
                    debug!(kind = ?event.kind, record_id = ?event.record_id, "ledger change received");
                    if debounce.is_none() {
                        debounce = Some(Box::pin(sleep(config.debounce)));
                    }
                }
                None => {
                    warn!("change subscription ended; continuing on poll ticks only");
                    subscription = None;
                }
            },
            _ = async {
                if let Some(timer) = &mut debounce {
                    timer.await;
                }
            }, if debounce.is_some() => {
                debounce = None;
                actor.trigger(TriggerSource::Push);
            }
        }
    }

    actor.teardown(subscription.as_mut()).await;
    info!(generation = actor.generation, "refresh coordinator stopped");
}

/// Handle to the background refresh loop. Dropping it stops the loop.
pub struct RefreshCoordinator {
    manual_tx: mpsc::Sender<()>,
    publisher: Arc<watch::Sender<LatestBundle>>,
    counters: Arc<TriggerCounters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshCoordinator {
    /// Starts the loop. The first poll tick fires immediately and performs the
    /// initial load. Without a subscription only poll and manual triggers run.
    pub fn spawn(
        cycle: Arc<dyn RefreshCycle>,
        subscription: Option<ChangeSubscription>,
        config: CoordinatorConfig,
    ) -> Self {
        let (manual_tx, manual_rx) = mpsc::channel(1);
        let (publisher, _) = watch::channel(None);
        let publisher = Arc::new(publisher);
        let counters = Arc::new(TriggerCounters::default());
        let cancel = CancellationToken::new();

        let actor = Actor {
            cycle,
            publisher: Arc::clone(&publisher),
            counters: Arc::clone(&counters),
            in_flight: None,
            owed: None,
            generation: 0,
        };
        info!(
            poll_ms = config.poll_interval.as_millis() as u64,
            debounce_ms = config.debounce.as_millis() as u64,
            push = subscription.is_some(),
            "refresh coordinator started"
        );
        let task = tokio::spawn(run_actor(
            actor,
            subscription,
            manual_rx,
            config,
            cancel.clone(),
        ));

        Self {
            manual_tx,
            publisher,
            counters,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Asks for a refresh. Returns `false` once the coordinator has stopped.
    pub fn request_refresh(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.manual_tx.try_send(()) {
            Ok(()) => true,
            // A request is already queued and will cover this one.
            Err(mpsc::error::TrySendError::Full(())) => {
                TriggerCounters::bump(&self.counters.received);
                TriggerCounters::bump(&self.counters.absorbed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    pub fn latest(&self) -> Option<Arc<DashboardBundle>> {
        self.publisher.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LatestBundle> {
        self.publisher.subscribe()
    }

    /// Edits the published bundle in place, e.g. to reflect a local write
    /// before the next cycle confirms it. Returns `false` if nothing has been
    /// published yet.
    pub fn amend_latest(&self, amend: impl FnOnce(&mut DashboardBundle)) -> bool {
        self.publisher.send_if_modified(|slot| match slot {
            Some(bundle) => {
                amend(Arc::make_mut(bundle));
                true
            }
            None => false,
        })
    }

    pub fn stats(&self) -> TriggerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TriggerStats {
            push_events: load(&self.counters.push_events),
            received: load(&self.counters.received),
            launched: load(&self.counters.launched),
            deferred: load(&self.counters.deferred),
            absorbed: load(&self.counters.absorbed),
            discarded: load(&self.counters.discarded),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the loop, aborts any in-flight cycle and releases the change
    /// subscription. Nothing runs after this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "refresh coordinator task ended abnormally");
            }
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
