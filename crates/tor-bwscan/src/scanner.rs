//! The measurement loop: run rounds of relay measurements until told to
//! stop.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{timeout, Instant};
use tor_bwprobe::{DestinationPool, ProbeConfig, Transfer};
use tor_relaylist::{Relay, RelayList};
use tracing::{debug, error, info, warn};

use crate::measure::{self, MeasureCtx, ProgressCell};
use crate::{
    CircuitBuilder, Heartbeat, HeartbeatReport, MeasurementError, MeasurementResult,
    PrioritySource, Result, ResultSink, ScannerConfig, ScannerState, ShutdownController,
    StateStore,
};

/// The collaborators a scanner measures through.
#[allow(clippy::exhaustive_structs)]
pub struct Backends {
    /// Builds measurement circuits.
    pub circuits: Arc<dyn CircuitBuilder>,
    /// Talks to destinations over those circuits.
    pub transfer: Arc<dyn Transfer>,
    /// Chooses destinations and tracks their health.
    pub destinations: Arc<dyn DestinationPool>,
}

/// Where a [`Scanner`] is in its current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RoundState {
    /// Between rounds.
    Idle,
    /// Starting measurement tasks.
    Submitting,
    /// Waiting for measurement tasks to finish.
    Collecting,
    /// Giving unfinished tasks a last chance before abandoning them.
    Draining,
    /// Done for good.
    Stopped,
}

/// What happened during one round.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RoundSummary {
    /// Which round this was, counting from 1 across restarts.
    pub round: u64,
    /// How many measurement tasks were started.
    pub submitted: usize,
    /// How many of those finished.
    pub completed: usize,
    /// How many of those were abandoned unfinished.
    pub abandoned: usize,
    /// How long the round took.
    pub duration: Duration,
    /// True if the round measured a testing network.
    pub testing_network: bool,
    /// Overall progress after the round.
    pub progress: HeartbeatReport,
}

/// A message from a finished measurement task.
struct TaskDone {
    /// Which task.
    idx: usize,
    /// What it returned, whether it ran out of time, or why it panicked.
    outcome: std::thread::Result<std::result::Result<Option<MeasurementResult>, Elapsed>>,
}

/// A measurement task that has not reported yet.
struct Task {
    /// The relay it measures.
    relay: Relay,
    /// How far it got.
    progress: ProgressCell,
    /// The task itself.
    handle: JoinHandle<()>,
}

/// The tasks that have not reported yet, by index.
type Pending = HashMap<usize, Task>;

/// Measures relays, a round at a time.
pub struct Scanner {
    /// Shared with every measurement task.
    ctx: Arc<MeasureCtx>,
    /// Our configuration.
    config: ScannerConfig,
    /// Picks the relays for each round.
    priority: Arc<dyn PrioritySource>,
    /// Where results go.
    sink: ResultSink,
    /// Tracks overall progress.
    heartbeat: Heartbeat,
    /// Where state is saved between rounds, if anywhere.
    store: Option<Arc<dyn StateStore>>,
    /// The state we save.
    saved: ScannerState,
    /// Where we are in the round.
    state: RoundState,
}

impl Scanner {
    /// Construct a new scanner.
    ///
    /// Fails if the scanner or probe configuration can't work.
    pub fn new(
        config: ScannerConfig,
        probe: ProbeConfig,
        relays: Arc<RelayList>,
        backends: Backends,
        priority: Arc<dyn PrioritySource>,
        sink: ResultSink,
        shutdown: ShutdownController,
    ) -> Result<Self> {
        config.validate()?;
        probe.validate()?;
        let ctx = MeasureCtx {
            relays,
            destinations: backends.destinations,
            circuits: backends.circuits,
            transfer: backends.transfer,
            probe,
            shutdown,
            nickname: config.nickname().to_string(),
            socket_timeout: config.socket_timeout(),
        };
        Ok(Scanner {
            ctx: Arc::new(ctx),
            config,
            priority,
            sink,
            heartbeat: Heartbeat::new(),
            store: None,
            saved: ScannerState::starting_now(),
            state: RoundState::Idle,
        })
    }

    /// Save state to `store` after every round, continuing from `state`.
    ///
    /// The store must already be writable: for an [`FsStateStore`](crate::FsStateStore),
    /// call [`try_lock`](crate::FsStateStore::try_lock) first.  Otherwise
    /// every save fails with a warning.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>, state: ScannerState) -> Self {
        self.saved = state;
        if self.saved.scanner_started.is_none() {
            self.saved.scanner_started = ScannerState::starting_now().scanner_started;
        }
        self.store = Some(store);
        self
    }

    /// Return where we are in the current round.
    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Return how many rounds have finished, including those from before a
    /// restart.
    pub fn rounds(&self) -> u64 {
        self.saved.rounds
    }

    /// Run rounds until shutdown.
    ///
    /// On a testing network, run exactly one round.
    pub async fn run(&mut self) -> Result<()> {
        info!("Scanner {} starting", self.config.nickname());
        let shutdown = self.ctx.shutdown.clone();
        while !shutdown.is_shutting_down() {
            let summary = self.run_round().await?;
            if summary.testing_network {
                info!("Testing network: stopping after one round.");
                shutdown.trigger();
            } else if summary.submitted == 0 && !shutdown.is_shutting_down() {
                debug!("Nothing to measure; waiting before the next round.");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.socket_timeout()) => {}
                    _ = shutdown.wait() => {}
                }
            }
        }
        self.state = RoundState::Stopped;
        info!(
            "Scanner {} stopped after {} rounds",
            self.config.nickname(),
            self.saved.rounds
        );
        Ok(())
    }

    /// Run a single round of measurements.
    pub async fn run_round(&mut self) -> Result<RoundSummary> {
        let started = Instant::now();
        let round = self.saved.rounds + 1;
        let relays = self.ctx.relays.relays().await?;
        self.heartbeat
            .register_consensus_fprs(relays.fingerprints());

        self.state = RoundState::Submitting;
        let targets = self.priority.best_priority(&relays);
        info!(
            "Round {}: measuring {} of {} relays",
            round,
            targets.len(),
            relays.len()
        );
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut pending = self.submit(targets, &done_tx);
        drop(done_tx);
        let submitted = pending.len();
        let mut completed = 0;

        self.state = RoundState::Collecting;
        let shutdown = self.ctx.shutdown.clone();
        while !pending.is_empty() {
            tokio::select! {
                done = done_rx.recv() => match done {
                    Some(done) => {
                        self.complete(&mut pending, done).await;
                        completed += 1;
                    }
                    None => break,
                },
                _ = shutdown.wait() => {
                    info!("Shutting down; waiting for {} measurements", pending.len());
                    break;
                }
            }
        }

        self.state = RoundState::Draining;
        let deadline = Instant::now() + self.config.drain_timeout();
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some(done)) => {
                    self.complete(&mut pending, done).await;
                    completed += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        let abandoned = pending.len();
        for (_, task) in pending.drain() {
            warn!(
                "Measurement of {} ({}) did not finish in time; abandoning it",
                task.relay,
                measure::snapshot(&task.progress)
            );
            task.handle.abort();
        }

        self.state = RoundState::Idle;
        self.saved.rounds = round;
        let progress = self.heartbeat.print_heartbeat_message(round);
        self.persist();
        let duration = started.elapsed();
        info!(
            "Round {} took {:?}: {} measured, {} abandoned",
            round, duration, completed, abandoned
        );
        Ok(RoundSummary {
            round,
            submitted,
            completed,
            abandoned,
            duration,
            testing_network: relays.testing_network(),
            progress,
        })
    }

    /// Start one measurement task for each of `targets`, stopping early on
    /// shutdown.
    fn submit(&self, targets: Vec<Relay>, done_tx: &mpsc::UnboundedSender<TaskDone>) -> Pending {
        let permits = Arc::new(Semaphore::new(self.config.measurement_threads()));
        let limit = self.config.measurement_timeout();
        let mut pending = HashMap::new();
        for (idx, target) in targets.into_iter().enumerate() {
            if self.ctx.shutdown.is_shutting_down() {
                info!("Shutting down; not starting more measurements");
                break;
            }
            let ctx = Arc::clone(&self.ctx);
            let permits = Arc::clone(&permits);
            let done_tx = done_tx.clone();
            let relay = target.clone();
            let progress = ProgressCell::default();
            let task_progress = Arc::clone(&progress);
            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let measuring = measure::dispatch(&ctx, relay, &task_progress);
                let outcome = AssertUnwindSafe(timeout(limit, measuring))
                    .catch_unwind()
                    .await;
                let _ = done_tx.send(TaskDone { idx, outcome });
            });
            pending.insert(
                idx,
                Task {
                    relay: target,
                    progress,
                    handle,
                },
            );
        }
        pending
    }

    /// Handle a finished task.
    async fn complete(&mut self, pending: &mut Pending, done: TaskDone) {
        let Task {
            relay, progress, ..
        } = match pending.remove(&done.idx) {
            Some(task) => task,
            None => return,
        };
        self.ctx.relays.note_measurement_attempt(&relay);
        self.heartbeat.register_measured_fpr(*relay.fingerprint());

        let result = match done.outcome {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => return,
            Ok(Err(_)) => {
                let progress = measure::snapshot(&progress);
                let limit = self.config.measurement_timeout();
                warn!(
                    "Measurement of {} ({}) took longer than {:?}; giving up",
                    relay, progress, limit
                );
                measure::timed_out(&self.ctx, &relay, &progress, limit)
            }
            Err(panic) => {
                let msg = panic_message(&*panic);
                let progress = measure::snapshot(&progress);
                error!(
                    "Measurement of {} ({}) panicked: {}",
                    relay, progress, msg
                );
                measure::fault(&self.ctx, &relay, &progress, msg)
            }
        };
        let no_destination = result.error() == Some(&MeasurementError::NoFunctionalDestination);
        self.sink.offer(result).await;
        if no_destination && self.ctx.shutdown.trigger() {
            error!("No functional destinations left; shutting down.");
        }
    }

    /// Save our state, if we have somewhere to save it.
    fn persist(&mut self) {
        let store = match &self.store {
            Some(s) => s,
            None => return,
        };
        self.saved.history = self.ctx.relays.saved_history();
        if let Err(e) = store.store(&self.saved) {
            warn!("Unable to save scanner state: {}", e);
        }
    }
}

/// Describe a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
