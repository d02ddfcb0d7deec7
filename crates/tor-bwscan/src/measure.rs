//! Measure a single relay: pick a path, build a circuit, and probe it.

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::timeout;
use tor_bwpath::{choose_role, plan_path, Role};
use tor_bwprobe::{
    measure_bandwidth, measure_rtt, measure_upload, CircId, Destination, DestinationPool,
    DownloadSample, ProbeConfig, Transfer, TransferError,
};
use tor_relaylist::{Fingerprint, ProbeVariant, Relay, RelayList};
use tracing::{debug, info, warn};

use crate::{
    CircuitBuilder, CircuitError, MeasurementError, MeasurementResult, Outcome, ShutdownController,
};

/// Everything a measurement task needs, shared by all tasks.
pub(crate) struct MeasureCtx {
    /// The network.
    pub(crate) relays: Arc<RelayList>,
    /// Where we download from.
    pub(crate) destinations: Arc<dyn DestinationPool>,
    /// Builds measurement circuits.
    pub(crate) circuits: Arc<dyn CircuitBuilder>,
    /// Talks to destinations over circuits.
    pub(crate) transfer: Arc<dyn Transfer>,
    /// How to probe.
    pub(crate) probe: ProbeConfig,
    /// Tells us to stop.
    pub(crate) shutdown: ShutdownController,
    /// Recorded in every result.
    pub(crate) nickname: String,
    /// Timeout for building circuits and opening streams.
    pub(crate) socket_timeout: Duration,
}

/// Why probing over a circuit failed.
enum ProbeFailure {
    /// We couldn't reach the destination.  Retrying with the target in
    /// another position might help.
    StreamUnusable(TransferError),
    /// Something failed after we reached the destination.
    Failed(tor_bwprobe::Error),
}

/// What a successful probe found.
type Samples = (Vec<Duration>, Vec<DownloadSample>);

/// How far a measurement got.  Kept outside the measuring task, so we
/// can say what it was doing when it panicked or ran out of time.
#[derive(Debug, Default, Clone)]
pub(crate) struct Progress {
    /// The target's role, once decided.
    role: Option<Role>,
    /// The circuit being measured, once planned.
    path: Vec<Fingerprint>,
}

impl Progress {
    /// Return the circuit being measured, or an empty slice.
    pub(crate) fn path(&self) -> &[Fingerprint] {
        &self.path
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.role, &self.path[..]) {
            (None, _) => write!(f, "before choosing a role"),
            (Some(role), []) => write!(f, "as {}, before choosing a path", role),
            (Some(role), path) => {
                write!(f, "as {}, via", role)?;
                for fp in path {
                    write!(f, " {}", fp)?;
                }
                Ok(())
            }
        }
    }
}

/// Shared record of a measurement's [`Progress`].
pub(crate) type ProgressCell = Arc<Mutex<Progress>>;

/// Lock `cell`, tolerating poison.
fn lock(cell: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    match cell.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Return a copy of what `cell` records.
pub(crate) fn snapshot(cell: &Mutex<Progress>) -> Progress {
    lock(cell).clone()
}

/// Measure `target`, unless there is no point in trying.
///
/// Return None if shutdown has begun or no destination works; in either
/// case, nothing was attempted.
pub(crate) async fn dispatch(
    ctx: &MeasureCtx,
    target: Relay,
    progress: &Mutex<Progress>,
) -> Option<MeasurementResult> {
    if ctx.shutdown.is_shutting_down() {
        debug!("Shutting down; not measuring {}", target);
        return None;
    }
    if !ctx.destinations.functional_destinations() {
        warn!("No functional destinations; not measuring {}", target);
        return None;
    }
    Some(measure_relay(ctx, &target, progress).await)
}

/// Return a failed result for `target`.
fn failure(
    ctx: &MeasureCtx,
    target: &Relay,
    circ: &[Fingerprint],
    dest: Option<&Destination>,
    err: MeasurementError,
) -> MeasurementResult {
    debug!("Measurement of {} failed: {}", target, err);
    MeasurementResult::new(
        target,
        circ,
        dest.map(Destination::url),
        &ctx.nickname,
        Outcome::Failure(err),
    )
}

/// Return a result for a task that panicked with `reason`, after getting
/// as far as `progress`.
pub(crate) fn fault(
    ctx: &MeasureCtx,
    target: &Relay,
    progress: &Progress,
    reason: String,
) -> MeasurementResult {
    let err = MeasurementError::InternalFault(reason);
    failure(ctx, target, progress.path(), None, err)
}

/// Return a result for a task that was still running, after getting as
/// far as `progress`, when `limit` ran out.
pub(crate) fn timed_out(
    ctx: &MeasureCtx,
    target: &Relay,
    progress: &Progress,
    limit: Duration,
) -> MeasurementResult {
    let err = MeasurementError::TimedOut(format!("gave up after {:?}", limit));
    failure(ctx, target, progress.path(), None, err)
}

/// Measure `target`, and report what happened.
async fn measure_relay(
    ctx: &MeasureCtx,
    target: &Relay,
    progress: &Mutex<Progress>,
) -> MeasurementResult {
    let dest = match ctx.destinations.next() {
        Some(d) => d,
        None => {
            return failure(
                ctx,
                target,
                &[],
                None,
                MeasurementError::NoFunctionalDestination,
            )
        }
    };
    let relays = match ctx.relays.relays().await {
        Ok(r) => r,
        Err(e) => {
            warn!("Unable to refresh relay list: {}", e);
            ctx.relays.current()
        }
    };
    let variant = relays.params().probe_variant();
    let mut role = choose_role(target, &relays, dest.port());

    loop {
        {
            let mut p = lock(progress);
            p.role = Some(role);
            p.path.clear();
        }
        let planned = plan_path(&mut rand::thread_rng(), target, &relays, dest.port(), role);
        let path = match planned {
            Ok(p) => p,
            Err(e) => {
                debug!("{}", e);
                return failure(
                    ctx,
                    target,
                    &[],
                    Some(&*dest),
                    MeasurementError::NoHelperAvailable,
                );
            }
        };
        let fps = path.fingerprints();
        lock(progress).path = fps.to_vec();

        let circ = match build_circuit(ctx, &fps).await {
            Ok(c) => c,
            Err(e) => {
                return failure(
                    ctx,
                    target,
                    &fps,
                    Some(&*dest),
                    MeasurementError::NoCircuit(e.to_string()),
                )
            }
        };
        debug!("Built {} through {} and {}", circ, fps[0], fps[1]);

        let probed = probe_circuit(ctx, circ, &dest, variant).await;
        close_circuit(ctx, circ).await;

        match probed {
            Ok((rtts, downloads)) => {
                ctx.destinations.report_success(&dest);
                debug!("Measured {} ({} samples)", target, downloads.len());
                return MeasurementResult::new(
                    target,
                    &fps,
                    Some(dest.url()),
                    &ctx.nickname,
                    Outcome::Success { rtts, downloads },
                );
            }
            Err(ProbeFailure::StreamUnusable(e)) if role == Role::Exit => {
                info!(
                    "Unable to reach {} with {} as exit ({}); trying it as entry",
                    dest.url(),
                    target,
                    e
                );
                role = Role::Entry;
            }
            Err(ProbeFailure::StreamUnusable(e)) => {
                ctx.destinations.report_failure(&dest);
                return failure(
                    ctx,
                    target,
                    &fps,
                    Some(&*dest),
                    MeasurementError::StreamUnusable(e.to_string()),
                );
            }
            Err(ProbeFailure::Failed(e)) => {
                if !matches!(e, tor_bwprobe::Error::Interrupted) {
                    ctx.destinations.report_failure(&dest);
                }
                return failure(
                    ctx,
                    target,
                    &fps,
                    Some(&*dest),
                    MeasurementError::ProbeFailed(e.to_string()),
                );
            }
        }
    }
}

/// Build a circuit through `path`, giving up after the socket timeout.
async fn build_circuit(ctx: &MeasureCtx, path: &[Fingerprint]) -> Result<CircId, CircuitError> {
    match timeout(ctx.socket_timeout, ctx.circuits.build(path)).await {
        Ok(r) => r,
        Err(_) => Err(CircuitError(format!(
            "timed out after {:?}",
            ctx.socket_timeout
        ))),
    }
}

/// Close `circ`, giving up after the socket timeout.
async fn close_circuit(ctx: &MeasureCtx, circ: CircId) {
    if timeout(ctx.socket_timeout, ctx.circuits.close(circ)).await.is_err() {
        warn!(
            "Timed out after {:?} closing {}; leaving it behind",
            ctx.socket_timeout, circ
        );
    }
}

/// Probe `dest` over `circ`.
async fn probe_circuit(
    ctx: &MeasureCtx,
    circ: CircId,
    dest: &Destination,
    variant: ProbeVariant,
) -> Result<Samples, ProbeFailure> {
    if variant == ProbeVariant::Upload {
        let sample = measure_upload(&*ctx.transfer, circ, dest, &ctx.probe)
            .await
            .map_err(ProbeFailure::Failed)?;
        return Ok((Vec::new(), vec![sample]));
    }

    let mut stream = match timeout(ctx.socket_timeout, ctx.transfer.open(circ, dest)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ProbeFailure::StreamUnusable(e)),
        Err(_) => return Err(ProbeFailure::StreamUnusable(TransferError::Timeout)),
    };
    let rtts = measure_rtt(stream.as_mut(), &ctx.probe, dest.content_length())
        .await
        .map_err(ProbeFailure::Failed)?;
    let downloads = measure_bandwidth(
        stream.as_mut(),
        &ctx.probe,
        dest.content_length(),
        &ctx.shutdown,
    )
    .await
    .map_err(ProbeFailure::Failed)?;
    Ok((rtts, downloads))
}
