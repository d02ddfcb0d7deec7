//! `tor-bwscan`: run bandwidth measurements of Tor relays, many at a time.
//!
//! # Overview
//!
//! The [`Scanner`] measures relays in *rounds*.  Each round, it asks a
//! [`PrioritySource`] which relays to measure, and starts one measurement
//! task per relay, with at most `measurement_threads` of them running at
//! once.  A measurement task:
//!
//!  1. picks a destination from the [`DestinationPool`](tor_bwprobe::DestinationPool),
//!  2. decides whether the relay is the entry or the exit of its circuit,
//!     and picks a helper relay (see [`tor_bwpath`]),
//!  3. builds the circuit with a [`CircuitBuilder`],
//!  4. probes latency and throughput over it (see [`tor_bwprobe`]),
//!
//! and turns whatever happened into a [`MeasurementResult`].  If the relay
//! can't be used as an exit, we retry once with the relay as the entry.
//!
//! Results go to a bounded queue ([`ResultSink`]) read by whoever writes
//! them out, such as a [`ResultDump`].  A [`ShutdownController`] stops
//! everything cooperatively.  Once it is triggered, no new round or task
//! starts, running probes stop early, and the round's stragglers get a
//! bounded time to finish.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod circ;
mod config;
mod dump;
mod err;
mod heartbeat;
mod measure;
mod prioritizer;
mod result;
mod scanner;
mod shutdown;
mod sink;
mod state;

pub use circ::{CircuitBuilder, CircuitError};
pub use config::{PrioritizerConfig, PrioritizerConfigBuilder, ScannerConfig, ScannerConfigBuilder};
pub use dump::ResultDump;
pub use err::Error;
pub use heartbeat::{Heartbeat, HeartbeatReport};
pub use prioritizer::{PrioritySource, RelayPrioritizer};
pub use result::{MeasurementError, MeasurementResult, Outcome};
pub use scanner::{Backends, RoundState, RoundSummary, Scanner};
pub use shutdown::ShutdownController;
pub use sink::{result_queue, ResultReceiver, ResultSink};
pub use state::{FsStateStore, ScannerState, StateStore};

/// A Result type as returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;
