//! `tor-bwpath`: choose two-hop paths for measuring Tor relays.
//!
//! # Overview
//!
//! A bandwidth scanner measures one relay (the *target*) at a time, by
//! building a two-hop circuit through it and a *helper* relay, and
//! downloading data over that circuit.  The helper should be faster than
//! the target, so that the measurement reflects the target's capacity
//! rather than the helper's.
//!
//! Choosing a path happens in three steps:
//!
//!  1. Decide the target's [`Role`]: it is the exit if it is an exit that
//!     can reach the destination and that matches the network's
//!     congestion-control requirements ([`ExitRequirement`]); otherwise
//!     it is the entry.
//!  2. Find the [`helper_candidates`]: non-exits if the target exits,
//!     suitable exits otherwise.
//!  3. [`pick_helper`]: a random candidate at least twice as fast as the
//!     target if there is one, then 1.75 times, and so on down to equally
//!     fast; failing all of that, the fastest candidate.
//!
//! Everything in this crate is a pure function of a
//! [`RelaySet`](tor_relaylist::RelaySet) and a random number generator.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::large_stack_arrays)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod err;
mod helper;
mod path;
mod role;

pub use err::Error;
pub use helper::{helper_candidates, pick_helper, BANDWIDTH_MULTIPLIERS};
pub use path::{plan_path, MeasurementPath};
pub use role::{choose_role, ExitRequirement, Role};

/// A Result type as returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;
