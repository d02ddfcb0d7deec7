//! `tor-relaylist`: a live, flag-annotated view of the Tor relays that a
//! bandwidth scanner measures.
//!
//! # Overview
//!
//! A bandwidth scanner needs to know which relays exist, what the
//! directory authorities think of them (their flags, their consensus
//! weight, their exit policies), and which of them support congestion
//! control.  It also needs to remember, for each relay, when it was seen
//! in a consensus, when it was selected for measurement and when a
//! measurement was attempted.
//!
//! This crate provides that view.  A [`RelayList`] holds the current
//! [`RelaySet`], an immutable snapshot built from a [`Consensus`].  Readers
//! get the current snapshot without taking any lock; when the snapshot is
//! stale, the list fetches a new consensus from its [`ConsensusSource`] and
//! swaps it in atomically.  Only one refresh runs at a time.
//!
//! Each [`Relay`] carries a [`RelayHistory`], which survives refreshes for as
//! long as the relay stays listed.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::trait_duplication_in_bounds)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod config;
mod consensus;
mod err;
mod history;
mod params;
mod policy;
mod registry;
mod relay;
#[cfg(any(test, feature = "testing"))]
pub mod testnet;

pub use config::{RelayListConfig, RelayListConfigBuilder};
pub use consensus::{Consensus, RouterStatus, RouterStatusBuilder};
pub use err::{Error, ParamError};
pub use history::{HistoryLimits, RelayHistory, SavedHistory, SavedRelayHistory, TimestampSeq};
pub use params::{NetParameters, ProbeVariant};
pub use policy::{ExitPolicy, IpPattern, PolicyRule, PortRange, RuleKind};
pub use registry::{ConsensusSource, RelayList, RelaySet};
pub use relay::{Fingerprint, Relay, RelayFlags};

/// Alias for a `Result` with this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
