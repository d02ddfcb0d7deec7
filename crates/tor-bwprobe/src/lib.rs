//! `tor-bwprobe`: timed transfers over a measurement circuit.
//!
//! # Overview
//!
//! Once a two-hop circuit through a relay exists, we estimate the relay's
//! latency and throughput by fetching byte ranges of a large file from a
//! destination server over that circuit:
//!
//!  * [`measure_rtt`] fetches a few minimum-sized ranges and times each
//!    one.
//!  * [`measure_bandwidth`] fetches ranges whose size adapts to the
//!    observed speed, so that each request takes about
//!    `download_target` seconds.  Requests that were too quick or too
//!    slow to be meaningful are thrown away.
//!  * [`measure_upload`] asks the transfer backend for a single upload
//!    measurement, for networks where the scanner measures by uploading.
//!
//! The network itself is behind the [`Transfer`] and [`RangeStream`]
//! traits, and destinations are handed out by a [`DestinationPool`] such
//! as [`DestinationList`], which keeps track of destination failures.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod config;
mod dest;
mod err;
mod probe;
mod range;
mod transfer;

pub use config::{DownloadTimes, ProbeConfig, ProbeConfigBuilder};
pub use dest::{Destination, DestinationConfig, DestinationList, DestinationPool};
pub use err::Error;
pub use probe::{
    measure_bandwidth, measure_rtt, measure_upload, next_expected_amount, should_keep_result,
    StopCheck,
};
pub use range::{random_range, ByteRange};
pub use transfer::{CircId, DownloadSample, RangeStream, Transfer, TransferError};

/// A Result type as returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;
