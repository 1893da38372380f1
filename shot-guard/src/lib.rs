//! # shot-guard
//!
//! `shot-guard` is an in-process admission controller. Each guarded call is
//! wrapped in an entry/exit pair; on entry a pipeline of slots decides from
//! rolling statistics and configured rules whether the call may proceed, and
//! on exit the outcome is recorded for later decisions.
//!
//! ## Core Philosophy
//!
//! Decisions sit on the hot path of every request, so the statistics engine
//! never takes a lock to count. Buckets are atomics in a fixed circular array;
//! a mutex only guards the rare moment a slot is recycled for a newer slice.
//!
//! ## Key Concepts
//!
//! * **Statistics**: [`stat::LeapArray`] buckets, read through
//!   [`stat::SlidingWindow`] views and owned per resource by a
//!   [`stat::ResourceNode`].
//! * **Slot chain**: prepare, rule-check and stat slots run in order
//!   ([`slot::SlotChain`]). A failing slot lets the call through.
//! * **Flow control**: direct thresholds, throttling with a bounded queue and
//!   warm-up ([`flow`]).
//! * **Cluster flow control**: a shared quota through a
//!   [`cluster::TokenService`], fetched in batches.
//!
//! ## Example
//!
//! ```rust
//! use shot_guard::EntryOptions;
//! use shot_guard::FlowRule;
//! use shot_guard::Sentinel;
//!
//! let sentinel = Sentinel::new().unwrap();
//! sentinel
//!     .load_flow_rules(vec![FlowRule {
//!         resource: "orders".into(),
//!         threshold: 100.0,
//!         ..Default::default()
//!     }])
//!     .unwrap();
//!
//! match sentinel.entry("orders", EntryOptions::new()) {
//!     Ok(entry) => {
//!         // Request allowed
//!         entry.exit();
//!     }
//!     Err(blocked) => eprintln!("{blocked}"),
//! }
//! ```

mod api;
mod base;
mod clock;
pub mod cluster;
mod config;
mod error;
pub mod flow;
pub mod slot;
pub mod stat;

pub use api::Admission;
pub use api::Entry;
pub use api::EntryOptions;
pub use api::PendingEntry;
pub use api::Sentinel;
pub use api::SentinelBuilder;
pub use base::BlockError;
pub use base::BlockType;
pub use base::EntryContext;
pub use base::EntryInput;
pub use base::ResourceType;
pub use base::ResourceWrapper;
pub use base::TokenResult;
pub use base::TrafficType;
pub use clock::TimeSource;
pub use config::ClusterConfig;
pub use config::GuardConfig;
pub use config::StatConfig;
pub use error::GuardError;
pub use error::Result;
pub use flow::FlowRule;
