#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! In-process batch pipeline for `adforge`: search fan-in, candidate
//! selection, background conditioning, composition, two-stage verification,
//! durable progress, and cooperative shutdown.

/// Public API for the pipeline crate.
pub mod api;

/// Background-conditioning contract and default conditioner.
pub mod background;
/// Durable image cache.
pub mod cache;
/// Compositor contract, templates, and default compositor.
pub mod compose;
/// Candidate download contract and default HTTP fetcher.
pub mod fetch;
/// Notification contract and webhook sink.
pub mod notify;
/// Durable per-row progress store.
pub mod progress;
/// Search-provider contract and default JSON-API provider.
pub mod providers;
/// Run counters.
pub mod stats;
/// Verification contract.
pub mod verify;

mod broker;
mod dedup;
mod engine;
mod health;
mod journal;
mod pace;
mod score;
mod select;
mod validate;
mod worker;

pub use api::{
    Collaborators, PipelineEvent, PipelineHandle, RowOutcome, StatusSnapshot, start_pipeline,
};
pub use stats::StatsSnapshot;
