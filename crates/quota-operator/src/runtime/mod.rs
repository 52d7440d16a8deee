//! A minimal controller runtime: per-controller deduplicating work queues
//! and worker pools driving user-supplied reconcile functions.
//!
//! Keys arrive from watch triggers (see [`crate::cluster::router`]) and
//! from requeue actions. Within one controller a key is never handed to
//! two workers at the same time; keys enqueued while their reconcile is in
//! flight are re-queued once it finishes, so the next pass always observes
//! the write of the previous one.

mod queue;
mod runner;

pub use queue::{DEFAULT_CAPACITY, WorkQueue};
pub use runner::{Action, run_controller};
