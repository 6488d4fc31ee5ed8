//! Plain data types shared by the runq scheduler, launcher and process supervisor.
//!
//! Nothing in this crate owns threads, processes or locks; it only describes
//! identities, lifecycle states and point-in-time snapshots.

mod domain;
pub use domain::*;
