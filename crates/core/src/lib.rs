//! `agentjobs-core`: foundation building blocks for the job engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the optimistic record version, and an injectable clock.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use version::Version;
