#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for the runq task engine: queue entries and their state
//! machine, the user-facing task projection, log lines and bus events.

pub mod event;
pub mod ids;
pub mod model;

mod util;

pub use event::*;
pub use ids::*;
pub use model::*;
pub use util::{lock_unpoisoned, now_ms, EpochMs};
