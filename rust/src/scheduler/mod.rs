//! Cell-level MAC scheduler.
//!
//! [`MacScheduler`] wires the slot selector, HARQ entities, allocation engine
//! and strategy together and exposes the inbound callbacks of the MAC.

mod core;
mod state;

pub use core::{ConnectionParams, MacScheduler, SchedulerError};
pub use state::{SchedulerStats, UeState};
