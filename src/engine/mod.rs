//! Worker engine: poll, claim, validate, execute, report, back off.

pub mod backoff;
pub mod clock;
pub mod state;
pub mod worker;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use state::WorkerState;
pub use worker::{Cycle, Outcome, Worker};
