//! Per-client delivery sessions.

mod delivery;
mod state;

pub use delivery::{DeliverySession, SessionOutcome, SessionReport, SessionPhase, SessionSettings};
pub use state::{Liveness, RetransmitTimer};
