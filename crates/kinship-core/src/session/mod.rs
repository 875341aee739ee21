//! Session Controller: the authenticated-user lifecycle.
//!
//! - `state`: reactive state and lifecycle phase
//! - `guard`: start-if-idle flags for re-entrant operations
//! - `completion`: fail-closed profile completion resolution
//! - `controller`: the controller itself

mod completion;
mod controller;
mod guard;
mod state;

pub use completion::resolve_completion;
pub use controller::{RefreshOutcome, SessionController};
pub use guard::{FlightGuard, InFlight};
pub use state::{AuthState, SessionPhase};
