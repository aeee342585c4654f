pub mod accounting;
pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod phase;
pub mod reconcile;
pub mod remote;
pub mod sequencing;
pub mod session;
pub mod shift;
pub mod telemetry;

pub use errors::{MergeRejected, PhaseError, RemoteError};
pub use phase::{ActiveAssignment, Phase, PhaseEvent};
pub use session::{MachineSession, SessionOptions};
