//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `status`   | `Status`         |
//! | `run`      | `Run`            |
//! | `simulate` | `Simulate`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod run;
pub mod simulate;
pub mod status;

pub use config::cmd_config;
pub use run::cmd_run;
pub use simulate::cmd_simulate;
pub use status::cmd_status;

use shopfloor::session::PhaseChange;

/// Listener printing each phase change as one JSON line.
fn print_change(label: &'static str) -> impl Fn(&PhaseChange) + Send + Sync + 'static {
    move |change| {
        let line = serde_json::json!({
            "session": label,
            "machine_id": change.machine_id,
            "phase": change.phase,
            "order_id": change.assignment.as_ref().map(|a| a.order_id.clone()),
            "setup_seconds": change.accumulators.setup_seconds,
            "production_seconds": change.accumulators.production_seconds,
            "stopped_seconds": change.accumulators.stopped_seconds,
            "cause": change.cause,
        });
        println!("{}", line);
    }
}
