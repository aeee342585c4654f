//! Configured operator session — `shopfloor run`.
//!
//! Builds a `MachineSession` from `shopfloor.toml`: the configured machine
//! and operator, the on-disk cache and the shift table. The store is the
//! in-process one, seeded from the cache so a restart resumes where the last
//! run stopped; a networked store plugs in through `RemoteGateway`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use shopfloor::cache::{DurableCache, FileCache};
use shopfloor::clock::SystemClock;
use shopfloor::config::ShopfloorConfig;
use shopfloor::phase::PhaseEvent;
use shopfloor::remote::{MemoryGateway, RemoteMachineSnapshot};
use shopfloor::session::{MachineSession, SessionOptions};
use shopfloor::shift::ShiftCalendar;

use super::print_change;

pub async fn cmd_run(
    project_dir: &Path,
    assign: Option<&str>,
    for_secs: Option<u64>,
) -> Result<()> {
    let config = ShopfloorConfig::new(project_dir.to_path_buf())?;
    for warning in config.validate() {
        warn!(%warning, "configuration warning");
    }
    let opts = SessionOptions::from_config(&config);
    let machine_id = opts.machine_id.clone();
    info!(
        config = %config.config_file().display(),
        cache = %config.cache_dir().display(),
        %machine_id,
        operator_id = %opts.operator_id,
        "starting session"
    );

    let cache = FileCache::open(&config.cache_dir())?;
    let store = Arc::new(MemoryGateway::new());
    store.add_machine(&machine_id);
    if let Some(cached) = cache.load()?.assignment(&machine_id) {
        store.override_machine(RemoteMachineSnapshot {
            machine_id: machine_id.clone(),
            status: cached.phase,
            order_id: Some(cached.order_id.clone()),
            operator_id: Some(cached.operator_id.clone()),
            status_change_at: Some(cached.phase_started_at),
        });
    }

    let session = Arc::new(MachineSession::new(
        opts,
        Arc::new(SystemClock),
        Arc::new(cache),
        store,
        Arc::new(ShiftCalendar::local(config.toml.shifts.clone())),
    ));
    session.on_phase_changed(print_change("run"));
    session.restore().await?;
    if let Some(order_id) = assign {
        session
            .request_transition(PhaseEvent::AssignOrderAndBeginSetup {
                order_id: order_id.to_string(),
            })
            .await?;
    }

    let ticker = session.spawn_ticker();
    let feed = {
        let session = session.clone();
        tokio::spawn(async move { session.run_change_feed().await })
    };

    let mut elapsed = session.watch_elapsed();
    let stop = async {
        match for_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                }
            }
        }
    };
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            changed = elapsed.changed() => {
                if changed.is_err() {
                    break;
                }
                let secs = *elapsed.borrow_and_update();
                println!("{}", serde_json::json!({ "elapsed_seconds": secs }));
            }
        }
    }
    ticker.abort();
    feed.abort();

    println!(
        "{}",
        serde_json::json!({
            "machine_id": session.machine_id(),
            "phase": session.current_phase(),
            "order_id": session.current_assignment().map(|a| a.order_id),
            "accumulators": session.accumulators(),
            "sync": session.sync_status(),
        })
    );
    Ok(())
}
