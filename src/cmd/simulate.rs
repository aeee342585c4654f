//! Scripted two-session scenario — `shopfloor simulate`.
//!
//! Session A works order O1 through setup, production and a stop, then
//! finalizes; O2 is queued behind it. Session B watches the same machine
//! through the change feed and ends up on O2 in setup. Machine, timeouts and
//! shifts come from `shopfloor.toml`; the clock is simulated.

use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shopfloor::cache::MemoryCache;
use shopfloor::clock::ManualClock;
use shopfloor::config::ShopfloorConfig;
use shopfloor::phase::PhaseEvent;
use shopfloor::remote::{MemoryGateway, OrderStatus, QueuedOrder, RemoteGateway};
use shopfloor::session::{MachineSession, SessionOptions};
use shopfloor::shift::ShiftCalendar;

use super::print_change;

pub async fn cmd_simulate(project_dir: &Path, operator: &str) -> Result<()> {
    let config = ShopfloorConfig::new(project_dir.to_path_buf())?;
    let machine = config.toml.session.machine_id.clone();
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let cache = MemoryCache::new();
    let store = Arc::new(MemoryGateway::new());
    store.add_machine(&machine);
    for (position, order_id) in ["O1", "O2"].into_iter().enumerate() {
        store.enqueue_order(QueuedOrder {
            order_id: order_id.to_string(),
            machine_id: machine.clone(),
            status: OrderStatus::Pending,
            sequence_position: position as i64,
            created_at: start,
        });
    }

    let shifts = Arc::new(ShiftCalendar::local(config.toml.shifts.clone()));
    let session = |label: &'static str| {
        let mut opts = SessionOptions::from_config(&config);
        opts.operator_id = operator.to_string();
        let s = MachineSession::new(
            opts,
            clock.clone(),
            Arc::new(cache.clone()),
            store.clone(),
            shifts.clone(),
        );
        s.on_phase_changed(print_change(label));
        s
    };
    let a = session("A");
    let b = session("B");
    b.restore().await?;
    let mut feed = store.subscribe_change_feed(Some(machine.as_str())).await?;

    let script = [
        (0, PhaseEvent::AssignOrderAndBeginSetup {
            order_id: "O1".to_string(),
        }),
        (300, PhaseEvent::BeginProduction),
        (600, PhaseEvent::RequestStop {
            reason: Some("material jam".to_string()),
        }),
        (50, PhaseEvent::Resume),
        (120, PhaseEvent::Finalize {
            good_count: 118,
            scrap_count: 2,
        }),
    ];
    for (advance, event) in script {
        clock.advance_secs(advance);
        a.request_transition(event).await?;
    }

    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_millis(50), feed.next()).await
    {
        b.handle_notification(&notification).await?;
    }

    println!(
        "{}",
        serde_json::json!({
            "session": "B",
            "phase": b.current_phase(),
            "order_id": b.current_assignment().map(|a| a.order_id),
            "records": store.production_records().len(),
        })
    );
    Ok(())
}
