//! Health scanning: promotes stores between Healthy, Suspect, and Down based on how
//! long it has been since their last heartbeat. Only the current leader runs this,
//! since only the leader's writes to `store_machines.status` matter.

use crate::directory::db::DB;
use crate::types::MachineStatus;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// One scan over every known store, transitioning status where the elapsed time since
/// the last heartbeat crosses the half-window (Suspect) or full-window (Down)
/// thresholds, and demoting back to Healthy once heartbeats resume.
pub fn run_once(db: &DB, health_window: Duration) -> crate::error::DirectoryResult<()> {
    let half_window = health_window / 2;
    let now = Utc::now();

    for store in db.list_stores()? {
        let age = now.signed_duration_since(store.last_heartbeat);
        let age = age.to_std().unwrap_or(Duration::ZERO);
        let current = store.parsed_status();

        let next = if age >= health_window {
            MachineStatus::Down
        } else if age >= half_window {
            MachineStatus::Suspect
        } else {
            MachineStatus::Healthy
        };

        if next != current {
            match next {
                MachineStatus::Down => warn!(machine_id = store.id, "store marked down"),
                MachineStatus::Suspect => warn!(machine_id = store.id, "store marked suspect"),
                MachineStatus::Healthy => info!(machine_id = store.id, "store recovered to healthy"),
            }
            db.set_store_status(store.id as u32, next)?;
        }
    }

    Ok(())
}
