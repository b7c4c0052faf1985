//! Placement policy: which stores a new photo's replicas should land on, and which
//! replica to drop first when a photo is over-replicated.

use crate::directory::models::StoreMachineRow;
use crate::types::MachineId;

/// Chooses up to `count` distinct healthy, writable stores with enough free space for
/// `size` bytes plus `margin`, preferring the least busy ones so writes spread evenly.
/// Ties are broken by more free space, then by the lowest machine id for determinism.
pub fn select_stores(
    candidates: &[StoreMachineRow],
    count: usize,
    size: u64,
    margin: u64,
) -> Vec<MachineId> {
    let mut eligible: Vec<&StoreMachineRow> = candidates
        .iter()
        .filter(|s| s.parsed_status().is_healthy())
        .filter(|s| s.write_enabled)
        .filter(|s| s.free_bytes as u64 >= size + margin)
        .collect();

    eligible.sort_by(|a, b| {
        a.ops_window_60s
            .cmp(&b.ops_window_60s)
            .then(b.free_bytes.cmp(&a.free_bytes))
            .then(a.id.cmp(&b.id))
    });

    eligible
        .into_iter()
        .take(count)
        .map(|s| s.id as MachineId)
        .collect()
}

/// Chooses which of a photo's current locations to drop first when de-replicating:
/// the busiest store, tie-broken by the one with the least free space (so we relieve
/// the most pressured machine).
pub fn select_deprec_victim(locations: &[StoreMachineRow]) -> Option<MachineId> {
    locations
        .iter()
        .max_by(|a, b| {
            a.ops_window_60s
                .cmp(&b.ops_window_60s)
                .then(b.free_bytes.cmp(&a.free_bytes))
        })
        .map(|s| s.id as MachineId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::models::status_str;
    use crate::types::MachineStatus;
    use chrono::Utc;

    fn store(id: i32, ops: i64, free: i64, status: MachineStatus) -> StoreMachineRow {
        StoreMachineRow {
            id,
            addr: format!("127.0.0.1:{}", 9000 + id),
            last_heartbeat: Utc::now(),
            free_bytes: free,
            ops_window_60s: ops,
            status: status_str(status).to_string(),
            write_enabled: true,
        }
    }

    #[test]
    fn prefers_least_busy_healthy_stores() {
        let stores = vec![
            store(1, 100, 1_000_000, MachineStatus::Healthy),
            store(2, 10, 1_000_000, MachineStatus::Healthy),
            store(3, 5, 1_000_000, MachineStatus::Down),
        ];

        let chosen = select_stores(&stores, 1, 100, 0);
        assert_eq!(chosen, vec![2]);
    }

    #[test]
    fn excludes_stores_without_enough_free_space() {
        let stores = vec![store(1, 0, 500, MachineStatus::Healthy)];
        let chosen = select_stores(&stores, 1, 1000, 0);
        assert!(chosen.is_empty());
    }

    #[test]
    fn deprec_victim_is_busiest_store() {
        let locations = vec![
            store(1, 5, 100, MachineStatus::Healthy),
            store(2, 50, 100, MachineStatus::Healthy),
        ];
        assert_eq!(select_deprec_victim(&locations), Some(2));
    }
}
