//! Row types for the Directory's metadata tables.

use super::schema::*;
use crate::types::MachineStatus;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

pub const PARAM_CLUSTER_ID: i32 = 1;
pub const PARAM_SYNC_CURSOR: i32 = 2;

#[derive(Queryable, Insertable)]
#[diesel(table_name = params)]
pub struct Param {
    pub key: i32,
    pub value: Vec<u8>,
}

#[derive(Queryable, Selectable, Identifiable, AsChangeset)]
#[diesel(table_name = store_machines)]
pub struct StoreMachineRow {
    pub id: i32,
    pub addr: String,
    pub last_heartbeat: DateTime<Utc>,
    pub free_bytes: i64,
    pub ops_window_60s: i64,
    pub status: String,
    pub write_enabled: bool,
}

impl StoreMachineRow {
    pub fn parsed_status(&self) -> MachineStatus {
        match self.status.as_str() {
            "healthy" => MachineStatus::Healthy,
            "suspect" => MachineStatus::Suspect,
            _ => MachineStatus::Down,
        }
    }
}

pub fn status_str(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Healthy => "healthy",
        MachineStatus::Suspect => "suspect",
        MachineStatus::Down => "down",
    }
}

#[derive(Insertable)]
#[diesel(table_name = store_machines)]
pub struct NewStoreMachine<'a> {
    pub id: i32,
    pub addr: &'a str,
    pub free_bytes: i64,
    pub ops_window_60s: i64,
    pub status: &'a str,
    pub write_enabled: bool,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = photos)]
pub struct PhotoRow {
    pub id: i64,
    pub cookie: Vec<u8>,
    pub size: i64,
    pub checksum: Vec<u8>,
    pub desired_replicas: i32,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = photos)]
pub struct NewPhoto<'a> {
    pub id: i64,
    pub cookie: &'a [u8],
    pub size: i64,
    pub checksum: &'a [u8],
    pub desired_replicas: i32,
}

#[derive(Queryable, Insertable, Identifiable)]
#[diesel(table_name = photo_locations, primary_key(photo_id, machine_id))]
pub struct PhotoLocation {
    pub photo_id: i64,
    pub machine_id: i32,
    pub volume_id: i32,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = sync_log, primary_key(seq))]
pub struct SyncLogRow {
    pub seq: i64,
    pub op_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = sync_log)]
pub struct NewSyncLogRow {
    pub op_json: String,
}
