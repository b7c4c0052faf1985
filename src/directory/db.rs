//! Connection-pooled wrapper around the Directory's Postgres database.
//!
//! Grounded in the teacher's `directory/db.rs` (`DB::connect`, one method per query),
//! generalized to pool connections with `r2d2` since the Directory serves many
//! concurrent HTTP requests instead of running as a single-threaded Rocket worker.

use super::models::*;
use super::schema;
use crate::error::{DirectoryError, DirectoryResult};
use crate::types::{ClusterId, MachineId, MachineStatus, PhotoId, VolumeId};
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use rand::RngCore;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct DB {
    pool: PgPool,
}

impl From<diesel::result::Error> for DirectoryError {
    fn from(e: diesel::result::Error) -> DirectoryError {
        DirectoryError::Database(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for DirectoryError {
    fn from(e: diesel::r2d2::PoolError) -> DirectoryError {
        DirectoryError::Database(e.to_string())
    }
}

impl DB {
    pub fn connect(database_url: &str) -> DirectoryResult<DB> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| DirectoryError::Database(e.to_string()))?;
        Ok(DB { pool })
    }

    fn conn(&self) -> DirectoryResult<PooledConnection<ConnectionManager<PgConnection>>> {
        Ok(self.pool.get()?)
    }

    /// Reads the cluster id from `params`, minting and persisting a random one the
    /// first time the Directory ever runs against a fresh database.
    pub fn get_or_create_cluster_id(&self) -> DirectoryResult<ClusterId> {
        use schema::params::dsl::*;
        let mut conn = self.conn()?;

        let existing = params
            .filter(key.eq(PARAM_CLUSTER_ID))
            .first::<Param>(&mut conn)
            .optional()?;

        if let Some(p) = existing {
            let bytes: [u8; 8] = p.value.try_into().map_err(|_| {
                DirectoryError::Database("stored cluster id param has the wrong length".into())
            })?;
            return Ok(u64::from_le_bytes(bytes));
        }

        let new_id = rand::thread_rng().next_u64();
        diesel::insert_into(schema::params::table)
            .values(&Param {
                key: PARAM_CLUSTER_ID,
                value: new_id.to_le_bytes().to_vec(),
            })
            .execute(&mut conn)?;
        Ok(new_id)
    }

    /// Registers a store/cache machine, or reactivates it if it already exists.
    pub fn register_store(&self, machine_id: MachineId, addr: &str) -> DirectoryResult<()> {
        let mut conn = self.conn()?;
        let new_row = NewStoreMachine {
            id: machine_id as i32,
            addr,
            free_bytes: 0,
            ops_window_60s: 0,
            status: status_str(MachineStatus::Healthy),
            write_enabled: true,
        };

        diesel::insert_into(schema::store_machines::table)
            .values(&new_row)
            .on_conflict(schema::store_machines::id)
            .do_update()
            .set((
                schema::store_machines::addr.eq(addr),
                schema::store_machines::write_enabled.eq(true),
                schema::store_machines::status.eq(status_str(MachineStatus::Healthy)),
                schema::store_machines::last_heartbeat.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn heartbeat_store(
        &self,
        machine_id: MachineId,
        reported_free_bytes: u64,
        reported_ops_window_60s: u64,
    ) -> DirectoryResult<()> {
        use schema::store_machines::dsl::*;
        let mut conn = self.conn()?;
        diesel::update(store_machines.filter(id.eq(machine_id as i32)))
            .set((
                free_bytes.eq(reported_free_bytes as i64),
                ops_window_60s.eq(reported_ops_window_60s as i64),
                last_heartbeat.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn set_store_status(&self, machine_id: MachineId, new_status: MachineStatus) -> DirectoryResult<()> {
        use schema::store_machines::dsl::*;
        let mut conn = self.conn()?;
        diesel::update(store_machines.filter(id.eq(machine_id as i32)))
            .set(status.eq(status_str(new_status)))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn list_stores(&self) -> DirectoryResult<Vec<StoreMachineRow>> {
        let mut conn = self.conn()?;
        Ok(schema::store_machines::table.load::<StoreMachineRow>(&mut conn)?)
    }

    pub fn get_store(&self, machine_id: MachineId) -> DirectoryResult<Option<StoreMachineRow>> {
        use schema::store_machines::dsl::*;
        let mut conn = self.conn()?;
        Ok(store_machines
            .filter(id.eq(machine_id as i32))
            .first::<StoreMachineRow>(&mut conn)
            .optional()?)
    }

    /// Draws the next photo id from the shared `photo_id_seq` sequence. Used only by
    /// the leader at `register` time; the id is then carried explicitly through
    /// `commit` and the sync log so followers never allocate ids of their own.
    pub fn allocate_photo_id(&self) -> DirectoryResult<PhotoId> {
        #[derive(QueryableByName)]
        struct NextVal {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            nextval: i64,
        }
        let mut conn = self.conn()?;
        let row: NextVal =
            diesel::sql_query("SELECT nextval('photo_id_seq') AS nextval").get_result(&mut conn)?;
        Ok(row.nextval as PhotoId)
    }

    /// Creates a photo row and its initial set of replica locations in one
    /// transaction, so a reader never observes a photo with zero locations.
    ///
    /// Idempotent via `ON CONFLICT DO NOTHING` on both tables: a repeated commit for a
    /// `photo_id` already committed (a client retry, or a follower replaying a sync op
    /// out from under its own `get_photo` guard) is a no-op rather than a primary-key
    /// violation, matching the "repeated commit is a no-op" round-trip law.
    pub fn commit_photo(
        &self,
        photo_id: PhotoId,
        cookie: &[u8],
        size: u64,
        checksum: &[u8],
        desired_replicas: usize,
        locations: &[(MachineId, VolumeId)],
    ) -> DirectoryResult<()> {
        let mut conn = self.conn()?;
        conn.transaction(|conn| -> Result<(), diesel::result::Error> {
            diesel::insert_into(schema::photos::table)
                .values(&NewPhoto {
                    id: photo_id as i64,
                    cookie,
                    size: size as i64,
                    checksum,
                    desired_replicas: desired_replicas as i32,
                })
                .on_conflict(schema::photos::id)
                .do_nothing()
                .execute(conn)?;

            for (machine_id, volume_id) in locations {
                diesel::insert_into(schema::photo_locations::table)
                    .values(&PhotoLocation {
                        photo_id: photo_id as i64,
                        machine_id: *machine_id as i32,
                        volume_id: *volume_id as i32,
                    })
                    .on_conflict((schema::photo_locations::photo_id, schema::photo_locations::machine_id))
                    .do_nothing()
                    .execute(conn)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn mark_deleted(&self, photo_id: PhotoId) -> DirectoryResult<()> {
        use schema::photos::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::update(photos.filter(id.eq(photo_id as i64)))
            .set((deleted.eq(true), updated_at.eq(Utc::now())))
            .execute(&mut conn)?;
        if n == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(())
    }

    /// Raises or lowers a photo's desired replica count, clamped by the caller to
    /// `[default_replica_count, max_replica_count]`. Driven by the Replication
    /// Manager's read-rate hotness check.
    pub fn set_desired_replicas(&self, photo_id: PhotoId, desired: usize) -> DirectoryResult<()> {
        use schema::photos::dsl::*;
        let mut conn = self.conn()?;
        diesel::update(photos.filter(id.eq(photo_id as i64)))
            .set((desired_replicas.eq(desired as i32), updated_at.eq(Utc::now())))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn get_photo(&self, photo_id: PhotoId) -> DirectoryResult<Option<PhotoRow>> {
        use schema::photos::dsl::*;
        let mut conn = self.conn()?;
        Ok(photos
            .filter(id.eq(photo_id as i64))
            .first::<PhotoRow>(&mut conn)
            .optional()?)
    }

    pub fn locations_for_photo(&self, photo_id: PhotoId) -> DirectoryResult<Vec<PhotoLocation>> {
        use schema::photo_locations::dsl::*;
        let mut conn = self.conn()?;
        Ok(photo_locations
            .filter(schema::photo_locations::photo_id.eq(photo_id as i64))
            .load::<PhotoLocation>(&mut conn)?)
    }

    pub fn add_location(&self, photo_id: PhotoId, machine_id: MachineId, volume_id: VolumeId) -> DirectoryResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(schema::photo_locations::table)
            .values(&PhotoLocation {
                photo_id: photo_id as i64,
                machine_id: machine_id as i32,
                volume_id: volume_id as i32,
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn remove_location(&self, photo_id: PhotoId, machine_id: MachineId) -> DirectoryResult<()> {
        use schema::photo_locations::dsl::*;
        let mut conn = self.conn()?;
        diesel::delete(
            photo_locations
                .filter(schema::photo_locations::photo_id.eq(photo_id as i64))
                .filter(schema::photo_locations::machine_id.eq(machine_id as i32)),
        )
        .execute(&mut conn)?;
        Ok(())
    }

    /// All live (non-deleted) photo ids currently placed on `machine_id`, used by that
    /// store's garbage collector to know what it is allowed to keep.
    pub fn live_photo_ids_for_store(&self, machine_id: MachineId) -> DirectoryResult<Vec<PhotoId>> {
        let mut conn = self.conn()?;
        let ids = schema::photo_locations::table
            .inner_join(
                schema::photos::table.on(schema::photos::id.eq(schema::photo_locations::photo_id)),
            )
            .filter(schema::photo_locations::machine_id.eq(machine_id as i32))
            .filter(schema::photos::deleted.eq(false))
            .select(schema::photos::id)
            .load::<i64>(&mut conn)?;
        Ok(ids.into_iter().map(|i| i as PhotoId).collect())
    }

    /// Appends a serialized op to the replication log, returning its sequence number.
    pub fn append_sync_op(&self, op_json: String) -> DirectoryResult<i64> {
        let mut conn = self.conn()?;
        let row = diesel::insert_into(schema::sync_log::table)
            .values(&NewSyncLogRow { op_json })
            .get_result::<SyncLogRow>(&mut conn)?;
        Ok(row.seq)
    }

    pub fn sync_ops_after(&self, after: i64, limit: i64) -> DirectoryResult<Vec<(i64, String)>> {
        use schema::sync_log::dsl::*;
        let mut conn = self.conn()?;
        let rows = sync_log
            .filter(seq.gt(after))
            .order(seq.asc())
            .limit(limit)
            .select((seq, op_json))
            .load::<(i64, String)>(&mut conn)?;
        Ok(rows)
    }

    /// This follower's own locally-applied sync cursor, persisted so a restart does
    /// not replay (or skip) ops it already has.
    pub fn get_sync_cursor(&self) -> DirectoryResult<i64> {
        use schema::params::dsl::*;
        let mut conn = self.conn()?;
        let row = params
            .filter(key.eq(PARAM_SYNC_CURSOR))
            .first::<Param>(&mut conn)
            .optional()?;
        match row {
            Some(p) => {
                let bytes: [u8; 8] = p
                    .value
                    .try_into()
                    .map_err(|_| DirectoryError::Database("sync cursor param has wrong length".into()))?;
                Ok(i64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn set_sync_cursor(&self, cursor: i64) -> DirectoryResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(schema::params::table)
            .values(&Param {
                key: PARAM_SYNC_CURSOR,
                value: cursor.to_le_bytes().to_vec(),
            })
            .on_conflict(schema::params::key)
            .do_update()
            .set(schema::params::value.eq(cursor.to_le_bytes().to_vec()))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn latest_sync_seq(&self) -> DirectoryResult<i64> {
        use schema::sync_log::dsl::*;
        let mut conn = self.conn()?;
        let max: Option<i64> = sync_log.select(diesel::dsl::max(seq)).first(&mut conn)?;
        Ok(max.unwrap_or(0))
    }

    /// One page of live photos, their declared `desired_replicas`, and their current
    /// replica count, for the Replication Manager's steady-state and nightly-audit
    /// scans. Ordered by id so repeated paging (using the last-seen id as `after`)
    /// covers every photo exactly once per full sweep.
    pub fn photo_replica_counts(
        &self,
        after: PhotoId,
        limit: i64,
    ) -> DirectoryResult<Vec<(PhotoId, i32, i64)>> {
        let mut conn = self.conn()?;
        let rows = schema::photos::table
            .left_join(
                schema::photo_locations::table
                    .on(schema::photo_locations::photo_id.eq(schema::photos::id)),
            )
            .filter(schema::photos::deleted.eq(false))
            .filter(schema::photos::id.gt(after as i64))
            .group_by((schema::photos::id, schema::photos::desired_replicas))
            .order(schema::photos::id.asc())
            .limit(limit)
            .select((
                schema::photos::id,
                schema::photos::desired_replicas,
                diesel::dsl::count(schema::photo_locations::machine_id),
            ))
            .load::<(i64, i32, i64)>(&mut conn)?;
        Ok(rows
            .into_iter()
            .map(|(id, desired, count)| (id as PhotoId, desired, count))
            .collect())
    }

    /// Every store currently holding a replica of `photo_id`, joined with that store's
    /// live descriptor — used by the Replication Manager to pick a de-replication
    /// victim or a copy source without a second round trip.
    pub fn locations_with_stores(&self, photo_id: PhotoId) -> DirectoryResult<Vec<(VolumeId, StoreMachineRow)>> {
        let mut conn = self.conn()?;
        let rows = schema::photo_locations::table
            .inner_join(
                schema::store_machines::table
                    .on(schema::store_machines::id.eq(schema::photo_locations::machine_id)),
            )
            .filter(schema::photo_locations::photo_id.eq(photo_id as i64))
            .select((schema::photo_locations::volume_id, StoreMachineRow::as_select()))
            .load::<(i32, StoreMachineRow)>(&mut conn)?;
        Ok(rows.into_iter().map(|(vid, store)| (vid as VolumeId, store)).collect())
    }
}
