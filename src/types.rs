//! Shared identifiers and on-disk constants used across every component.

use serde::{Deserialize, Serialize};

/// Used in on-disk superblocks so old volumes can be rejected after a format change.
pub type FormatVersion = u32;

pub const CURRENT_FORMAT_VERSION: FormatVersion = 1;

/// Uniquely identifies this complete set of machines.
pub type ClusterId = u64;

/// Identifies a single Store or Cache machine in the cluster.
pub type MachineId = u32;

pub type VolumeId = u32;

/// The globally unique, monotonically assigned identifier for a blob.
pub type PhotoId = u64;

/// All needles are written at an offset aligned to this size so that block offsets
/// (rather than byte offsets) fit in a `u32` and the tail of a volume can be scanned
/// without reading arbitrary byte boundaries.
pub const BLOCK_SIZE: usize = 64;

pub type BlockOffset = u32;

/// Random per-photo secret embedded in every needle, making needle URLs unguessable.
pub type Cookie = [u8; 16];

/// Status of a Store or Cache machine as tracked by the Directory's health scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    Healthy,
    Suspect,
    Down,
}

impl MachineStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, MachineStatus::Healthy)
    }
}
