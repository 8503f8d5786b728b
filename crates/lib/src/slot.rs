//! The A/B slot model.
//!
//! The slot-to-partition mapping is a provisioning-time contract
//! established by the installer. It is a fixed lookup table; nothing here
//! computes partition indices.

use serde::Serialize;
use thiserror::Error;

/// Number of partitions in the fixed disk layout.
pub(crate) const EXPECTED_PARTITIONS: usize = 6;
/// 1-based index of the EFI system partition.
pub(crate) const ESP_PARTNO: u32 = 1;
/// 1-based index of the shared data partition.
pub(crate) const DATA_PARTNO: u32 = 6;

/// The currently mounted root partition does not correspond to either
/// slot. We refuse to guess a target in that case.
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "partition index {partno} does not name a root slot (expected {} for A or {} for B)",
    Slot::A.root_partno(),
    Slot::B.root_partno()
)]
pub struct UnknownSlotError {
    pub partno: u32,
}

/// One of the two interchangeable root filesystem partition sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub(crate) const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// 1-based index of this slot's root partition.
    pub const fn root_partno(&self) -> u32 {
        match self {
            Slot::A => 2,
            Slot::B => 4,
        }
    }

    /// 1-based index of this slot's verity companion partition.
    pub const fn verity_partno(&self) -> u32 {
        match self {
            Slot::A => 3,
            Slot::B => 5,
        }
    }

    /// The other slot; an update always targets the complement of the
    /// booted slot.
    pub const fn complement(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Map a mounted root partition index back to its slot.
    pub fn from_root_partno(partno: u32) -> Result<Slot, UnknownSlotError> {
        Slot::ALL
            .into_iter()
            .find(|s| s.root_partno() == partno)
            .ok_or(UnknownSlotError { partno })
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Slot::A => "A",
            Slot::B => "B",
        };
        f.write_str(s)
    }
}
