//! Conversion configuration bitmasks.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Which per-sample attributes become labels.
///
/// Every enabled label is also part of the sample identity, so enabling a
/// label splits samples that would otherwise be merged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleLabels(u32);

impl SampleLabels {
    pub const NONE: Self = Self(0);
    pub const PID: Self = Self(1 << 0);
    pub const TID: Self = Self(1 << 1);
    pub const PID_AND_TID: Self = Self(Self::PID.0 | Self::TID.0);
    pub const TIMESTAMP_NS: Self = Self(1 << 2);
    pub const EXECUTION_MODE: Self = Self(1 << 3);
    pub const COMM: Self = Self(1 << 4);
    pub const CPU: Self = Self(1 << 5);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SampleLabels {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleLabels {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SampleLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SampleLabels, &str); 6] = [
            (SampleLabels::PID, "PID"),
            (SampleLabels::TID, "TID"),
            (SampleLabels::TIMESTAMP_NS, "TIMESTAMP_NS"),
            (SampleLabels::EXECUTION_MODE, "EXECUTION_MODE"),
            (SampleLabels::COMM, "COMM"),
            (SampleLabels::CPU, "CPU"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "SampleLabels(NONE)")
        } else {
            write!(f, "SampleLabels({})", set.join(" | "))
        }
    }
}

/// Behavior switches for the conversion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConversionOptions(u32);

impl ConversionOptions {
    pub const NO_OPTIONS: Self = Self(0);
    /// Emit one profile per process instead of a single merged profile.
    pub const GROUP_BY_PID: Self = Self(1 << 0);
    /// Abort when merged processes disagree on their main binary.
    pub const FAIL_ON_MAIN_MAPPING_MISMATCH: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConversionOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConversionOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ConversionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionOptions")
            .field("group_by_pid", &self.contains(Self::GROUP_BY_PID))
            .field(
                "fail_on_main_mapping_mismatch",
                &self.contains(Self::FAIL_ON_MAIN_MAPPING_MISMATCH),
            )
            .finish()
    }
}

// Label keys as they appear in the string table.
pub const PID_LABEL: &str = "pid";
pub const TID_LABEL: &str = "tid";
pub const TIMESTAMP_NS_LABEL: &str = "timestamp_ns";
pub const EXECUTION_MODE_LABEL: &str = "execution_mode";
pub const COMM_LABEL: &str = "comm";
pub const CPU_LABEL: &str = "cpu";
