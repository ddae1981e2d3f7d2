//! Process profile data model.
//!
//! This library holds the interned profile representation produced by the
//! `perfconv` converter: a string table, function, mapping and location
//! tables, and a sample table whose stacks reference locations by id. Ids
//! are dense and 1-based; `0` always means "unset".
//!
//! # Example
//!
//! ```
//! use perfconv_profile::builder::ProfileBuilder;
//! use perfconv_profile::Sample;
//!
//! let mut builder = ProfileBuilder::new();
//! builder.add_sample_type("cycles_sample", "count");
//! builder.add_sample_type("cycles_event", "count");
//!
//! let mapping = builder.add_mapping(0x1000, 0x2000, 0, "/usr/bin/app", "");
//! let leaf = builder.add_location(0x1234, mapping);
//! builder.add_sample(Sample {
//!     location_ids: vec![leaf],
//!     values: vec![1, 100],
//!     labels: Vec::new(),
//! });
//!
//! builder.finalize().unwrap();
//! let profile = builder.into_profile();
//! assert_eq!(profile.samples.len(), 1);
//! ```

pub mod builder;
pub mod io;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use validate::{ValidationError, validate};

// ============================================================================
// Table entries
// ============================================================================

/// A named, unit-tagged column of the sample value vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    /// String table index of the type name, e.g. `cycles_sample`.
    pub r#type: i64,
    /// String table index of the unit, e.g. `count`.
    pub unit: i64,
}

/// A memory region of the profiled process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: u64,
    pub memory_start: u64,
    /// Exclusive.
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: i64,
    pub build_id: i64,
}

impl Mapping {
    /// Whether `address` falls inside `[memory_start, memory_limit)`.
    pub fn contains(&self, address: u64) -> bool {
        self.memory_start <= address && address < self.memory_limit
    }
}

/// A source line attributed to a location. Only present once a symbolizer
/// has filled in the function table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub function_id: u64,
    pub line: i64,
}

/// One resolved program counter value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: u64,
    /// `0` when the address does not belong to any known mapping.
    pub mapping_id: u64,
    pub address: u64,
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: u64,
    pub name: i64,
    pub system_name: i64,
    pub filename: i64,
    pub start_line: i64,
}

/// A key/value annotation on a sample. Exactly one of `str` and `num` may
/// be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: i64,
    pub str: i64,
    pub num: i64,
    pub num_unit: i64,
}

impl Label {
    /// A label with a string table value.
    pub fn string(key: i64, value: i64) -> Self {
        Self {
            key,
            str: value,
            ..Default::default()
        }
    }

    /// A label with a numeric value.
    pub fn number(key: i64, value: i64) -> Self {
        Self {
            key,
            num: value,
            ..Default::default()
        }
    }
}

/// An accumulated sample.
///
/// `values` has two slots per monitored event: the occurrence count at
/// `2 * event` and the accumulated period at `2 * event + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Leaf first.
    pub location_ids: Vec<u64>,
    pub values: Vec<i64>,
    pub labels: Vec<Label>,
}

// ============================================================================
// Profiles
// ============================================================================

/// The top-level interned profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub sample_types: Vec<ValueType>,
    pub samples: Vec<Sample>,
    pub mappings: Vec<Mapping>,
    pub locations: Vec<Location>,
    pub functions: Vec<Function>,
    /// Index 0 is always the empty string.
    pub string_table: Vec<String>,
    /// String table indices of free-text comments.
    pub comments: Vec<i64>,
}

impl Profile {
    /// Look up a string table entry, returning `None` for out of range
    /// indices.
    pub fn string(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.string_table.get(index))
            .map(String::as_str)
    }

    /// Find a location by id.
    pub fn location(&self, id: u64) -> Option<&Location> {
        self.locations.iter().find(|l| l.id == id)
    }

    /// Find a mapping by id.
    pub fn mapping(&self, id: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.id == id)
    }
}

/// One finalized profile plus the process it was collected for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessProfile {
    /// `0` when samples from all processes were merged.
    pub pid: u32,
    pub min_sample_time_ns: u64,
    pub max_sample_time_ns: u64,
    pub profile: Profile,
}
