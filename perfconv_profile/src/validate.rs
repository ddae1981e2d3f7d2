//! Referential integrity checks for a finished [`Profile`].

use crate::Profile;
use std::collections::HashSet;
use thiserror::Error;

/// Ways a profile can fail validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("profile declares no sample types")]
    NoSampleTypes,

    #[error("string table must start with the empty string")]
    MissingEmptyString,

    #[error("{kind} uses reserved id 0")]
    ZeroId { kind: &'static str },

    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: u64 },

    #[error("string index {index} in {context} is outside the string table ({len} entries)")]
    StringOutOfRange {
        context: &'static str,
        index: i64,
        len: usize,
    },

    #[error("location {location_id} references non-existent mapping {mapping_id}")]
    InvalidMappingReference { location_id: u64, mapping_id: u64 },

    #[error("location {location_id} references non-existent function {function_id}")]
    InvalidFunctionReference { location_id: u64, function_id: u64 },

    #[error("sample {sample_index} references location id 0")]
    ZeroLocationReference { sample_index: usize },

    #[error("sample {sample_index} references non-existent location {location_id}")]
    InvalidLocationReference {
        sample_index: usize,
        location_id: u64,
    },

    #[error("sample {sample_index} has {actual} values, expected {expected}")]
    ValueCountMismatch {
        sample_index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("sample {sample_index} has a label with both a string and a numeric value")]
    AmbiguousLabel { sample_index: usize },
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Check that every id referenced from the profile resolves to a table
/// entry and that the sample table agrees with the declared sample types.
pub fn validate(profile: &Profile) -> Result<()> {
    if profile.sample_types.is_empty() {
        return Err(ValidationError::NoSampleTypes);
    }
    if profile.string_table.first().map(String::as_str) != Some("") {
        return Err(ValidationError::MissingEmptyString);
    }

    let strings = StringChecker {
        len: profile.string_table.len(),
    };
    for value_type in &profile.sample_types {
        strings.check("sample type", value_type.r#type)?;
        strings.check("sample type", value_type.unit)?;
    }
    for &comment in &profile.comments {
        strings.check("comment", comment)?;
    }

    let mapping_ids = unique_ids("mapping", profile.mappings.iter().map(|m| m.id))?;
    for mapping in &profile.mappings {
        strings.check("mapping", mapping.filename)?;
        strings.check("mapping", mapping.build_id)?;
    }

    let function_ids = unique_ids("function", profile.functions.iter().map(|f| f.id))?;
    for function in &profile.functions {
        strings.check("function", function.name)?;
        strings.check("function", function.system_name)?;
        strings.check("function", function.filename)?;
    }

    let location_ids = unique_ids("location", profile.locations.iter().map(|l| l.id))?;
    for location in &profile.locations {
        if location.mapping_id != 0 && !mapping_ids.contains(&location.mapping_id) {
            return Err(ValidationError::InvalidMappingReference {
                location_id: location.id,
                mapping_id: location.mapping_id,
            });
        }
        for line in &location.lines {
            if !function_ids.contains(&line.function_id) {
                return Err(ValidationError::InvalidFunctionReference {
                    location_id: location.id,
                    function_id: line.function_id,
                });
            }
        }
    }

    let expected = profile.sample_types.len();
    for (sample_index, sample) in profile.samples.iter().enumerate() {
        if sample.values.len() != expected {
            return Err(ValidationError::ValueCountMismatch {
                sample_index,
                expected,
                actual: sample.values.len(),
            });
        }
        for &location_id in &sample.location_ids {
            if location_id == 0 {
                return Err(ValidationError::ZeroLocationReference { sample_index });
            }
            if !location_ids.contains(&location_id) {
                return Err(ValidationError::InvalidLocationReference {
                    sample_index,
                    location_id,
                });
            }
        }
        for label in &sample.labels {
            if label.str != 0 && label.num != 0 {
                return Err(ValidationError::AmbiguousLabel { sample_index });
            }
            strings.check("label", label.key)?;
            strings.check("label", label.str)?;
            strings.check("label", label.num_unit)?;
        }
    }

    Ok(())
}

struct StringChecker {
    len: usize,
}

impl StringChecker {
    fn check(&self, context: &'static str, index: i64) -> Result<()> {
        match usize::try_from(index) {
            Ok(i) if i < self.len => Ok(()),
            _ => Err(ValidationError::StringOutOfRange {
                context,
                index,
                len: self.len,
            }),
        }
    }
}

fn unique_ids(kind: &'static str, ids: impl Iterator<Item = u64>) -> Result<HashSet<u64>> {
    let mut seen = HashSet::new();
    for id in ids {
        if id == 0 {
            return Err(ValidationError::ZeroId { kind });
        }
        if !seen.insert(id) {
            return Err(ValidationError::DuplicateId { kind, id });
        }
    }
    Ok(seen)
}
