//! Deduplicating construction of a [`Profile`].
//!
//! Strings and functions are interned: inserting the same value twice
//! yields the same id. Mappings, locations and samples are appended and get
//! dense 1-based ids in insertion order. Callers that need deduplication of
//! those entities keep their own caches keyed on whatever identity makes
//! sense for them.

use crate::validate::{ValidationError, validate};
use crate::{Function, Location, Mapping, Profile, Sample, ValueType};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FunctionKey {
    name: i64,
    system_name: i64,
    filename: i64,
    start_line: i64,
}

/// Builder for one interned profile.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    profile: Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<FunctionKey, u64>,
}

impl ProfileBuilder {
    /// Create a builder whose string table holds only the empty string.
    pub fn new() -> Self {
        let mut strings = HashMap::new();
        strings.insert(String::new(), 0);
        Self {
            profile: Profile {
                string_table: vec![String::new()],
                ..Default::default()
            },
            strings,
            functions: HashMap::new(),
        }
    }

    /// Intern a string. The empty string is always index 0 and never grows
    /// the table.
    pub fn string_id(&mut self, s: &str) -> i64 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&id) = self.strings.get(s) {
            return id;
        }
        let id = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), id);
        id
    }

    /// Intern an optional string; `None` maps to index 0.
    pub fn optional_string_id(&mut self, s: Option<&str>) -> i64 {
        s.map_or(0, |s| self.string_id(s))
    }

    /// Intern a function. Identical tuples return the same id.
    pub fn function_id(
        &mut self,
        name: &str,
        system_name: &str,
        filename: &str,
        start_line: i64,
    ) -> u64 {
        let key = FunctionKey {
            name: self.string_id(name),
            system_name: self.string_id(system_name),
            filename: self.string_id(filename),
            start_line,
        };
        if let Some(&id) = self.functions.get(&key) {
            return id;
        }
        let id = self.profile.functions.len() as u64 + 1;
        self.profile.functions.push(Function {
            id,
            name: key.name,
            system_name: key.system_name,
            filename: key.filename,
            start_line,
        });
        self.functions.insert(key, id);
        id
    }

    /// Append a mapping and return its id.
    pub fn add_mapping(
        &mut self,
        memory_start: u64,
        memory_limit: u64,
        file_offset: u64,
        filename: &str,
        build_id: &str,
    ) -> u64 {
        let id = self.profile.mappings.len() as u64 + 1;
        let filename = self.string_id(filename);
        let build_id = self.string_id(build_id);
        self.profile.mappings.push(Mapping {
            id,
            memory_start,
            memory_limit,
            file_offset,
            filename,
            build_id,
        });
        id
    }

    /// Append a location and return its id. `mapping_id` may be 0.
    pub fn add_location(&mut self, address: u64, mapping_id: u64) -> u64 {
        let id = self.profile.locations.len() as u64 + 1;
        self.profile.locations.push(Location {
            id,
            mapping_id,
            address,
            lines: Vec::new(),
        });
        id
    }

    /// Declare the next column of the sample value vector.
    pub fn add_sample_type(&mut self, r#type: &str, unit: &str) {
        let r#type = self.string_id(r#type);
        let unit = self.string_id(unit);
        self.profile.sample_types.push(ValueType { r#type, unit });
    }

    pub fn add_comment(&mut self, comment: &str) {
        let id = self.string_id(comment);
        self.profile.comments.push(id);
    }

    /// Append a sample and return its index in the sample table.
    pub fn add_sample(&mut self, sample: Sample) -> usize {
        self.profile.samples.push(sample);
        self.profile.samples.len() - 1
    }

    /// Mutable access to a previously added sample.
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by [`ProfileBuilder::add_sample`].
    pub fn sample_mut(&mut self, index: usize) -> &mut Sample {
        &mut self.profile.samples[index]
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Direct access to the profile under construction.
    ///
    /// Strings pushed here bypass the interning map; use
    /// [`ProfileBuilder::string_id`] for anything that should be shared.
    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    /// Prepare the profile for serialization and validate it.
    ///
    /// When no locations were added, sample stacks are taken to hold raw
    /// addresses: one location is synthesized per distinct address and the
    /// stacks are rewritten to reference it. Locations without a mapping are
    /// then attached to the mapping containing their address, if any.
    pub fn finalize(&mut self) -> Result<(), ValidationError> {
        if self.profile.locations.is_empty() {
            self.synthesize_locations();
            log::debug!(
                "synthesized {} locations from raw sample addresses",
                self.profile.locations.len()
            );
        }
        let attached = self.attach_mappings();
        if attached > 0 {
            log::debug!("attached {attached} unmapped locations by address");
        }
        validate(&self.profile)
    }

    /// Finalize and return the profile.
    pub fn build(mut self) -> Result<Profile, ValidationError> {
        self.finalize()?;
        Ok(self.profile)
    }

    pub fn into_profile(self) -> Profile {
        self.profile
    }

    fn synthesize_locations(&mut self) {
        let Profile {
            samples, locations, ..
        } = &mut self.profile;
        let mut address_to_id: HashMap<u64, u64> = HashMap::new();

        for sample in samples.iter_mut() {
            for slot in sample.location_ids.iter_mut() {
                let address = *slot;
                let next_id = locations.len() as u64 + 1;
                *slot = *address_to_id.entry(address).or_insert_with(|| {
                    locations.push(Location {
                        id: next_id,
                        mapping_id: 0,
                        address,
                        lines: Vec::new(),
                    });
                    next_id
                });
            }
        }
    }

    fn attach_mappings(&mut self) -> usize {
        let Profile {
            mappings,
            locations,
            ..
        } = &mut self.profile;
        if mappings.is_empty() {
            return 0;
        }
        let mut attached = 0;

        let mut by_start: Vec<&Mapping> = mappings.iter().collect();
        by_start.sort_by_key(|m| m.memory_start);

        for location in locations.iter_mut() {
            if location.mapping_id != 0 || location.address == 0 {
                continue;
            }
            let after = by_start.partition_point(|m| m.memory_start <= location.address);
            if after == 0 {
                // Below every known mapping.
                continue;
            }
            let candidate = by_start[after - 1];
            if candidate.contains(location.address) {
                location.mapping_id = candidate.id;
                attached += 1;
            }
        }
        attached
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
