//! Accumulation of normalized samples into interned profiles.
//!
//! [`SampleAggregator`] keeps one [`ProfileBuilder`] per grouping key (the
//! pid when grouping by process, otherwise a single key `0`). Each sample's
//! stack is turned into location ids, and samples with identical stacks and
//! label values are merged by adding their counts and weights.

use crate::address_space::{MappingArena, MappingHandle};
use crate::convert::{ConvertError, Result};
use crate::event::{ExecutionMode, KERNEL_PID, PERF_CONTEXT_USER, TraceMetadata};
use crate::normalizer::{CommContext, MmapContext, SampleContext, SampleHandler};
use crate::options::{
    COMM_LABEL, CPU_LABEL, ConversionOptions, EXECUTION_MODE_LABEL, PID_LABEL, SampleLabels,
    TID_LABEL, TIMESTAMP_NS_LABEL,
};
use perfconv_profile::builder::ProfileBuilder;
use perfconv_profile::{Label, ProcessProfile, Sample};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Identity of an accumulated sample. Fields whose label is disabled are
/// left at their defaults so they do not split samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SampleKey {
    pid: u32,
    tid: u32,
    time_ns: u64,
    execution_mode: ExecutionMode,
    comm: i64,
    cpu: Option<u32>,
    location_ids: Vec<u64>,
}

/// Locations already created for one process.
#[derive(Debug, Default)]
struct ProcessCache {
    /// address -> location id
    locations: BTreeMap<u64, u64>,
}

impl ProcessCache {
    /// Forget every location in `[start, limit)`.
    fn invalidate(&mut self, start: u64, limit: u64) {
        let stale: Vec<u64> = self.locations.range(start..limit).map(|(&a, _)| a).collect();
        for address in stale {
            self.locations.remove(&address);
        }
    }
}

struct ProfileState {
    builder: ProfileBuilder,
    /// mapping handle -> profile mapping id
    mapping_ids: HashMap<MappingHandle, u64>,
    /// sample key -> index in the sample table
    samples: HashMap<SampleKey, usize>,
    /// Main binary of the first sampled process, for merged profiles.
    main_filename: Option<String>,
    mismatch_warned: HashSet<u32>,
    time_range: Option<(u64, u64)>,
}

impl ProfileState {
    fn new(metadata: &TraceMetadata) -> Self {
        let mut builder = ProfileBuilder::new();
        for attr in &metadata.attrs {
            builder.add_sample_type(&format!("{}_sample", attr.name), "count");
            builder.add_sample_type(&format!("{}_event", attr.name), "count");
        }
        if let Some(version) = &metadata.tool_version {
            builder.add_comment(&format!("perf-version:{version}"));
        }
        if let Some(command) = &metadata.command_line {
            builder.add_comment(&format!("perf-command:{command}"));
        }
        Self {
            builder,
            mapping_ids: HashMap::new(),
            samples: HashMap::new(),
            main_filename: None,
            mismatch_warned: HashSet::new(),
            time_range: None,
        }
    }

    fn mapping_id(&mut self, handle: MappingHandle, mappings: &MappingArena) -> u64 {
        if let Some(&id) = self.mapping_ids.get(&handle) {
            return id;
        }
        let mapping = &mappings[handle];
        let id = self.builder.add_mapping(
            mapping.start,
            mapping.limit,
            mapping.file_offset,
            &mapping.display_name(),
            mapping.build_id.as_deref().unwrap_or(""),
        );
        self.mapping_ids.insert(handle, id);
        id
    }

    /// # Panics
    ///
    /// Panics if `address` lies outside `mapping`.
    fn location_id(
        &mut self,
        cache: &mut ProcessCache,
        address: u64,
        mapping: Option<MappingHandle>,
        mappings: &MappingArena,
    ) -> u64 {
        if let Some(&id) = cache.locations.get(&address) {
            return id;
        }
        let mapping_id = match mapping {
            Some(handle) => {
                let bounds = &mappings[handle];
                assert!(
                    bounds.contains(address),
                    "location {address:#x} outside mapping [{:#x}, {:#x})",
                    bounds.start,
                    bounds.limit
                );
                self.mapping_id(handle, mappings)
            }
            None => 0,
        };
        let id = self.builder.add_location(address, mapping_id);
        cache.locations.insert(address, id);
        id
    }

    fn check_main_mapping(&mut self, pid: u32, filename: &str, strict: bool) {
        if filename.is_empty() {
            return;
        }
        let expected = match &self.main_filename {
            Some(expected) if !expected.is_empty() => expected,
            _ => {
                self.main_filename = Some(filename.to_string());
                return;
            }
        };
        if expected == filename {
            return;
        }
        if strict {
            panic!(
                "main mapping mismatch: pid {pid} runs {filename} but the profile is for {expected}"
            );
        }
        if self.mismatch_warned.insert(pid) {
            log::warn!("pid {pid} runs {filename}, merging into profile for {expected}");
        }
    }

    fn record_time(&mut self, time: u64) {
        if time == 0 {
            return;
        }
        self.time_range = Some(match self.time_range {
            Some((min, max)) => (min.min(time), max.max(time)),
            None => (time, time),
        });
    }
}

/// Builds profiles from normalized samples.
///
/// # Panics
///
/// With [`ConversionOptions::FAIL_ON_MAIN_MAPPING_MISMATCH`] and without
/// [`ConversionOptions::GROUP_BY_PID`], panics when two processes merged
/// into the same profile have different main binaries.
pub struct SampleAggregator<'a> {
    metadata: &'a TraceMetadata,
    labels: SampleLabels,
    options: ConversionOptions,
    profiles: BTreeMap<u32, ProfileState>,
    processes: HashMap<u32, ProcessCache>,
}

impl<'a> SampleAggregator<'a> {
    pub fn new(
        metadata: &'a TraceMetadata,
        labels: SampleLabels,
        options: ConversionOptions,
    ) -> Self {
        Self {
            metadata,
            labels,
            options,
            profiles: BTreeMap::new(),
            processes: HashMap::new(),
        }
    }

    /// Number of profiles started so far.
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Finalize every profile, ordered by grouping key.
    pub fn finish(self) -> Result<Vec<ProcessProfile>> {
        let mut output = Vec::with_capacity(self.profiles.len());
        for (pid, state) in self.profiles {
            let ProfileState {
                mut builder,
                time_range,
                ..
            } = state;
            builder
                .finalize()
                .map_err(|source| ConvertError::Validation { pid, source })?;
            let (min_sample_time_ns, max_sample_time_ns) = time_range.unwrap_or_default();
            output.push(ProcessProfile {
                pid,
                min_sample_time_ns,
                max_sample_time_ns,
                profile: builder.into_profile(),
            });
        }
        Ok(output)
    }
}

fn sample_key(
    labels: SampleLabels,
    builder: &mut ProfileBuilder,
    sample: &SampleContext<'_>,
) -> SampleKey {
    SampleKey {
        pid: if labels.contains(SampleLabels::PID) {
            sample.pid
        } else {
            0
        },
        tid: if labels.contains(SampleLabels::TID) {
            sample.tid
        } else {
            0
        },
        time_ns: if labels.contains(SampleLabels::TIMESTAMP_NS) {
            sample.time
        } else {
            0
        },
        execution_mode: if labels.contains(SampleLabels::EXECUTION_MODE) {
            sample.execution_mode
        } else {
            ExecutionMode::Unknown
        },
        comm: if labels.contains(SampleLabels::COMM) {
            builder.optional_string_id(sample.comm)
        } else {
            0
        },
        cpu: if labels.contains(SampleLabels::CPU) {
            sample.cpu
        } else {
            None
        },
        location_ids: Vec::new(),
    }
}

/// Labels for a new sample. Disabled labels were zeroed in the key and are
/// skipped.
fn sample_labels(
    enabled: SampleLabels,
    builder: &mut ProfileBuilder,
    key: &SampleKey,
) -> Vec<Label> {
    let mut labels = Vec::new();
    if enabled.contains(SampleLabels::PID) {
        labels.push(Label::number(builder.string_id(PID_LABEL), i64::from(key.pid)));
    }
    if enabled.contains(SampleLabels::TID) {
        labels.push(Label::number(builder.string_id(TID_LABEL), i64::from(key.tid)));
    }
    if enabled.contains(SampleLabels::TIMESTAMP_NS) {
        labels.push(Label::number(
            builder.string_id(TIMESTAMP_NS_LABEL),
            key.time_ns as i64,
        ));
    }
    if let Some(mode) = key.execution_mode.label() {
        let value = builder.string_id(mode);
        labels.push(Label::string(builder.string_id(EXECUTION_MODE_LABEL), value));
    }
    if key.comm != 0 {
        labels.push(Label::string(builder.string_id(COMM_LABEL), key.comm));
    }
    if let Some(cpu) = key.cpu {
        labels.push(Label::number(builder.string_id(CPU_LABEL), i64::from(cpu)));
    }
    labels
}

/// Leaf-first location ids for one sample.
fn build_stack(
    state: &mut ProfileState,
    cache: &mut ProcessCache,
    sample: &SampleContext<'_>,
) -> Vec<u64> {
    let mappings = sample.mappings;
    let mut stack = Vec::with_capacity(1 + sample.callchain.len() + sample.branch_stack.len());

    if let Some(ip) = sample.ip {
        stack.push(state.location_id(cache, ip.address, ip.mapping, mappings));
    }

    // With a branch stack the user part of the call chain is replaced by
    // the branch sources.
    let has_branch_stack = !sample.branch_stack.is_empty();
    let mut first_address = true;
    for frame in &sample.callchain {
        if has_branch_stack && frame.address == PERF_CONTEXT_USER {
            break;
        }
        if frame.is_marker() {
            continue;
        }
        let repeats_ip = first_address && sample.ip.map(|ip| ip.address) == Some(frame.address);
        first_address = false;
        if repeats_ip {
            continue;
        }
        let Some(handle) = frame.mapping else {
            continue;
        };
        if frame.address <= mappings[handle].start {
            continue;
        }
        // Return addresses point past the call instruction.
        stack.push(state.location_id(cache, frame.address - 1, Some(handle), mappings));
    }

    for branch in &sample.branch_stack {
        let Some(handle) = branch.from.mapping else {
            continue;
        };
        if !mappings[handle].contains(branch.from.address) {
            continue;
        }
        stack.push(state.location_id(cache, branch.from.address, Some(handle), mappings));
    }

    stack
}

impl SampleHandler for SampleAggregator<'_> {
    fn handle_sample(&mut self, sample: &SampleContext<'_>) {
        let group_by_pid = self.options.contains(ConversionOptions::GROUP_BY_PID);
        let strict = self
            .options
            .contains(ConversionOptions::FAIL_ON_MAIN_MAPPING_MISMATCH);
        let event_index = sample.event_index;
        let weight = sample
            .period
            .or_else(|| {
                self.metadata
                    .attrs
                    .get(event_index)
                    .and_then(|attr| attr.sample_period)
            })
            .unwrap_or(1);
        let value_count = 2 * self.metadata.attrs.len();

        let key_pid = if group_by_pid { sample.pid } else { 0 };
        let metadata = self.metadata;
        let enabled_labels = self.labels;
        let state = self
            .profiles
            .entry(key_pid)
            .or_insert_with(|| ProfileState::new(metadata));

        if let Some(main) = sample.main_mapping {
            state.mapping_id(main, sample.mappings);
            if !group_by_pid {
                let filename = sample.mappings[main].display_name();
                state.check_main_mapping(sample.pid, &filename, strict);
            }
        }
        state.record_time(sample.time);

        let cache = self.processes.entry(sample.pid).or_default();
        let mut key = sample_key(enabled_labels, &mut state.builder, sample);
        key.location_ids = build_stack(state, cache, sample);
        let index = match state.samples.get(&key) {
            Some(&index) => index,
            None => {
                let labels = sample_labels(enabled_labels, &mut state.builder, &key);
                let index = state.builder.add_sample(Sample {
                    location_ids: key.location_ids.clone(),
                    values: vec![0; value_count],
                    labels,
                });
                state.samples.insert(key, index);
                index
            }
        };

        let values = &mut state.builder.sample_mut(index).values;
        if let Some(count) = values.get_mut(2 * event_index) {
            *count = count.saturating_add(1);
        }
        if let Some(total) = values.get_mut(2 * event_index + 1) {
            *total = total.saturating_add(i64::try_from(weight).unwrap_or(i64::MAX));
        }
    }

    fn handle_comm(&mut self, comm: &CommContext<'_>) {
        if comm.pid == comm.tid {
            self.processes.remove(&comm.pid);
        }
    }

    fn handle_mmap(&mut self, mmap: &MmapContext<'_>) {
        let mapping = &mmap.mappings[mmap.handle];
        if mmap.pid == KERNEL_PID {
            for cache in self.processes.values_mut() {
                cache.invalidate(mapping.start, mapping.limit);
            }
        } else if let Some(cache) = self.processes.get_mut(&mmap.pid) {
            cache.invalidate(mapping.start, mapping.limit);
        }

        let Some(main) = mmap.backfilled else {
            return;
        };
        let main_mapping = &mmap.mappings[main];
        for state in self.profiles.values_mut() {
            let Some(&id) = state.mapping_ids.get(&main) else {
                continue;
            };
            let filename = state.builder.string_id(&main_mapping.display_name());
            let build_id = state
                .builder
                .optional_string_id(main_mapping.build_id.as_deref());
            if let Some(entry) = state
                .builder
                .profile_mut()
                .mappings
                .iter_mut()
                .find(|m| m.id == id)
            {
                entry.filename = filename;
                entry.build_id = build_id;
            }
        }
    }
}
