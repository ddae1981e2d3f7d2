//! Single pass over a trace's event stream.
//!
//! The [`Normalizer`] feeds mmap, comm and fork events to an
//! [`AddressSpaceTracker`] and resolves every address of every sample
//! against the process state at that point of the stream. The results are
//! handed to a [`SampleHandler`].

use crate::address_space::{AddressSpaceTracker, MappingArena, MappingHandle};
use crate::event::{
    CommEvent, Event, ExecutionMode, LostEvent, MmapEvent, SampleEvent, TraceMetadata,
    is_context_marker,
};
use std::collections::HashMap;

// ============================================================================
// Handler interface
// ============================================================================

/// An address and the mapping it resolved to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub address: u64,
    pub mapping: Option<MappingHandle>,
}

impl Frame {
    /// Whether this call-chain entry is a context marker rather than an
    /// address.
    pub fn is_marker(&self) -> bool {
        is_context_marker(self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchFrame {
    pub from: Frame,
    pub to: Frame,
    pub mispredicted: bool,
}

/// A sample with every address resolved.
#[derive(Debug, Clone)]
pub struct SampleContext<'a> {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub period: Option<u64>,
    pub cpu: Option<u32>,
    /// Index into [`TraceMetadata::attrs`].
    pub event_index: usize,
    pub execution_mode: ExecutionMode,
    /// `None` for samples without an instruction pointer, including those
    /// synthesized for lost records.
    pub ip: Option<Frame>,
    pub main_mapping: Option<MappingHandle>,
    /// In trace order. Context markers and unresolved entries are kept;
    /// markers never carry a mapping.
    pub callchain: Vec<Frame>,
    pub branch_stack: Vec<BranchFrame>,
    pub comm: Option<&'a str>,
    pub mappings: &'a MappingArena,
}

#[derive(Debug, Clone, Copy)]
pub struct CommContext<'a> {
    pub pid: u32,
    pub tid: u32,
    pub comm: &'a str,
    pub is_exec: bool,
}

/// A mapping that was just registered.
#[derive(Debug, Clone, Copy)]
pub struct MmapContext<'a> {
    pub pid: u32,
    pub handle: MappingHandle,
    /// The main mapping whose filename this event filled in.
    pub backfilled: Option<MappingHandle>,
    pub mappings: &'a MappingArena,
}

/// Receiver of normalized events.
pub trait SampleHandler {
    fn handle_sample(&mut self, sample: &SampleContext<'_>);

    fn handle_comm(&mut self, _comm: &CommContext<'_>) {}

    fn handle_mmap(&mut self, _mmap: &MmapContext<'_>) {}
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters collected while normalizing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub samples: u64,
    pub samples_with_addresses: u64,
    pub missing_sample_mappings: u64,
    pub missing_main_mappings: u64,
    pub callchain_ips: u64,
    pub missing_callchain_mappings: u64,
    pub branch_stack_ips: u64,
    pub missing_branch_stack_mappings: u64,
    pub no_event_errors: u64,
    pub lost_samples: u64,
    pub zero_length_mmaps: u64,
    pub overflowing_mmaps: u64,
}

/// Share of unresolved addresses above which the conversion is suspect.
const MISSING_MAPPING_TOLERANCE_PERCENT: u64 = 1;

impl NormalizerStats {
    /// Human-readable descriptions of every check that failed.
    pub fn warnings(&self) -> Vec<String> {
        let checks = [
            (
                "samples without a main mapping",
                self.missing_main_mappings,
                self.samples,
            ),
            (
                "sample addresses without a mapping",
                self.missing_sample_mappings,
                self.samples_with_addresses,
            ),
            (
                "call-chain addresses without a mapping",
                self.missing_callchain_mappings,
                self.callchain_ips,
            ),
            (
                "branch-stack addresses without a mapping",
                self.missing_branch_stack_mappings,
                self.branch_stack_ips,
            ),
        ];

        let mut warnings: Vec<String> = checks
            .iter()
            .filter(|(_, missing, total)| {
                missing * 100 > total * MISSING_MAPPING_TOLERANCE_PERCENT
            })
            .map(|(what, missing, total)| format!("{missing} of {total} {what}"))
            .collect();
        if self.no_event_errors > 0 {
            warnings.push(format!(
                "{} samples with an unknown event id were dropped",
                self.no_event_errors
            ));
        }
        if self.overflowing_mmaps > 0 {
            warnings.push(format!(
                "{} mmaps extending past the end of the address space were ignored",
                self.overflowing_mmaps
            ));
        }
        warnings
    }

    pub fn log_summary(&self) {
        for warning in self.warnings() {
            log::warn!("{warning}");
        }
        if self.lost_samples > 0 {
            log::info!("trace reports {} lost samples", self.lost_samples);
        }
        if self.zero_length_mmaps > 0 {
            log::debug!("ignored {} zero-length mmaps", self.zero_length_mmaps);
        }
        log::debug!("{self:?}");
    }
}

// ============================================================================
// Normalizer
// ============================================================================

pub struct Normalizer<'a> {
    metadata: &'a TraceMetadata,
    /// filename -> build id
    build_ids: HashMap<String, String>,
    /// sample id -> attr index
    attr_by_id: HashMap<u64, usize>,
    tracker: AddressSpaceTracker,
    stats: NormalizerStats,
}

impl<'a> Normalizer<'a> {
    /// `build_id_overrides` take precedence over the trace's own build-id
    /// table. A build id carried by an mmap event itself wins over both.
    pub fn new(metadata: &'a TraceMetadata, build_id_overrides: &HashMap<String, String>) -> Self {
        let mut build_ids: HashMap<String, String> = metadata
            .build_ids
            .iter()
            .map(|entry| (entry.filename.clone(), entry.build_id.clone()))
            .collect();
        build_ids.extend(
            build_id_overrides
                .iter()
                .map(|(filename, build_id)| (filename.clone(), build_id.clone())),
        );

        let mut attr_by_id = HashMap::new();
        for (index, attr) in metadata.attrs.iter().enumerate() {
            for &id in &attr.ids {
                attr_by_id.insert(id, index);
            }
        }

        Self {
            metadata,
            build_ids,
            attr_by_id,
            tracker: AddressSpaceTracker::new(),
            stats: NormalizerStats::default(),
        }
    }

    pub fn stats(&self) -> &NormalizerStats {
        &self.stats
    }

    pub fn tracker(&self) -> &AddressSpaceTracker {
        &self.tracker
    }

    /// Process `events` in order, calling `handler` for each sample, comm
    /// and registered mapping.
    pub fn normalize<H: SampleHandler>(&mut self, events: &[Event], handler: &mut H) {
        for event in events {
            match event {
                Event::Mmap(mmap) => self.process_mmap(mmap, handler),
                Event::Comm(comm) => self.process_comm(comm, handler),
                Event::Fork(fork) => self.tracker.on_fork(fork.ppid, fork.pid),
                // The process may still be sampled after it exits.
                Event::Exit(_) => {}
                Event::Lost(lost) => self.process_lost(lost, handler),
                Event::Sample(sample) => self.process_sample(sample, handler),
            }
        }
    }

    fn attr_index(&self, id: u64) -> Option<usize> {
        if self.metadata.attrs.len() == 1 {
            return Some(0);
        }
        self.attr_by_id.get(&id).copied()
    }

    fn process_mmap<H: SampleHandler>(&mut self, event: &MmapEvent, handler: &mut H) {
        let build_id = event.build_id.clone().or_else(|| {
            event
                .filename
                .as_ref()
                .and_then(|filename| self.build_ids.get(filename).cloned())
        });
        let Some(outcome) = self.tracker.on_map(event, build_id) else {
            if event.len == 0 {
                self.stats.zero_length_mmaps += 1;
            } else {
                self.stats.overflowing_mmaps += 1;
            }
            return;
        };
        handler.handle_mmap(&MmapContext {
            pid: event.pid,
            handle: outcome.handle,
            backfilled: outcome.backfilled,
            mappings: self.tracker.mappings(),
        });
    }

    fn process_comm<H: SampleHandler>(&mut self, event: &CommEvent, handler: &mut H) {
        self.tracker.on_comm(event.pid, event.tid, &event.comm);
        handler.handle_comm(&CommContext {
            pid: event.pid,
            tid: event.tid,
            comm: &event.comm,
            is_exec: event.exec,
        });
    }

    fn process_lost<H: SampleHandler>(&mut self, event: &LostEvent, handler: &mut H) {
        self.stats.lost_samples += event.lost;
        let event_index = self.attr_index(event.id).unwrap_or(0);
        let context = SampleContext {
            pid: event.pid,
            tid: event.tid,
            time: 0,
            period: None,
            cpu: None,
            event_index,
            execution_mode: ExecutionMode::Unknown,
            ip: None,
            main_mapping: None,
            callchain: Vec::new(),
            branch_stack: Vec::new(),
            comm: None,
            mappings: self.tracker.mappings(),
        };
        for _ in 0..event.lost {
            handler.handle_sample(&context);
        }
    }

    fn process_sample<H: SampleHandler>(&mut self, event: &SampleEvent, handler: &mut H) {
        self.stats.samples += 1;
        let Some(event_index) = self.attr_index(event.id) else {
            self.stats.no_event_errors += 1;
            log::debug!("dropping sample with unknown event id {}", event.id);
            return;
        };
        let pid = event.pid;
        let execution_mode = ExecutionMode::from_misc(event.misc);

        let ip = event.ip.map(|address| {
            self.stats.samples_with_addresses += 1;
            let mapping = self.tracker.resolve(pid, address);
            if mapping.is_none() {
                self.stats.missing_sample_mappings += 1;
            }
            Frame { address, mapping }
        });

        let mut main_mapping = self.tracker.main_mapping(pid);
        if main_mapping.is_none() && execution_mode.is_kernel() {
            main_mapping = self.tracker.kernel_placeholder(pid);
        }
        if main_mapping.is_none() {
            self.stats.missing_main_mappings += 1;
        }

        let mut callchain = Vec::with_capacity(event.callchain.len());
        for &address in &event.callchain {
            if is_context_marker(address) {
                callchain.push(Frame {
                    address,
                    mapping: None,
                });
                continue;
            }
            self.stats.callchain_ips += 1;
            let mapping = self.tracker.resolve(pid, address);
            if mapping.is_none() {
                self.stats.missing_callchain_mappings += 1;
            }
            callchain.push(Frame { address, mapping });
        }

        let mut branch_stack = Vec::with_capacity(event.branch_stack.len());
        for entry in &event.branch_stack {
            let from = self.resolve_branch(pid, entry.from);
            let to = self.resolve_branch(pid, entry.to);
            branch_stack.push(BranchFrame {
                from,
                to,
                mispredicted: entry.mispredicted,
            });
        }

        handler.handle_sample(&SampleContext {
            pid,
            tid: event.tid,
            time: event.time,
            period: event.period,
            cpu: event.cpu,
            event_index,
            execution_mode,
            ip,
            main_mapping,
            callchain,
            branch_stack,
            comm: self.tracker.comm(pid, event.tid),
            mappings: self.tracker.mappings(),
        });
    }

    fn resolve_branch(&mut self, pid: u32, address: u64) -> Frame {
        self.stats.branch_stack_ips += 1;
        let mapping = self.tracker.resolve(pid, address);
        if mapping.is_none() {
            self.stats.missing_branch_stack_mappings += 1;
        }
        Frame { address, mapping }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        BranchEntry, BuildIdEntry, EventAttr, ForkEvent, KERNEL_PID as KERNEL, PERF_CONTEXT_USER,
    };

    /// Owned copy of what a handler saw.
    #[derive(Debug)]
    struct Seen {
        pid: u32,
        event_index: usize,
        ip: Option<(u64, Option<String>)>,
        main: Option<String>,
        callchain: Vec<(u64, Option<String>)>,
        branches: Vec<(Option<String>, Option<String>)>,
        comm: Option<String>,
    }

    #[derive(Default)]
    struct Recorder {
        samples: Vec<Seen>,
        comms: Vec<(u32, u32, String, bool)>,
        mmaps: Vec<(u32, String, Option<String>)>,
        backfills: usize,
    }

    fn filename(mappings: &MappingArena, handle: Option<MappingHandle>) -> Option<String> {
        handle.map(|h| mappings[h].display_name().into_owned())
    }

    impl SampleHandler for Recorder {
        fn handle_sample(&mut self, sample: &SampleContext<'_>) {
            let m = sample.mappings;
            self.samples.push(Seen {
                pid: sample.pid,
                event_index: sample.event_index,
                ip: sample.ip.map(|f| (f.address, filename(m, f.mapping))),
                main: filename(m, sample.main_mapping),
                callchain: sample
                    .callchain
                    .iter()
                    .map(|f| (f.address, filename(m, f.mapping)))
                    .collect(),
                branches: sample
                    .branch_stack
                    .iter()
                    .map(|b| (filename(m, b.from.mapping), filename(m, b.to.mapping)))
                    .collect(),
                comm: sample.comm.map(str::to_string),
            });
        }

        fn handle_comm(&mut self, comm: &CommContext<'_>) {
            self.comms
                .push((comm.pid, comm.tid, comm.comm.to_string(), comm.is_exec));
        }

        fn handle_mmap(&mut self, mmap: &MmapContext<'_>) {
            let mapping = &mmap.mappings[mmap.handle];
            self.mmaps.push((
                mmap.pid,
                mapping.display_name().into_owned(),
                mapping.build_id.clone(),
            ));
            if mmap.backfilled.is_some() {
                self.backfills += 1;
            }
        }
    }

    fn metadata(names: &[(&str, &[u64])]) -> TraceMetadata {
        TraceMetadata {
            attrs: names
                .iter()
                .map(|(name, ids)| EventAttr {
                    name: name.to_string(),
                    sample_period: None,
                    ids: ids.to_vec(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn mmap(pid: u32, start: u64, len: u64, name: &str) -> Event {
        Event::Mmap(MmapEvent {
            pid,
            tid: pid,
            start,
            len,
            filename: Some(name.to_string()),
            ..Default::default()
        })
    }

    fn sample(pid: u32, ip: u64) -> SampleEvent {
        SampleEvent {
            pid,
            tid: pid,
            ip: Some(ip),
            ..Default::default()
        }
    }

    fn run(metadata: &TraceMetadata, events: &[Event]) -> (Recorder, NormalizerStats) {
        let mut normalizer = Normalizer::new(metadata, &HashMap::new());
        let mut recorder = Recorder::default();
        normalizer.normalize(events, &mut recorder);
        (recorder, normalizer.stats().clone())
    }

    #[test]
    fn sample_addresses_resolve_in_order() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![
            mmap(1, 0x1000, 0x1000, "/bin/app"),
            Event::Sample(SampleEvent {
                callchain: vec![PERF_CONTEXT_USER, 0x1100, 0x9000],
                ..sample(1, 0x1100)
            }),
            mmap(1, 0x9000, 0x1000, "/lib/late.so"),
            Event::Sample(SampleEvent {
                callchain: vec![0x9000],
                ..sample(1, 0x1200)
            }),
        ];

        let (recorder, stats) = run(&meta, &events);

        assert_eq!(recorder.samples.len(), 2);
        let first = &recorder.samples[0];
        assert_eq!(first.ip, Some((0x1100, Some("/bin/app".to_string()))));
        assert_eq!(first.main.as_deref(), Some("/bin/app"));
        assert_eq!(
            first.callchain,
            vec![
                (PERF_CONTEXT_USER, None),
                (0x1100, Some("/bin/app".to_string())),
                (0x9000, None),
            ]
        );
        let second = &recorder.samples[1];
        assert_eq!(second.callchain, vec![(0x9000, Some("/lib/late.so".to_string()))]);

        assert_eq!(stats.samples, 2);
        assert_eq!(stats.callchain_ips, 3);
        assert_eq!(stats.missing_callchain_mappings, 1);
        assert_eq!(stats.missing_sample_mappings, 0);
    }

    #[test]
    fn unknown_event_id_drops_sample() {
        let meta = metadata(&[("cycles", &[10]), ("instructions", &[20])]);
        let events = vec![
            mmap(1, 0x1000, 0x1000, "/bin/app"),
            Event::Sample(SampleEvent {
                id: 20,
                ..sample(1, 0x1100)
            }),
            Event::Sample(SampleEvent {
                id: 30,
                ..sample(1, 0x1100)
            }),
        ];

        let (recorder, stats) = run(&meta, &events);

        assert_eq!(recorder.samples.len(), 1);
        assert_eq!(recorder.samples[0].event_index, 1);
        assert_eq!(stats.no_event_errors, 1);
        assert!(
            stats
                .warnings()
                .iter()
                .any(|w| w.contains("unknown event id"))
        );
    }

    #[test]
    fn single_event_ignores_sample_id() {
        let meta = metadata(&[("cycles", &[10])]);
        let events = vec![Event::Sample(SampleEvent {
            id: 99,
            ..sample(1, 0x1100)
        })];
        let (recorder, stats) = run(&meta, &events);
        assert_eq!(recorder.samples[0].event_index, 0);
        assert_eq!(stats.no_event_errors, 0);
    }

    #[test]
    fn lost_records_become_empty_samples() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![Event::Lost(LostEvent {
            id: 0,
            lost: 3,
            pid: 4,
            tid: 5,
        })];

        let (recorder, stats) = run(&meta, &events);

        assert_eq!(recorder.samples.len(), 3);
        assert!(recorder.samples.iter().all(|s| s.pid == 4 && s.ip.is_none()));
        assert_eq!(stats.lost_samples, 3);
        assert_eq!(stats.samples, 0);
    }

    #[test]
    fn forked_child_resolves_parent_mappings() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![
            mmap(1, 0x1000, 0x1000, "/bin/app"),
            Event::Fork(ForkEvent {
                pid: 2,
                ppid: 1,
                tid: 2,
                ptid: 1,
                time: 0,
            }),
            mmap(2, 0x1000, 0x1000, "/bin/child"),
            Event::Sample(sample(1, 0x1100)),
            Event::Sample(sample(2, 0x1100)),
            Event::Exit(ForkEvent {
                pid: 2,
                ppid: 1,
                ..Default::default()
            }),
            Event::Sample(sample(2, 0x1100)),
        ];

        let (recorder, _) = run(&meta, &events);

        let names: Vec<_> = recorder
            .samples
            .iter()
            .map(|s| s.ip.as_ref().and_then(|(_, name)| name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                Some("/bin/app".to_string()),
                Some("/bin/child".to_string()),
                Some("/bin/child".to_string()),
            ]
        );
    }

    #[test]
    fn kernel_samples_get_placeholder_main() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![
            mmap(KERNEL, 0xffff_ffff_8100_0000, 0x100_0000, "[kernel.kallsyms]"),
            Event::Comm(CommEvent {
                pid: 7,
                tid: 7,
                comm: "kworker/0:1".to_string(),
                exec: false,
                time: 0,
            }),
            Event::Sample(SampleEvent {
                misc: 1,
                ..sample(7, 0xffff_ffff_8100_0010)
            }),
            Event::Sample(sample(7, 0x1000)),
        ];

        let (recorder, stats) = run(&meta, &events);

        assert_eq!(recorder.samples[0].main.as_deref(), Some("kworker/0:1"));
        assert_eq!(
            recorder.samples[0].ip.as_ref().and_then(|(_, n)| n.as_deref()),
            Some("[kernel.kallsyms]")
        );
        assert_eq!(recorder.samples[0].comm.as_deref(), Some("kworker/0:1"));
        // User-mode samples do not get the stand-in.
        assert_eq!(recorder.samples[1].main, None);
        assert_eq!(stats.missing_main_mappings, 1);
        assert_eq!(recorder.comms, vec![(7, 7, "kworker/0:1".to_string(), false)]);
    }

    #[test]
    fn branch_entries_are_resolved() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![
            mmap(1, 0x1000, 0x1000, "/bin/app"),
            Event::Sample(SampleEvent {
                branch_stack: vec![
                    BranchEntry {
                        from: 0x1010,
                        to: 0x1020,
                        mispredicted: false,
                    },
                    BranchEntry {
                        from: 0x5000,
                        to: 0x1030,
                        mispredicted: true,
                    },
                ],
                ..sample(1, 0x1100)
            }),
        ];

        let (recorder, stats) = run(&meta, &events);

        let app = Some("/bin/app".to_string());
        assert_eq!(
            recorder.samples[0].branches,
            vec![(app.clone(), app.clone()), (None, app)]
        );
        assert_eq!(stats.branch_stack_ips, 4);
        assert_eq!(stats.missing_branch_stack_mappings, 1);
    }

    #[test]
    fn build_id_priority() {
        let mut meta = metadata(&[("cycles", &[])]);
        meta.build_ids = vec![
            BuildIdEntry {
                filename: "/bin/a".to_string(),
                build_id: "trace-a".to_string(),
            },
            BuildIdEntry {
                filename: "/bin/b".to_string(),
                build_id: "trace-b".to_string(),
            },
        ];
        let mut overrides = HashMap::new();
        overrides.insert("/bin/b".to_string(), "override-b".to_string());

        let own = MmapEvent {
            pid: 1,
            tid: 1,
            start: 0x3000,
            len: 0x1000,
            filename: Some("/bin/a".to_string()),
            build_id: Some("event-a".to_string()),
            ..Default::default()
        };
        let events = vec![
            mmap(1, 0x1000, 0x1000, "/bin/a"),
            mmap(1, 0x2000, 0x1000, "/bin/b"),
            Event::Mmap(own),
            mmap(1, 0x4000, 0x1000, "/bin/c"),
        ];

        let mut normalizer = Normalizer::new(&meta, &overrides);
        let mut recorder = Recorder::default();
        normalizer.normalize(&events, &mut recorder);

        let build_ids: Vec<_> = recorder.mmaps.iter().map(|m| m.2.as_deref()).collect();
        assert_eq!(
            build_ids,
            vec![Some("trace-a"), Some("override-b"), Some("event-a"), None]
        );
    }

    #[test]
    fn zero_length_mmap_is_counted_not_reported() {
        let meta = metadata(&[("cycles", &[])]);
        let (recorder, stats) = run(&meta, &[mmap(1, 0x1000, 0, "/bin/app")]);
        assert!(recorder.mmaps.is_empty());
        assert_eq!(stats.zero_length_mmaps, 1);
    }

    #[test]
    fn overflowing_mmap_is_counted_and_flagged() {
        let meta = metadata(&[("cycles", &[])]);
        let (recorder, stats) = run(&meta, &[mmap(1, u64::MAX - 0xfff, 0x2000, "/bin/app")]);
        assert!(recorder.mmaps.is_empty());
        assert_eq!(stats.zero_length_mmaps, 0);
        assert_eq!(stats.overflowing_mmaps, 1);
        let warnings = stats.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("1 mmaps extending past"));
    }

    #[test]
    fn huge_page_backfill_is_reported() {
        let meta = metadata(&[("cycles", &[])]);
        let events = vec![
            Event::Mmap(MmapEvent {
                pid: 1,
                tid: 1,
                start: 0x400000,
                len: 0x200000,
                ..Default::default()
            }),
            Event::Mmap(MmapEvent {
                pid: 1,
                tid: 1,
                start: 0x600000,
                len: 0x1000,
                pgoff: 0x200000,
                filename: Some("/bin/app".to_string()),
                ..Default::default()
            }),
        ];
        let (recorder, _) = run(&meta, &events);
        assert_eq!(recorder.backfills, 1);
    }

    #[test]
    fn tolerance_allows_one_percent() {
        let mut stats = NormalizerStats {
            samples: 200,
            samples_with_addresses: 200,
            missing_sample_mappings: 2,
            ..Default::default()
        };
        assert!(stats.warnings().is_empty());

        stats.missing_sample_mappings = 3;
        let warnings = stats.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("3 of 200"));
    }
}
