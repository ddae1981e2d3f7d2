//! Per-process memory map reconstruction.
//!
//! [`AddressSpaceTracker`] replays mmap, fork and comm events to answer, at
//! any point of the event stream, which mapping owns an address in a given
//! process. Mappings are allocated once in a [`MappingArena`] and referred
//! to by [`MappingHandle`]; forked children share their parent's handles.

use crate::event::{ExecutionMode, KERNEL_PID, MmapEvent, is_context_marker};
use crate::interval_map::IntervalMap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Index;

const PAGE_SIZE: u64 = 4096;
const HIGH_BIT: u64 = 1 << 63;

/// Conventional load addresses of non-PIE x86-64 and i386 executables.
const EXECUTABLE_LOAD_ADDRESSES: [u64; 2] = [0x400000, 0x8048000];

const KERNEL_MAPPING_PREFIX: &str = "[kernel.kallsyms]";

// ============================================================================
// Mappings
// ============================================================================

/// A mapped region of a process address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub filename: Option<String>,
    pub build_id: Option<String>,
    pub start: u64,
    /// Exclusive.
    pub limit: u64,
    pub file_offset: u64,
    /// Identifies the file when its name was elided from the trace.
    pub filename_md5_prefix: Option<u64>,
}

impl Mapping {
    /// # Panics
    ///
    /// Panics if `start >= limit`.
    pub fn new(filename: Option<String>, start: u64, limit: u64, file_offset: u64) -> Self {
        assert!(
            start < limit,
            "mapping {:?} has invalid bounds [{start:#x}, {limit:#x})",
            filename
        );
        Self {
            filename,
            build_id: None,
            start,
            limit,
            file_offset,
            filename_md5_prefix: None,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.limit
    }

    /// Filename for output: the real name, else the MD5 prefix in hex, else
    /// empty.
    pub fn display_name(&self) -> Cow<'_, str> {
        match (&self.filename, self.filename_md5_prefix) {
            (Some(name), _) => Cow::Borrowed(name),
            (None, Some(prefix)) => Cow::Owned(format!("{prefix:#x}")),
            (None, None) => Cow::Borrowed(""),
        }
    }
}

/// Index of a mapping in its [`MappingArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingHandle(usize);

/// Owner of every mapping seen during a conversion.
#[derive(Debug, Default)]
pub struct MappingArena {
    mappings: Vec<Mapping>,
}

impl MappingArena {
    pub fn alloc(&mut self, mapping: Mapping) -> MappingHandle {
        self.mappings.push(mapping);
        MappingHandle(self.mappings.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl Index<MappingHandle> for MappingArena {
    type Output = Mapping;

    fn index(&self, handle: MappingHandle) -> &Mapping {
        &self.mappings[handle.0]
    }
}

// ============================================================================
// Main mapping election
// ============================================================================

fn is_shared_object(name: &str) -> bool {
    name.ends_with(".so") || name.contains(".so.") || name.contains(".so (deleted)")
}

fn is_virtual(name: &str) -> bool {
    name.starts_with("//")
        || name.starts_with('[')
        || name.starts_with("/memfd:")
        || name.starts_with("/dev/")
}

fn is_kernel(pid: u32, mapping: &Mapping, misc: u16) -> bool {
    pid == KERNEL_PID
        || ExecutionMode::from_misc(misc).is_kernel()
        || mapping
            .filename
            .as_deref()
            .is_some_and(|name| name.starts_with(KERNEL_MAPPING_PREFIX))
}

/// Whether a mapping may be elected as the main binary of its process.
fn is_main_candidate(pid: u32, mapping: &Mapping, misc: u16) -> bool {
    if is_kernel(pid, mapping, misc) {
        return false;
    }
    match mapping.filename.as_deref() {
        Some(name) => !name.is_empty() && !is_shared_object(name) && !is_virtual(name),
        None => mapping.filename_md5_prefix.is_some(),
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ProcessSpace {
    mappings: IntervalMap<MappingHandle>,
    main_mapping: Option<MappingHandle>,
    /// tid -> comm
    comms: HashMap<u32, String>,
    last_comm: Option<String>,
    /// Stand-in main mapping for kernel samples of a process with none.
    placeholder_main: Option<MappingHandle>,
}

/// Result of registering an mmap event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOutcome {
    pub handle: MappingHandle,
    /// The main mapping, if this event back-filled its filename.
    pub backfilled: Option<MappingHandle>,
}

/// Replays memory map events for every process of a trace.
#[derive(Debug, Default)]
pub struct AddressSpaceTracker {
    arena: MappingArena,
    processes: HashMap<u32, ProcessSpace>,
}

impl AddressSpaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mappings(&self) -> &MappingArena {
        &self.arena
    }

    /// Register the mapping described by `event`, overwriting whatever it
    /// overlaps in the process. Returns `None` for zero-length mappings and
    /// for mappings whose end overflows the address space, which are
    /// ignored.
    ///
    /// `build_id` is the build id already resolved for the event's file.
    ///
    /// # Panics
    ///
    /// Panics if the kernel quirk swap leaves the mapping with
    /// `start >= limit`.
    pub fn on_map(&mut self, event: &MmapEvent, build_id: Option<String>) -> Option<MapOutcome> {
        if event.len == 0 {
            log::debug!(
                "ignoring zero-length mmap of {:?} at {:#x} in pid {}",
                event.filename,
                event.start,
                event.pid
            );
            return None;
        }

        let Some(limit) = event.start.checked_add(event.len) else {
            log::warn!(
                "ignoring mmap of {:?} at {:#x} in pid {}: length {:#x} overflows",
                event.filename,
                event.start,
                event.pid,
                event.len
            );
            return None;
        };
        let mut start = event.start;
        let mut file_offset = event.pgoff;
        // Some kernels report the kernel text mapping with start and pgoff
        // swapped.
        if file_offset & HIGH_BIT != 0 && limit & HIGH_BIT != 0 {
            std::mem::swap(&mut start, &mut file_offset);
            start &= !(PAGE_SIZE - 1);
        }

        let mut mapping = Mapping::new(event.filename.clone(), start, limit, file_offset);
        mapping.build_id = build_id;
        mapping.filename_md5_prefix = event.filename_md5_prefix;

        let candidate = is_main_candidate(event.pid, &mapping, event.misc);
        let at_load_address = EXECUTABLE_LOAD_ADDRESSES.contains(&start);
        let handle = self.arena.alloc(mapping);

        let space = self.processes.entry(event.pid).or_default();
        space.mappings.set(start, limit, handle);

        let mut backfilled = None;
        match space.main_mapping {
            _ if at_load_address && event.pid != KERNEL_PID => {
                space.main_mapping = Some(handle);
            }
            None if candidate => space.main_mapping = Some(handle),
            Some(main) => {
                // Huge-page remaps leave the main binary anonymous; the
                // file-backed mapping that follows names it.
                let new = &self.arena[handle];
                let main_mapping = &self.arena[main];
                if main_mapping.filename.is_none()
                    && new.filename.is_some()
                    && new.start.checked_sub(new.file_offset) == Some(main_mapping.start)
                {
                    let filename = new.filename.clone();
                    let build_id = new.build_id.clone();
                    let main_mapping = &mut self.arena.mappings[main.0];
                    main_mapping.filename = filename;
                    main_mapping.build_id = build_id;
                    backfilled = Some(main);
                    log::debug!(
                        "back-filled main mapping name {:?} in pid {}",
                        main_mapping.filename,
                        event.pid
                    );
                }
            }
            None => {}
        }

        Some(MapOutcome { handle, backfilled })
    }

    /// Give `child` a copy of `parent`'s address space. Threads (equal
    /// pids) and unknown parents are ignored.
    pub fn on_fork(&mut self, parent: u32, child: u32) {
        if parent == child {
            return;
        }
        let Some(space) = self.processes.get(&parent) else {
            return;
        };
        let mut copy = space.clone();
        copy.placeholder_main = None;
        self.processes.insert(child, copy);
    }

    /// Record a thread name. An event with `pid == tid` is an exec of the
    /// whole process and resets its main mapping and thread names.
    pub fn on_comm(&mut self, pid: u32, tid: u32, comm: &str) {
        let space = self.processes.entry(pid).or_default();
        if pid == tid {
            space.main_mapping = None;
            space.comms.clear();
            space.placeholder_main = None;
        }
        space.comms.insert(tid, comm.to_string());
        space.last_comm = Some(comm.to_string());
    }

    /// Mapping owning `address` in `pid`, falling back to the kernel
    /// address space. Context markers never resolve.
    ///
    /// # Panics
    ///
    /// Panics if the interval index disagrees with the mapping bounds.
    pub fn resolve(&self, pid: u32, address: u64) -> Option<MappingHandle> {
        if is_context_marker(address) {
            return None;
        }
        let lookup = |pid: u32| {
            self.processes
                .get(&pid)
                .and_then(|space| space.mappings.lookup(address).copied())
        };
        let handle = lookup(pid).or_else(|| lookup(KERNEL_PID))?;
        let mapping = &self.arena[handle];
        assert!(
            mapping.contains(address),
            "address {address:#x} resolved to mapping [{:#x}, {:#x}) in pid {pid}",
            mapping.start,
            mapping.limit
        );
        Some(handle)
    }

    pub fn main_mapping(&self, pid: u32) -> Option<MappingHandle> {
        self.processes.get(&pid).and_then(|space| space.main_mapping)
    }

    /// Name of thread `tid`, else the last name seen in the process.
    pub fn comm(&self, pid: u32, tid: u32) -> Option<&str> {
        let space = self.processes.get(&pid)?;
        space
            .comms
            .get(&tid)
            .or(space.last_comm.as_ref())
            .map(String::as_str)
    }

    /// A one-byte stand-in main mapping named after the process, allocated
    /// on first use. `None` when the process has never been named.
    pub fn kernel_placeholder(&mut self, pid: u32) -> Option<MappingHandle> {
        let space = self.processes.get_mut(&pid)?;
        if let Some(handle) = space.placeholder_main {
            return Some(handle);
        }
        let name = space.last_comm.clone()?;
        let handle = self.arena.alloc(Mapping::new(Some(name), 0, 1, 0));
        space.placeholder_main = Some(handle);
        Some(handle)
    }
}
