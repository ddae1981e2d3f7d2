//! Typed perf trace events and their line-delimited JSON rendition.
//!
//! A trace file holds one JSON object per line. Every object carries a
//! `type` field naming the record kind. The first record must be the
//! `header`, which declares the monitored events; `build_id` records may
//! follow anywhere and feed the trace's build-id table. All remaining
//! records are events, kept in file order.
//!
//! ```text
//! {"type":"header","attrs":[{"name":"cycles","sample_period":null,"ids":[]}]}
//! {"type":"mmap","pid":42,"tid":42,"start":4194304,"len":4096,"pgoff":0,"filename":"/usr/bin/app"}
//! {"type":"sample","pid":42,"tid":42,"ip":4194560,"time":1000,"period":250}
//! ```

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use thiserror::Error;

// ============================================================================
// Kernel ABI constants
// ============================================================================

/// Call-chain marker: following entries are hypervisor addresses.
pub const PERF_CONTEXT_HV: u64 = -32i64 as u64;
/// Call-chain marker: following entries are kernel addresses.
pub const PERF_CONTEXT_KERNEL: u64 = -128i64 as u64;
/// Call-chain marker: following entries are user addresses.
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;
pub const PERF_CONTEXT_GUEST: u64 = -2048i64 as u64;
pub const PERF_CONTEXT_GUEST_KERNEL: u64 = -2176i64 as u64;
pub const PERF_CONTEXT_GUEST_USER: u64 = -2560i64 as u64;
/// Values at or above this are context markers, never addresses.
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 0x7;
const PERF_RECORD_MISC_KERNEL: u16 = 1;
const PERF_RECORD_MISC_USER: u16 = 2;
const PERF_RECORD_MISC_HYPERVISOR: u16 = 3;
const PERF_RECORD_MISC_GUEST_KERNEL: u16 = 4;
const PERF_RECORD_MISC_GUEST_USER: u16 = 5;

/// The pid perf uses for kernel mappings (`-1`), shared by every process.
pub const KERNEL_PID: u32 = u32::MAX;

/// Whether a call-chain value is a context marker.
pub fn is_context_marker(value: u64) -> bool {
    value >= PERF_CONTEXT_MAX
}

/// CPU mode a sample was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    #[default]
    Unknown,
    HostKernel,
    HostUser,
    Hypervisor,
    GuestKernel,
    GuestUser,
}

impl ExecutionMode {
    /// Decode the cpumode bits of a record's `misc` field.
    pub fn from_misc(misc: u16) -> Self {
        match misc & PERF_RECORD_MISC_CPUMODE_MASK {
            PERF_RECORD_MISC_KERNEL => ExecutionMode::HostKernel,
            PERF_RECORD_MISC_USER => ExecutionMode::HostUser,
            PERF_RECORD_MISC_HYPERVISOR => ExecutionMode::Hypervisor,
            PERF_RECORD_MISC_GUEST_KERNEL => ExecutionMode::GuestKernel,
            PERF_RECORD_MISC_GUEST_USER => ExecutionMode::GuestUser,
            _ => ExecutionMode::Unknown,
        }
    }

    /// Label value; `None` for an unknown mode.
    pub fn label(self) -> Option<&'static str> {
        match self {
            ExecutionMode::Unknown => None,
            ExecutionMode::HostKernel => Some("Host Kernel"),
            ExecutionMode::HostUser => Some("Host User"),
            ExecutionMode::Hypervisor => Some("Hypervisor"),
            ExecutionMode::GuestKernel => Some("Guest Kernel"),
            ExecutionMode::GuestUser => Some("Guest User"),
        }
    }

    pub fn is_kernel(self) -> bool {
        matches!(self, ExecutionMode::HostKernel | ExecutionMode::GuestKernel)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// One monitored event as declared by the trace header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttr {
    /// Event name, e.g. `cycles` or `instructions:u`.
    pub name: String,
    /// Fixed sampling period, when the event was recorded with one.
    #[serde(default)]
    pub sample_period: Option<u64>,
    /// Sample ids routed to this event.
    #[serde(default)]
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdEntry {
    pub filename: String,
    /// Lower-case hex.
    pub build_id: String,
}

/// Trace-wide information that is not part of the event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceMetadata {
    pub attrs: Vec<EventAttr>,
    pub tool_version: Option<String>,
    pub command_line: Option<String>,
    pub build_ids: Vec<BuildIdEntry>,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmapEvent {
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub tid: u32,
    pub start: u64,
    pub len: u64,
    #[serde(default)]
    pub pgoff: u64,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    /// Stand-in identity for mappings whose filename was elided.
    #[serde(default)]
    pub filename_md5_prefix: Option<u64>,
    #[serde(default)]
    pub misc: u16,
    #[serde(default)]
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommEvent {
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(deserialize_with = "deserialize_pid")]
    pub tid: u32,
    pub comm: String,
    /// Set when the comm change comes from an exec.
    #[serde(default)]
    pub exec: bool,
    #[serde(default)]
    pub time: u64,
}

/// Payload of both fork and exit records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkEvent {
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(deserialize_with = "deserialize_pid")]
    pub ppid: u32,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub tid: u32,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub ptid: u32,
    #[serde(default)]
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostEvent {
    #[serde(default)]
    pub id: u64,
    pub lost: u64,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub tid: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
    #[serde(default)]
    pub mispredicted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEvent {
    /// Routes the sample to an [`EventAttr`] when several are declared.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub ip: Option<u64>,
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: u32,
    #[serde(deserialize_with = "deserialize_pid")]
    pub tid: u32,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub period: Option<u64>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub misc: u16,
    /// Root-last; may contain context markers.
    #[serde(default)]
    pub callchain: Vec<u64>,
    /// Most recent branch first.
    #[serde(default)]
    pub branch_stack: Vec<BranchEntry>,
}

/// One record of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Mmap(MmapEvent),
    Comm(CommEvent),
    Fork(ForkEvent),
    Exit(ForkEvent),
    Lost(LostEvent),
    Sample(SampleEvent),
}

/// perf writes `-1` for the kernel pid.
fn deserialize_pid<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u32, D::Error> {
    let value = i64::deserialize(deserializer)?;
    if value == -1 {
        return Ok(KERNEL_PID);
    }
    u32::try_from(value).map_err(|_| D::Error::custom(format!("pid {value} out of range")))
}

// ============================================================================
// Parsing
// ============================================================================

/// Errors that can occur while reading a trace.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing header record")]
    MissingHeader,

    #[error("header must be first record, found at line {0}")]
    HeaderNotFirst(usize),

    #[error("duplicate header at line {0}")]
    DuplicateHeader(usize),

    #[error("header at line {0} declares no events")]
    NoEventAttrs(usize),

    #[error("unknown record type '{0}' at line {1}")]
    UnknownRecordType(String, usize),
}

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderRecord {
    attrs: Vec<EventAttr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command_line: Option<String>,
}

/// Helper for writing records with a "type" field.
#[derive(Serialize)]
struct TypedRecord<'a, T: Serialize> {
    #[serde(rename = "type")]
    record_type: &'a str,
    #[serde(flatten)]
    data: &'a T,
}

/// A parsed trace: metadata plus the ordered event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerfTrace {
    pub metadata: TraceMetadata,
    pub events: Vec<Event>,
}

impl PerfTrace {
    /// Parse a trace from any `Read`-able source.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let buf_reader = BufReader::new(reader);
        let mut metadata: Option<TraceMetadata> = None;
        let mut build_ids = Vec::new();
        let mut events = Vec::new();

        for (line_num, line_result) in buf_reader.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            let raw: RawRecord = parse_record(&line, line_num)?;
            match raw.record_type.as_str() {
                "header" => {
                    if metadata.is_some() {
                        return Err(ParseError::DuplicateHeader(line_num));
                    }
                    if line_num != 1 {
                        return Err(ParseError::HeaderNotFirst(line_num));
                    }
                    let header: HeaderRecord = parse_record(&line, line_num)?;
                    if header.attrs.is_empty() {
                        return Err(ParseError::NoEventAttrs(line_num));
                    }
                    metadata = Some(TraceMetadata {
                        attrs: header.attrs,
                        tool_version: header.tool_version,
                        command_line: header.command_line,
                        build_ids: Vec::new(),
                    });
                }
                _ if metadata.is_none() => {
                    return Err(ParseError::HeaderNotFirst(line_num));
                }
                "build_id" => build_ids.push(parse_record(&line, line_num)?),
                "mmap" => events.push(Event::Mmap(parse_record(&line, line_num)?)),
                "comm" => events.push(Event::Comm(parse_record(&line, line_num)?)),
                "fork" => events.push(Event::Fork(parse_record(&line, line_num)?)),
                "exit" => events.push(Event::Exit(parse_record(&line, line_num)?)),
                "lost" => events.push(Event::Lost(parse_record(&line, line_num)?)),
                "sample" => events.push(Event::Sample(parse_record(&line, line_num)?)),
                other => {
                    return Err(ParseError::UnknownRecordType(other.to_string(), line_num));
                }
            }
        }

        let mut metadata = metadata.ok_or(ParseError::MissingHeader)?;
        metadata.build_ids = build_ids;
        Ok(PerfTrace { metadata, events })
    }

    /// Write the trace as NDJSON: header, build ids, then events in order.
    pub fn write<W: Write>(&self, mut writer: W) -> std::result::Result<(), std::io::Error> {
        let header = HeaderRecord {
            attrs: self.metadata.attrs.clone(),
            tool_version: self.metadata.tool_version.clone(),
            command_line: self.metadata.command_line.clone(),
        };
        write_line(&mut writer, &TypedRecord {
            record_type: "header",
            data: &header,
        })?;
        for entry in &self.metadata.build_ids {
            write_line(&mut writer, &TypedRecord {
                record_type: "build_id",
                data: entry,
            })?;
        }
        for event in &self.events {
            write_line(&mut writer, event)?;
        }
        writer.flush()
    }
}

fn parse_record<T: DeserializeOwned>(line: &str, line_num: usize) -> Result<T> {
    serde_json::from_str(line).map_err(|e| ParseError::Json {
        line: line_num,
        source: e,
    })
}

fn write_line<W: Write, T: Serialize>(writer: &mut W, record: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = r#"{"type":"header","attrs":[{"name":"cycles"}],"tool_version":"6.1","command_line":"perf record -g ./app"}"#;

    #[test]
    fn context_markers_are_above_max() {
        for marker in [
            PERF_CONTEXT_HV,
            PERF_CONTEXT_KERNEL,
            PERF_CONTEXT_USER,
            PERF_CONTEXT_GUEST,
            PERF_CONTEXT_GUEST_KERNEL,
            PERF_CONTEXT_GUEST_USER,
            PERF_CONTEXT_MAX,
        ] {
            assert!(is_context_marker(marker), "{marker:#x}");
        }
        assert!(!is_context_marker(0xffff_ffff_8100_0000));
        assert_eq!(PERF_CONTEXT_USER, 0xffff_ffff_ffff_fe00);
    }

    #[test]
    fn execution_mode_from_misc() {
        assert_eq!(ExecutionMode::from_misc(0x4001), ExecutionMode::HostKernel);
        assert_eq!(ExecutionMode::from_misc(2), ExecutionMode::HostUser);
        assert_eq!(ExecutionMode::from_misc(3), ExecutionMode::Hypervisor);
        assert_eq!(ExecutionMode::from_misc(4), ExecutionMode::GuestKernel);
        assert_eq!(ExecutionMode::from_misc(5), ExecutionMode::GuestUser);
        assert_eq!(ExecutionMode::from_misc(0), ExecutionMode::Unknown);
        assert_eq!(ExecutionMode::HostUser.label(), Some("Host User"));
        assert_eq!(ExecutionMode::Unknown.label(), None);
        assert!(ExecutionMode::GuestKernel.is_kernel());
    }

    #[test]
    fn parse_header_only() {
        let trace = PerfTrace::parse(Cursor::new(HEADER)).unwrap();
        assert_eq!(trace.metadata.attrs.len(), 1);
        assert_eq!(trace.metadata.attrs[0].name, "cycles");
        assert_eq!(trace.metadata.attrs[0].sample_period, None);
        assert_eq!(trace.metadata.tool_version.as_deref(), Some("6.1"));
        assert!(trace.events.is_empty());
    }

    #[test]
    fn parse_events_in_order() {
        let data = [
            HEADER,
            r#"{"type":"build_id","filename":"/usr/bin/app","build_id":"abcdef"}"#,
            r#"{"type":"mmap","pid":-1,"tid":-1,"start":18446744071562067968,"len":4096,"pgoff":0,"filename":"[kernel.kallsyms]_text"}"#,
            r#"{"type":"comm","pid":7,"tid":7,"comm":"app","exec":true}"#,
            r#"{"type":"fork","pid":8,"ppid":7,"tid":8,"ptid":7}"#,
            r#"{"type":"exit","pid":8,"ppid":7}"#,
            r#"{"type":"lost","lost":3,"pid":7,"tid":7}"#,
            r#"{"type":"sample","pid":7,"tid":7,"ip":4096,"callchain":[18446744073709551104,4200],"branch_stack":[{"from":1,"to":2}]}"#,
        ]
        .join("\n");

        let trace = PerfTrace::parse(Cursor::new(data)).unwrap();

        assert_eq!(trace.metadata.build_ids.len(), 1);
        assert_eq!(trace.metadata.build_ids[0].build_id, "abcdef");
        assert_eq!(trace.events.len(), 6);
        match &trace.events[0] {
            Event::Mmap(mmap) => {
                assert_eq!(mmap.pid, KERNEL_PID);
                assert_eq!(mmap.start, 0xffff_ffff_8000_0000);
            }
            other => panic!("expected mmap, got {other:?}"),
        }
        assert!(matches!(&trace.events[1], Event::Comm(c) if c.exec && c.comm == "app"));
        assert!(matches!(&trace.events[2], Event::Fork(f) if f.ppid == 7));
        assert!(matches!(&trace.events[3], Event::Exit(_)));
        assert!(matches!(&trace.events[4], Event::Lost(l) if l.lost == 3));
        match &trace.events[5] {
            Event::Sample(sample) => {
                assert_eq!(sample.ip, Some(4096));
                assert_eq!(sample.callchain, vec![PERF_CONTEXT_USER, 4200]);
                assert_eq!(sample.branch_stack[0].to, 2);
                assert_eq!(sample.period, None);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn blank_lines_are_skipped() {
        let data = format!("{HEADER}\n\n   \n");
        assert!(PerfTrace::parse(Cursor::new(data)).is_ok());
    }

    #[test]
    fn missing_header_fails() {
        let result = PerfTrace::parse(Cursor::new(""));
        assert!(matches!(result, Err(ParseError::MissingHeader)));
    }

    #[test]
    fn event_before_header_fails() {
        let data = format!(
            "{}\n{HEADER}",
            r#"{"type":"comm","pid":1,"tid":1,"comm":"a"}"#
        );
        let result = PerfTrace::parse(Cursor::new(data));
        assert!(matches!(result, Err(ParseError::HeaderNotFirst(1))));
    }

    #[test]
    fn duplicate_header_fails() {
        let data = format!("{HEADER}\n{HEADER}");
        let result = PerfTrace::parse(Cursor::new(data));
        assert!(matches!(result, Err(ParseError::DuplicateHeader(2))));
    }

    #[test]
    fn header_without_events_fails() {
        let data = r#"{"type":"header","attrs":[]}"#;
        let result = PerfTrace::parse(Cursor::new(data));
        assert!(matches!(result, Err(ParseError::NoEventAttrs(1))));
    }

    #[test]
    fn unknown_record_type_fails() {
        let data = format!("{HEADER}\n{}", r#"{"type":"aux","size":4}"#);
        let result = PerfTrace::parse(Cursor::new(data));
        match result {
            Err(ParseError::UnknownRecordType(kind, line)) => {
                assert_eq!(kind, "aux");
                assert_eq!(line, 2);
            }
            other => panic!("expected unknown record error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_record_reports_line() {
        let data = format!("{HEADER}\n{}", r#"{"type":"mmap","pid":1}"#);
        let result = PerfTrace::parse(Cursor::new(data));
        assert!(matches!(result, Err(ParseError::Json { line: 2, .. })));
    }

    #[test]
    fn out_of_range_pid_fails() {
        let data = format!(
            "{HEADER}\n{}",
            r#"{"type":"comm","pid":-7,"tid":1,"comm":"a"}"#
        );
        let result = PerfTrace::parse(Cursor::new(data));
        assert!(matches!(result, Err(ParseError::Json { line: 2, .. })));
    }

    #[test]
    fn write_then_parse_preserves_trace() {
        let trace = PerfTrace {
            metadata: TraceMetadata {
                attrs: vec![EventAttr {
                    name: "cycles".to_string(),
                    sample_period: Some(1000),
                    ids: vec![11],
                }],
                tool_version: None,
                command_line: Some("perf record".to_string()),
                build_ids: vec![BuildIdEntry {
                    filename: "/bin/a".to_string(),
                    build_id: "00ff".to_string(),
                }],
            },
            events: vec![
                Event::Mmap(MmapEvent {
                    pid: KERNEL_PID,
                    tid: KERNEL_PID,
                    start: 0x1000,
                    len: 0x1000,
                    filename: Some("/bin/a".to_string()),
                    ..Default::default()
                }),
                Event::Sample(SampleEvent {
                    id: 11,
                    ip: Some(0x1800),
                    pid: 5,
                    tid: 6,
                    cpu: Some(2),
                    ..Default::default()
                }),
            ],
        };

        let mut out = Vec::new();
        trace.write(&mut out).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with(r#"{"type":"header""#));
        assert_eq!(text.lines().count(), 4);

        let parsed = PerfTrace::parse(Cursor::new(out)).unwrap();
        assert_eq!(parsed, trace);
    }
}
