//! Conversion of Linux perf traces into per-process profiles.
//!
//! The pipeline replays a trace's event stream in order:
//!
//! - [`normalizer`] tracks every process's memory map with an
//!   [`address_space::AddressSpaceTracker`] and resolves sample addresses
//!   to mappings.
//! - [`aggregator`] turns resolved samples into interned
//!   [`perfconv_profile::Profile`]s, merging samples with identical stacks
//!   and labels.
//!
//! [`convert::convert`] runs both over a parsed [`event::PerfTrace`].
//!
//! # Example
//!
//! ```no_run
//! use perfconv::convert::{ConverterConfig, convert};
//! use perfconv::event::PerfTrace;
//! use perfconv::options::{ConversionOptions, SampleLabels};
//! use std::fs::File;
//!
//! let trace = PerfTrace::parse(File::open("perf.ndjson").unwrap()).unwrap();
//! let config = ConverterConfig {
//!     labels: SampleLabels::PID_AND_TID,
//!     options: ConversionOptions::GROUP_BY_PID,
//!     ..Default::default()
//! };
//!
//! for profile in convert(&trace, &config).unwrap() {
//!     println!("pid {}: {} samples", profile.pid, profile.profile.samples.len());
//! }
//! ```

pub mod address_space;
pub mod aggregator;
pub mod convert;
pub mod event;
pub mod interval_map;
pub mod normalizer;
pub mod options;

// Re-export perfconv_profile for convenience
pub use perfconv_profile;
