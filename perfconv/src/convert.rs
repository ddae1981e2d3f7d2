//! Trace to profile conversion entry point.

use crate::aggregator::SampleAggregator;
use crate::event::PerfTrace;
use crate::normalizer::Normalizer;
use crate::options::{ConversionOptions, SampleLabels};
use perfconv_profile::{ProcessProfile, ValidationError};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("profile for pid {pid} failed validation: {source}")]
    Validation {
        pid: u32,
        #[source]
        source: ValidationError,
    },
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Configuration for a conversion.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Sample attributes kept as labels.
    pub labels: SampleLabels,
    pub options: ConversionOptions,
    /// filename -> hex build id, overriding the trace's own table.
    pub build_ids: HashMap<String, String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            labels: SampleLabels::NONE,
            options: ConversionOptions::NO_OPTIONS,
            build_ids: HashMap::new(),
        }
    }
}

/// Convert a trace into finalized profiles.
///
/// Returns one profile per sampled process, ordered by pid, when
/// [`ConversionOptions::GROUP_BY_PID`] is set, and otherwise at most one
/// profile with pid `0`. A trace without samples yields no profiles.
///
/// # Panics
///
/// See [`SampleAggregator`] for the strict main-mapping check.
pub fn convert(trace: &PerfTrace, config: &ConverterConfig) -> Result<Vec<ProcessProfile>> {
    let mut normalizer = Normalizer::new(&trace.metadata, &config.build_ids);
    let mut aggregator = SampleAggregator::new(&trace.metadata, config.labels, config.options);

    normalizer.normalize(&trace.events, &mut aggregator);
    let stats = normalizer.stats();
    stats.log_summary();
    log::debug!(
        "normalized {} events into {} profile(s), {} mappings tracked",
        trace.events.len(),
        aggregator.profile_count(),
        normalizer.tracker().mappings().len()
    );

    aggregator.finish()
}
