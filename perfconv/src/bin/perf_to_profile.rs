//! Convert a perf trace to process profiles.
//!
//! The input is the line-delimited JSON rendition of a perf.data event
//! stream (header first, then one record per line). Without
//! `--group-by-pid` a single profile is written; with it, one profile per
//! sampled process is written to `<output>.<pid>`.
//!
//! # Usage
//!
//! ```bash
//! perf_to_profile perf.ndjson -o profile.json.gz
//! perf_to_profile perf.ndjson --group-by-pid --label pid --label tid -o app.profile
//! perf_to_profile perf.ndjson --format postcard --compression zstd \
//!     --build-id /usr/bin/app=4f2a9c0d
//! ```

use clap::{Parser, ValueEnum};
use perfconv::convert::{ConverterConfig, convert};
use perfconv::event::PerfTrace;
use perfconv::options::{ConversionOptions, SampleLabels};
use perfconv_profile::io::{Compression, Format, write_profile};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LabelArg {
    Pid,
    Tid,
    Timestamp,
    ExecutionMode,
    Comm,
    Cpu,
}

impl LabelArg {
    fn flag(self) -> SampleLabels {
        match self {
            LabelArg::Pid => SampleLabels::PID,
            LabelArg::Tid => SampleLabels::TID,
            LabelArg::Timestamp => SampleLabels::TIMESTAMP_NS,
            LabelArg::ExecutionMode => SampleLabels::EXECUTION_MODE,
            LabelArg::Comm => SampleLabels::COMM,
            LabelArg::Cpu => SampleLabels::CPU,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Postcard,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Gzip,
    Zstd,
}

#[derive(Parser, Debug)]
#[command(name = "perf_to_profile")]
#[command(about = "Convert a perf trace to per-process profiles")]
#[command(version)]
struct Args {
    /// Input trace (line-delimited JSON)
    input: PathBuf,

    /// Output profile file (defaults to the input name with a format extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write one profile per process instead of merging all processes
    #[arg(long)]
    group_by_pid: bool,

    /// Abort when merged processes run different main binaries
    #[arg(long)]
    fail_on_main_mapping_mismatch: bool,

    /// Attach a label to every sample (repeatable)
    #[arg(long = "label", value_enum)]
    labels: Vec<LabelArg>,

    /// Build id for a file, as FILENAME=HEX (repeatable)
    #[arg(long = "build-id", value_parser = parse_build_id)]
    build_ids: Vec<(String, String)>,

    /// Output encoding
    #[arg(long, value_enum, default_value = "json")]
    format: FormatArg,

    /// Output compression
    #[arg(long, value_enum, default_value = "gzip")]
    compression: CompressionArg,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_build_id(value: &str) -> Result<(String, String), String> {
    let (filename, build_id) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected FILENAME=HEX, got '{value}'"))?;
    if filename.is_empty() {
        return Err(format!("missing filename in '{value}'"));
    }
    if build_id.is_empty() || !build_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("build id '{build_id}' is not hex"));
    }
    Ok((filename.to_string(), build_id.to_ascii_lowercase()))
}

fn default_output(input: &Path, format: Format, compression: Compression) -> PathBuf {
    let mut extension = format.extension().to_string();
    if let Some(suffix) = compression.extension() {
        extension.push('.');
        extension.push_str(suffix);
    }
    input.with_extension(extension)
}

fn per_pid_path(output: &Path, pid: u32) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(format!(".{pid}"));
    PathBuf::from(path)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let format = match args.format {
        FormatArg::Json => Format::Json,
        FormatArg::Postcard => Format::Postcard,
    };
    let compression = match args.compression {
        CompressionArg::None => Compression::None,
        CompressionArg::Gzip => Compression::Gzip,
        CompressionArg::Zstd => Compression::Zstd,
    };
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input, format, compression));

    let mut config = ConverterConfig::default();
    for label in &args.labels {
        config.labels |= label.flag();
    }
    if args.group_by_pid {
        config.options |= ConversionOptions::GROUP_BY_PID;
    }
    if args.fail_on_main_mapping_mismatch {
        config.options |= ConversionOptions::FAIL_ON_MAIN_MAPPING_MISMATCH;
    }
    config.build_ids = args.build_ids.iter().cloned().collect::<HashMap<_, _>>();

    let input_file = File::open(&args.input).map_err(|e| {
        format!(
            "Failed to open input file '{}': {}",
            args.input.display(),
            e
        )
    })?;
    let trace = PerfTrace::parse(BufReader::new(input_file))?;
    log::info!(
        "read {} events for {} monitored event(s)",
        trace.events.len(),
        trace.metadata.attrs.len()
    );

    let profiles = convert(&trace, &config)?;
    if profiles.is_empty() {
        return Err("no samples found in input".into());
    }

    for profile in &profiles {
        let path = if args.group_by_pid {
            per_pid_path(&output_path, profile.pid)
        } else {
            output_path.clone()
        };
        let output_file = File::create(&path).map_err(|e| {
            format!("Failed to create output file '{}': {}", path.display(), e)
        })?;
        write_profile(BufWriter::new(output_file), profile, format, compression)?;
        log::info!(
            "wrote {} samples for pid {} to '{}'",
            profile.profile.samples.len(),
            profile.pid,
            path.display()
        );
    }

    eprintln!(
        "Converted '{}' -> {} profile(s)",
        args.input.display(),
        profiles.len()
    );

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
