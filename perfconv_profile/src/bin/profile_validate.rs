use perfconv_profile::io::read_profile_bytes;
use perfconv_profile::validate;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <profile>", args[0]);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let process_profile = match read_profile_bytes(&bytes) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Unreadable profile '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let profile = &process_profile.profile;
    match validate(profile) {
        Ok(()) => {
            println!("Valid profile: {}", path);
            println!("  PID: {}", process_profile.pid);
            println!(
                "  Sample time: {}..{} ns",
                process_profile.min_sample_time_ns, process_profile.max_sample_time_ns
            );
            println!("  Sample types: {}", profile.sample_types.len());
            println!("  Mappings: {}", profile.mappings.len());
            println!("  Locations: {}", profile.locations.len());
            if !profile.functions.is_empty() {
                println!("  Functions: {}", profile.functions.len());
            }
            println!("  Samples: {}", profile.samples.len());
            println!("  Strings: {}", profile.string_table.len());
            for &comment in &profile.comments {
                if let Some(text) = profile.string(comment) {
                    println!("  Comment: {}", text);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid profile '{}': {}", path, e);
            ExitCode::FAILURE
        }
    }
}
