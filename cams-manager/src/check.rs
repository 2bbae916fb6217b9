//! `cams-manager check`: verify the host can record before starting

use std::path::Path;
use stream_recorder::{tool_version, Config, ConfigError};

/// Print a report and return true if every check passed
pub fn run(config_path: &Path) -> bool {
    println!("=== cams-manager configuration check ===\n");

    let config = match Config::load(config_path) {
        Ok(config) => Some(config),
        Err(e) => {
            report_config_error(config_path, &e);
            None
        }
    };

    // Fall back to default tool names when the config cannot be read
    let defaults = Config::default();
    let settings = config.as_ref().unwrap_or(&defaults);

    let mut results = vec![
        check_tool("ffmpeg", &settings.capture.program),
        check_tool("ffprobe", &settings.aggregator.probe_program),
    ];
    if settings.aggregator.merge_program != settings.capture.program {
        results.push(check_tool("merge", &settings.aggregator.merge_program));
    }
    println!();

    results.push(match &config {
        Some(config) => check_streams(config),
        None => false,
    });
    println!();

    println!("{}", "=".repeat(40));
    if results.iter().all(|ok| *ok) {
        println!("✓ All checks passed! Ready to run cams-manager");
        println!("\nRun with: cams-manager -c {}", config_path.display());
        true
    } else {
        println!("✗ Some checks failed. Please fix the issues above.");
        false
    }
}

fn check_tool(label: &str, program: &str) -> bool {
    match tool_version(program) {
        Some(version) => {
            println!("✓ {} is installed: {}", label, version);
            true
        }
        None => {
            println!("✗ {} not runnable: {}", label, program);
            println!("  Install with: sudo apt install ffmpeg");
            false
        }
    }
}

fn report_config_error(path: &Path, error: &ConfigError) {
    match error {
        ConfigError::NotFound(_) => {
            println!("✗ Config file not found: {}", path.display());
            println!("  Copy config.example.toml to {} and edit it", path.display());
        }
        other => println!("✗ Invalid config {}: {}", path.display(), other),
    }
}

fn check_streams(config: &Config) -> bool {
    println!("✓ Found {} stream(s) in config", config.streams.len());

    for stream in &config.streams {
        if stream.output_dir.is_dir() {
            println!("  ✓ Stream {}: output directory exists", stream.name);
        } else {
            println!(
                "  ! Stream {}: output directory does not exist: {}",
                stream.name,
                stream.output_dir.display()
            );
            println!("    Will be created automatically");
        }
    }
    true
}
