use anyhow::Result;
use std::path::Path;

use crate::cli::config::Config;
use crate::engine::StageScheduler;
use crate::utils::format_duration;

/// Validate a configuration file without running it.
/// Checks for:
/// - File syntax (YAML or JSON)
/// - Stage durations and a non-empty schedule
/// - Threshold selectors, expressions and statistic applicability
/// - The request plan, if present
pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Configuration parsed");

    let options = match config.engine_options() {
        Ok(options) => options,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    let scheduler = StageScheduler::new(options.stages.clone())?;
    println!(
        "  ✓ {} stage(s), {} total, peak {} VUs",
        scheduler.stages().len(),
        format_duration(scheduler.total_duration()),
        scheduler.max_target()
    );
    for spec in &options.thresholds {
        let marker = if spec.fatal { " (abortOnFail)" } else { "" };
        println!("    threshold {}: {}{}", spec.metric, spec.source, marker);
    }
    if let Some(timeout) = options.timeout {
        println!("    timeout: {}", format_duration(timeout));
    }

    match &config.plan {
        Some(_) => match config.plan() {
            Ok(plan) => {
                let requests: usize = plan.groups.iter().map(|g| g.requests.len()).sum();
                println!(
                    "  ✓ Plan: {} group(s), {} request(s) per iteration",
                    plan.groups.len(),
                    requests
                );
            }
            Err(e) => {
                println!("  ✗ {}", e);
                return Err(e.into());
            }
        },
        None => println!("  ⚠ No 'plan' section found ('volley run' needs one)"),
    }

    Ok(())
}
