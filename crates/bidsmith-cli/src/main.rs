mod commands;
mod logging;
mod progress;

use std::process;

use anyhow::Context;
use bidsmith_core::report::format_duration;
use bidsmith_core::{ConversionEngine, EngineOptions, RuleSet, RunResult, SessionFilter};
use clap::Parser;
use colored::*;
use commands::Cli;
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info, warn};

/// Exit codes: 0 full success, 1 a task failed or was cancelled, 2 fatal error.
fn main() {
    dotenv().ok();

    let args = Cli::parse();
    let guard = logging::init_logger();

    let code = match run(&args) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            error!("{:#}", err);
            2
        }
    };

    // flush the file log before exiting
    drop(guard);
    process::exit(code);
}

fn run(args: &Cli) -> anyhow::Result<bool> {
    let mut config = bidsmith_core::load_configuration(args.config.as_deref())
        .context("Error loading configuration")?;
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    if let Some(secs) = args.timeout_secs {
        config.task_timeout_secs = Some(secs);
    }

    let rules = RuleSet::load(&args.rules)
        .with_context(|| format!("Error loading rules from {}", args.rules.display()))?;
    let engine = ConversionEngine::new(config, rules);

    let filter = SessionFilter {
        subject: args
            .subject
            .as_deref()
            .map(|s| engine.normalizer().normalize_subject(s))
            .transpose()
            .context("Invalid --subject")?,
        session: args
            .session
            .as_deref()
            .map(|s| engine.normalizer().require_session(s))
            .transpose()
            .context("Invalid --session")?,
    };

    let token = engine.cancel_token();
    ctrlc::set_handler(move || {
        warn!("Interrupted: no new tasks will start, running ones will finish");
        token.cancel();
    })
    .context("Error installing Ctrl-C handler")?;

    let options = EngineOptions {
        filter,
        rules_file: Some(args.rules.clone()),
        skip_conversion: args.skip_conversion,
        skip_preprocessing: args.skip_preprocessing,
        dry_run: args.dry_run,
    };

    let reporter = CliReporter::new();
    let result = engine.run(&args.input, &args.output, &options, &reporter)?;

    println!();
    if args.dry_run {
        print_plan(&result);
    } else {
        print_summary(&result);
    }
    Ok(result.is_success())
}

fn print_plan(result: &RunResult) {
    for task in &result.tasks {
        println!("{} -> {}", task.id.bold(), task.output_path.display());
        for scan in &task.scans {
            let stem = scan.stem.as_deref().unwrap_or_default();
            println!(
                "    {}/{}  {}",
                scan.category().dir_name().cyan(),
                stem.green(),
                scan.series.path.display().to_string().dimmed()
            );
        }
    }
    for scan in &result.unclassified {
        println!(
            "{} {} {}",
            "unclassified".yellow(),
            scan.identity.task_id(),
            scan.series.describe().dimmed()
        );
    }
    for warning in &result.report.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    info!(
        "Dry run: {} task(s), {} unclassified series, nothing written",
        format!("{}", result.tasks.len()).green(),
        format!("{}", result.unclassified.len()).yellow(),
    );
}

fn print_summary(result: &RunResult) {
    let report = &result.report;
    let conversion = &report.conversion;
    info!(
        "Conversion: {} succeeded, {} failed, {} cancelled of {}",
        format!("{}", conversion.succeeded).green(),
        format!("{}", conversion.failed).red(),
        format!("{}", conversion.cancelled).yellow(),
        conversion.total,
    );
    let preprocessing = &report.preprocessing;
    if preprocessing.total > 0 {
        info!(
            "Preprocessing: {} succeeded, {} failed, {} cancelled of {}",
            format!("{}", preprocessing.succeeded).green(),
            format!("{}", preprocessing.failed).red(),
            format!("{}", preprocessing.cancelled).yellow(),
            preprocessing.total,
        );
    }
    for (cause, count) in &report.failures_by_cause {
        info!("  {}: {}", cause.title(), format!("{}", count).red());
    }
    if report.warning_count > 0 {
        info!("{} warning(s)", format!("{}", report.warning_count).yellow());
    }
    info!(
        "Finished in {}",
        format_duration(result.duration.as_secs_f64()).green()
    );
    match &result.report_files {
        Some((text, _)) => info!("Report: {}", text.display().to_string().cyan()),
        None => warn!("No report file was written"),
    }
}
