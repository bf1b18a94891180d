use std::fs;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use phone_farm_lib::app::adb::apk::normalize_apk_path;
use phone_farm_lib::app::config::{config_path, data_dir, load_config, save_config, FarmConfig};
use phone_farm_lib::app::features::bloatware::CleanupMode;
use phone_farm_lib::app::features::configurator::ConfigPreset;
use phone_farm_lib::app::logging::{init_logging, new_trace_id};
use phone_farm_lib::app::models::{BatchCounts, BatchResults, LifecycleState};
use phone_farm_lib::app::orchestrator::ConnectSummary;
use phone_farm_lib::app::scheduler::{cancel_on_interrupt, CancelToken};
use phone_farm_lib::app::startup::{check_authorized, prepare_startup};
use phone_farm_lib::app::state::AppState;

#[derive(Parser)]
#[command(name = "phone-farm")]
#[command(about = "Connect and drive a fleet of Android devices over adb", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and list devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Prewarm the bridge, plan, and connect every authorized device
    Run {
        /// Bind and verify automation sessions at connect time
        #[arg(long)]
        full: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        no_prewarm: bool,
    },
    /// Create local folders and config, start the bridge daemon
    Setup,
    /// Run a shell command on every connected device
    Shell {
        command: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Install an app from the local apks folder
    Install {
        app: String,
        /// Package name, used to skip devices that already have it
        #[arg(long)]
        package: Option<String>,
    },
    /// List installed packages on every connected device
    Packages {
        #[arg(long)]
        third_party: bool,
    },
    /// Uninstall one package from every connected device
    Uninstall { package: String },
    /// Remove unwanted packages
    Debloat {
        /// Remove everything outside the allowlist
        #[arg(long, conflicts_with = "third_party")]
        allowlist: bool,
        /// Remove every user-installed package outside the keep list
        #[arg(long)]
        third_party: bool,
    },
    /// Apply a settings preset
    Configure {
        #[arg(long, value_enum, default_value_t = PresetArg::Standard)]
        preset: PresetArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PresetArg {
    Minimal,
    Standard,
    Lockdown,
}

impl From<PresetArg> for ConfigPreset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Minimal => ConfigPreset::Minimal,
            PresetArg::Standard => ConfigPreset::Standard,
            PresetArg::Lockdown => ConfigPreset::Lockdown,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let trace_id = new_trace_id();
    let config = match load_config(&trace_id) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("warning: {err}; using defaults");
            FarmConfig::default()
        }
    };
    init_logging(&config.logging.log_level);

    match run(cli.command, config, &trace_id) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(command: Commands, mut config: FarmConfig, trace_id: &str) -> Result<()> {
    if let Commands::Shell {
        timeout: Some(secs), ..
    } = &command
    {
        config.timeouts.shell_secs = (*secs).max(1);
    }
    if matches!(command, Commands::Setup) {
        return setup(config, trace_id);
    }

    let state = AppState::new(config, trace_id).context("adb is not available")?;
    let cancel = CancelToken::new();
    if let Err(err) = cancel_on_interrupt(&cancel, trace_id) {
        eprintln!("warning: {err}; Ctrl-C will stop the process without cleanup");
    }
    let outcome = dispatch(&state, command, &cancel, trace_id);
    state.teardown(trace_id);
    outcome
}

fn dispatch(
    state: &AppState,
    command: Commands,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<()> {
    match command {
        Commands::Devices { json } => devices(state, json, trace_id),
        Commands::Run {
            full,
            batch_size,
            no_prewarm,
        } => connect(state, full, batch_size, no_prewarm, cancel, trace_id),
        Commands::Shell { command, .. } => {
            let ids = connected_fleet(state, cancel, trace_id)?;
            let results = state.executor.run_command_batch(
                &ids,
                &command,
                state.config.parallel.command,
                cancel,
                trace_id,
            );
            for (serial, result) in &results {
                let text = result
                    .payload
                    .as_ref()
                    .map(|output| output.primary_text().trim().to_string())
                    .or_else(|| result.error.clone())
                    .unwrap_or_default();
                println!("[{serial}] {text}");
            }
            print_counts("shell", &results);
            Ok(())
        }
        Commands::Install { app, package } => {
            let ids = connected_fleet(state, cancel, trace_id)?;
            let report = state
                .installer()
                .install_app(&app, package.as_deref(), &ids, cancel, trace_id)?;
            for (serial, result) in &report.results {
                println!("[{serial}] {}", outcome_text(result.success, result.skipped, result.error.as_deref()));
            }
            print_counts(&format!("install {}", report.app_name), &report.results);
            Ok(())
        }
        Commands::Packages { third_party } => {
            let ids = connected_fleet(state, cancel, trace_id)?;
            let results = state.executor.list_packages_batch(
                &ids,
                third_party,
                state.config.parallel.command,
                cancel,
                trace_id,
            );
            for (serial, result) in &results {
                match &result.payload {
                    Some(packages) => {
                        for package in packages {
                            println!("[{serial}] {package}");
                        }
                    }
                    None => println!("[{serial}] {}", result.error.as_deref().unwrap_or("failed")),
                }
            }
            print_counts("packages", &results);
            Ok(())
        }
        Commands::Uninstall { package } => {
            let ids = connected_fleet(state, cancel, trace_id)?;
            let results = state.executor.uninstall_package_batch(
                &ids,
                &package,
                state.config.parallel.bloatware_removal,
                cancel,
                trace_id,
            );
            for (serial, result) in &results {
                println!("[{serial}] {}", outcome_text(result.success, result.skipped, result.error.as_deref()));
            }
            print_counts(&format!("uninstall {package}"), &results);
            Ok(())
        }
        Commands::Debloat {
            allowlist,
            third_party,
        } => {
            let mode = if allowlist {
                CleanupMode::Allowlist
            } else if third_party {
                CleanupMode::ThirdParty
            } else {
                CleanupMode::Bloatware
            };
            let ids = connected_fleet(state, cancel, trace_id)?;
            let results = state.bloatware_remover().run(&ids, mode, cancel, trace_id);
            for (serial, result) in &results {
                match &result.payload {
                    Some(report) => println!(
                        "[{serial}] removed {} kept {} failed {}",
                        report.removed.len(),
                        report.skipped.len(),
                        report.failed.len()
                    ),
                    None => println!("[{serial}] {}", result.error.as_deref().unwrap_or("failed")),
                }
            }
            print_counts("debloat", &results);
            Ok(())
        }
        Commands::Configure { preset } => {
            let ids = connected_fleet(state, cancel, trace_id)?;
            let results = state
                .configurator()
                .apply(&ids, preset.into(), cancel, trace_id);
            for (serial, result) in &results {
                match &result.payload {
                    Some(report) => println!(
                        "[{serial}] {}/{} settings applied",
                        report.applied(),
                        report.steps.len()
                    ),
                    None => println!("[{serial}] {}", result.error.as_deref().unwrap_or("failed")),
                }
            }
            print_counts("configure", &results);
            Ok(())
        }
        Commands::Setup => Ok(()),
    }
}

fn setup(config: FarmConfig, trace_id: &str) -> Result<()> {
    let data = data_dir();
    fs::create_dir_all(&data).with_context(|| format!("Failed to create {}", data.display()))?;
    let apks = normalize_apk_path(&config.apks_dir);
    fs::create_dir_all(&apks).with_context(|| format!("Failed to create {}", apks.display()))?;
    if !config_path().exists() {
        save_config(&config, trace_id)?;
        println!("wrote {}", config_path().display());
    }

    let state = AppState::new(config, trace_id).context("adb is not available")?;
    state.transport.start_server(trace_id)?;
    let serials = state.transport.list_serials(trace_id)?;
    println!("adb ready, {} device(s) visible", serials.len());
    println!("apk folder: {}", apks.display());
    Ok(())
}

fn devices(state: &AppState, json: bool, trace_id: &str) -> Result<()> {
    state.registry.scan(trace_id)?;
    let snapshots = state.registry.snapshots();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    for snapshot in &snapshots {
        println!(
            "{:<24} {:<14} {:<20} {}",
            snapshot.serial,
            snapshot.state.label(),
            snapshot.model,
            snapshot.platform_version
        );
    }
    println!("{} device(s)", snapshots.len());
    Ok(())
}

fn connect(
    state: &AppState,
    full: bool,
    batch_size: Option<usize>,
    no_prewarm: bool,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<()> {
    let startup = prepare_startup(state.transport.as_ref(), !no_prewarm, trace_id)?;
    if startup.device_count == 0 {
        bail!("no devices visible to adb");
    }
    println!(
        "{} device(s), waves of {}, estimated {:.1}s",
        startup.device_count, startup.plan.wave_size, startup.estimated_secs
    );

    let fast_mode = !full && state.config.connection.default_fast_mode;
    state.registry.scan(trace_id)?;
    let summary = state
        .orchestrator
        .connect_all(fast_mode, batch_size, cancel, trace_id, |progress| {
            println!(
                "wave {}/{}: {}/{} connected",
                progress.wave, progress.waves, progress.connected, progress.total
            );
        })?;
    print_summary(&summary);

    let pending = state.registry.ids_in_state(LifecycleState::Unauthorized);
    if !pending.is_empty() {
        let granted = check_authorized(
            state.transport.as_ref(),
            &pending,
            state.config.connection.max_concurrent_connections,
            cancel,
            trace_id,
        );
        println!(
            "{} device(s) awaiting authorization, {} answered since the scan",
            pending.len() - granted.len(),
            granted.len()
        );
    }
    Ok(())
}

/// Scans and fast-connects when nothing is connected yet.
fn connected_fleet(state: &AppState, cancel: &CancelToken, trace_id: &str) -> Result<Vec<String>> {
    let mut ids = state.registry.connected_ids();
    if ids.is_empty() {
        state.registry.scan(trace_id)?;
        state
            .orchestrator
            .connect_all(true, None, cancel, trace_id, |_| {})?;
        ids = state.registry.connected_ids();
    }
    if ids.is_empty() {
        bail!("no connected devices");
    }
    Ok(ids)
}

fn print_summary(summary: &ConnectSummary) {
    println!(
        "connected {}/{} in {:.1}s",
        summary.connected, summary.total, summary.elapsed_secs
    );
    for serial in &summary.failed {
        let reason = summary
            .results
            .get(serial)
            .and_then(|result| result.error.as_deref())
            .unwrap_or("unknown error");
        println!("  failed {serial}: {reason}");
    }
}

fn outcome_text(success: bool, skipped: bool, error: Option<&str>) -> String {
    match (success, skipped) {
        (_, true) => format!("skipped: {}", error.unwrap_or("nothing to do")),
        (true, false) => "ok".to_string(),
        (false, false) => format!("failed: {}", error.unwrap_or("unknown error")),
    }
}

fn print_counts<T>(label: &str, results: &BatchResults<T>) {
    let counts = BatchCounts::from_results(results);
    println!(
        "{label}: {} succeeded, {} failed, {} skipped",
        counts.succeeded, counts.failed, counts.skipped
    );
}
