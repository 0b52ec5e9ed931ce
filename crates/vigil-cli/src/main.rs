//! `vigil-cli` – operator entry point for the Vigil safety core.
//!
//! The `vigil` binary:
//!
//! 1. Loads `~/.vigil/config.toml`, writing the defaults on first run.
//! 2. Opens the SQLite journal and starts the [`Orchestrator`] against a
//!    simulated site.
//! 3. Drops the operator into an **interactive REPL** (`/status`, `/slew`,
//!    `/park`, `/open`, `/estop`, ...).
//! 4. Intercepts **Ctrl-C** to park the mount, close the roof and exit. A
//!    second Ctrl-C exits immediately.

mod config;
mod repl;

use colored::Colorize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use vigil_hal::sim::SimSite;
use vigil_hal::{AlertSink, LogAlertSink};
use vigil_memory::Journal;
use vigil_runtime::{Orchestrator, SafingReport, init_tracing};
use vigil_types::EmergencyStage;

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG filters (default "info"); VIGIL_LOG_FORMAT=json switches to
    // JSON lines. User-facing output stays on println!.
    let _tracing = init_tracing("vigil");

    print_banner();

    let cfg = load_config();
    let site = SimSite::new();
    let journal = open_journal(&cfg.journal_path());
    let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];

    let orchestrator =
        match Orchestrator::start(cfg.orchestrator_config(), site.registry(), journal, sinks) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                println!("{}: {}", "Failed to start the safety core".red().bold(), e);
                return ExitCode::FAILURE;
            }
        };
    println!(
        "  Site {} online – stage {}, verdict {}",
        cfg.site_name.bold(),
        orchestrator.stage().to_string().yellow(),
        orchestrator.verdict().level()
    );
    announce_stage_changes(&orchestrator);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            println!("{}", "\n  Second Ctrl-C – exiting without safing.".red().bold());
            std::process::exit(130);
        }
        let _ = shutdown_tx.send(());
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use /quit to shut down safely");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let (line_tx, mut line_rx) = mpsc::channel(1);
    std::thread::spawn(move || repl::read_lines(line_tx));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            input = line_rx.recv() => match input {
                Some(repl::Input::Line { text, done }) => {
                    let flow = repl::dispatch(&orchestrator, &site, &text).await;
                    let _ = done.send(());
                    if flow == repl::Flow::Quit {
                        break;
                    }
                }
                Some(repl::Input::Interrupted) | Some(repl::Input::Eof) | None => break,
            },
        }
    }

    println!();
    println!("{}", "⚠  Shutting down – parking and closing …".yellow().bold());
    let report = orchestrator.shutdown(true).await;
    print_report(report)
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn first_run() -> config::Config {
    println!();
    println!("  No configuration found. Writing defaults.");
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    let mut cfg = cfg;
    config::apply_env_overrides(&mut cfg);
    cfg
}

/// Without a journal the core still runs; only crash recovery is lost.
fn open_journal(path: &Path) -> Option<Journal> {
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(path = %parent.display(), error = %e, "cannot create journal directory");
    }
    match Journal::open(path) {
        Ok(journal) => {
            println!("  Journal at {}", path.display().to_string().bold());
            Some(journal)
        }
        Err(e) => {
            println!(
                "  {} journal unavailable ({}); running without crash recovery",
                "⚠".yellow(),
                e
            );
            None
        }
    }
}

fn announce_stage_changes(orchestrator: &Orchestrator) {
    let mut stage_rx = orchestrator.watch_stage();
    tokio::spawn(async move {
        while stage_rx.changed().await.is_ok() {
            let stage = *stage_rx.borrow_and_update();
            let label = stage.to_string();
            let label = match stage {
                EmergencyStage::Warning => label.yellow(),
                _ => label.red().bold(),
            };
            println!("\n  {} emergency stage {}", "⚠".yellow(), label);
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: SafingReport) -> ExitCode {
    let mark = |ok: bool| if ok { "✓".green() } else { "✗".red() };
    println!("  {} mount parked", mark(report.parked));
    println!("  {} roof closed", mark(report.closed));
    if report.parked && report.closed {
        println!("{}", "  ✓ Observatory safe. Exiting Vigil.".green());
        ExitCode::SUCCESS
    } else {
        println!("{}", "  ✗ Observatory NOT safe – check the site.".red().bold());
        ExitCode::FAILURE
    }
}

fn print_banner() {
    println!();
    println!("{}", r#" _   __ _       _  __ "#.bold().cyan());
    println!("{}", r#"| | / /(_)___ _(_)/ / "#.bold().cyan());
    println!("{}", r#"| |/ // / __ `/ // /  "#.bold().cyan());
    println!("{}", r#"|___//_/\_, /_//_/   "#.bold().cyan());
    println!("{}", r#"       /___/          "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Vigil".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Observatory safety and control core");
    println!();
}
