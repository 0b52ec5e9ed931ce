//! REPL – operator shell for a running safety core.
//!
//! Supported slash-commands:
//!   /help                          – show this list
//!   /status                        – verdict, emergency stage, services, queue
//!   /slew <ra_h> <dec> <alt> <ha> [name] – slew the mount
//!   /park | /unpark [--confirm]    – mount park state
//!   /open [--confirm] | /close     – enclosure roof
//!   /stop                          – controlled stop of the mount
//!   /estop                         – emergency stop of every moving device
//!   /cancel <id|all>               – cancel queued or running commands
//!   /session [start [id] | end [--no-park] [--no-close]]
//!   /force <park|close|shutdown>   – push the emergency responder forward
//!   /sim <what> <value>            – drive the simulated site
//!   /quit | /exit                  – safe shutdown and exit
//!
//! Line editing runs on a dedicated thread (`rustyline` blocks); each line
//! is handed to the async side and the editor waits until it has been
//! handled so output never interleaves with the prompt.

use colored::Colorize;
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Context, Editor, Helper, Highlighter, Hinter, Validator};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use vigil_hal::sim::SimSite;
use vigil_runtime::Orchestrator;
use vigil_types::{
    CommandKind, CommandOutcome, CommandRequest, EmergencyStage, EquatorialCoords, Priority,
    ReconciledState, ServiceKind, SlewTarget,
};

const COMMANDS: [&str; 16] = [
    "/help", "/status", "/slew", "/park", "/unpark", "/open", "/close", "/stop", "/estop",
    "/cancel", "/session", "/force", "/sim", "/quit", "/exit", "/history",
];

// ─────────────────────────────────────────────────────────────────────────────
// Line editor thread
// ─────────────────────────────────────────────────────────────────────────────

/// What the editor thread hands to the async side.
pub enum Input {
    Line {
        text: String,
        /// Dropped or sent once the line has been handled.
        done: oneshot::Sender<()>,
    },
    /// Ctrl-C at the prompt.
    Interrupted,
    /// Ctrl-D or a closed terminal.
    Eof,
}

#[derive(Helper, Hinter, Highlighter, Validator)]
struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let head = &line[..pos];
        if head.contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        }
        let matches = COMMANDS
            .iter()
            .filter(|c| c.starts_with(head))
            .map(|c| c.to_string())
            .collect();
        Ok((0, matches))
    }
}

/// Blocking read loop. Returns when the terminal closes, the operator
/// interrupts, or the async side goes away.
pub fn read_lines(tx: mpsc::Sender<Input>) {
    let mut editor: Editor<ReplHelper, DefaultHistory> = match Editor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Line editor unavailable".red(), e);
            let _ = tx.blocking_send(Input::Eof);
            return;
        }
    };
    editor.set_helper(Some(ReplHelper));

    loop {
        match editor.readline("vigil> ") {
            Ok(line) => {
                let text = line.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(text.as_str());
                let (done, handled) = oneshot::channel();
                if tx.blocking_send(Input::Line { text, done }).is_err() {
                    return;
                }
                let _ = handled.blocking_recv();
            }
            Err(ReadlineError::Interrupted) => {
                let _ = tx.blocking_send(Input::Interrupted);
                return;
            }
            Err(ReadlineError::Eof) => {
                let _ = tx.blocking_send(Input::Eof);
                return;
            }
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                let _ = tx.blocking_send(Input::Eof);
                return;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SimAction {
    Wind(f64),
    Humidity(f64),
    Rain(bool),
    RainLine(bool),
    Battery(f64),
    SunAltitude(f64),
    Offline(ServiceKind, bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    Status,
    History,
    Submit { kind: CommandKind, confirmed: bool },
    Cancel(Option<Uuid>),
    SessionShow,
    SessionStart(Option<String>),
    SessionEnd { park: bool, close: bool },
    Force(EmergencyStage),
    Sim(SimAction),
    Quit,
}

/// Whether the shell should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

fn number(arg: Option<&str>, what: &str) -> Result<f64, String> {
    let raw = arg.ok_or_else(|| format!("missing {what}"))?;
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{raw}' is not a valid {what}"))
}

fn on_off(arg: Option<&str>) -> Result<bool, String> {
    match arg {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        Some(other) => Err(format!("expected on/off, got '{other}'")),
        None => Err("expected on/off".to_string()),
    }
}

fn service(arg: Option<&str>) -> Result<ServiceKind, String> {
    let name = arg.ok_or("missing service name")?;
    ServiceKind::ALL
        .into_iter()
        .find(|s| s.as_str() == name)
        .ok_or_else(|| format!("unknown service '{name}'"))
}

pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let (flags, args): (Vec<&str>, Vec<&str>) = words.partition(|w| w.starts_with("--"));
    let arg = |i: usize| args.get(i).copied();
    let confirmed = flags.contains(&"--confirm");
    let submit = |kind: CommandKind| ReplCommand::Submit { kind, confirmed };

    let command = match head {
        "/help" => ReplCommand::Help,
        "/status" => ReplCommand::Status,
        "/history" => ReplCommand::History,
        "/park" => submit(CommandKind::Park),
        "/unpark" => submit(CommandKind::Unpark),
        "/open" => submit(CommandKind::RoofOpen),
        "/close" => submit(CommandKind::RoofClose),
        "/stop" => submit(CommandKind::Stop),
        "/estop" => submit(CommandKind::EmergencyStop),
        "/slew" => {
            let ra_hours = number(arg(0), "right ascension")?;
            let dec_deg = number(arg(1), "declination")?;
            let altitude_deg = number(arg(2), "altitude")?;
            let hour_angle_deg = number(arg(3), "hour angle")?;
            if !(0.0..24.0).contains(&ra_hours) {
                return Err("right ascension must be within 0..24 h".to_string());
            }
            if !(-90.0..=90.0).contains(&dec_deg) {
                return Err("declination must be within -90..90 deg".to_string());
            }
            let name = (args.len() > 4).then(|| args[4..].join(" "));
            submit(CommandKind::Slew(SlewTarget {
                name,
                coords: EquatorialCoords { ra_hours, dec_deg },
                altitude_deg,
                hour_angle_deg,
            }))
        }
        "/cancel" => match arg(0) {
            Some("all") => ReplCommand::Cancel(None),
            Some(id) => ReplCommand::Cancel(Some(
                Uuid::parse_str(id).map_err(|_| format!("'{id}' is not a command id"))?,
            )),
            None => return Err("usage: /cancel <id|all>".to_string()),
        },
        "/session" => match arg(0) {
            None => ReplCommand::SessionShow,
            Some("start") => ReplCommand::SessionStart(arg(1).map(str::to_string)),
            Some("end") => ReplCommand::SessionEnd {
                park: !flags.contains(&"--no-park"),
                close: !flags.contains(&"--no-close"),
            },
            Some(other) => return Err(format!("unknown session action '{other}'")),
        },
        "/force" => match arg(0) {
            Some("park") => ReplCommand::Force(EmergencyStage::Park),
            Some("close") => ReplCommand::Force(EmergencyStage::Close),
            Some("shutdown") => ReplCommand::Force(EmergencyStage::Shutdown),
            _ => return Err("usage: /force <park|close|shutdown>".to_string()),
        },
        "/sim" => ReplCommand::Sim(match arg(0) {
            Some("wind") => SimAction::Wind(number(arg(1), "wind speed")?),
            Some("humidity") => SimAction::Humidity(number(arg(1), "humidity")?),
            Some("rain") => SimAction::Rain(on_off(arg(1))?),
            Some("rainline") => SimAction::RainLine(on_off(arg(1))?),
            Some("battery") => SimAction::Battery(number(arg(1), "battery level")?),
            Some("sun") => SimAction::SunAltitude(number(arg(1), "sun altitude")?),
            Some("offline") => SimAction::Offline(service(arg(1))?, true),
            Some("online") => SimAction::Offline(service(arg(1))?, false),
            _ => {
                return Err(
                    "usage: /sim <wind|humidity|rain|rainline|battery|sun|offline|online> <value>"
                        .to_string(),
                );
            }
        }),
        "/quit" | "/exit" => ReplCommand::Quit,
        other => return Err(format!("Unknown command: '{other}'")),
    };
    Ok(command)
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Handle one line. Errors are printed, never propagated.
pub async fn dispatch(orchestrator: &Orchestrator, site: &SimSite, line: &str) -> Flow {
    let command = match parse(line) {
        Ok(command) => command,
        Err(e) => {
            println!("{} Type {} for available commands.", e.red(), "/help".bold());
            return Flow::Continue;
        }
    };

    match command {
        ReplCommand::Help => cmd_help(),
        ReplCommand::Status => cmd_status(orchestrator),
        ReplCommand::History => cmd_history(orchestrator),
        ReplCommand::Submit { kind, confirmed } => cmd_submit(orchestrator, kind, confirmed),
        ReplCommand::Cancel(id) => cmd_cancel(orchestrator, id),
        ReplCommand::SessionShow => match orchestrator.session() {
            Some(id) => println!("  Session {} is active", id.bold()),
            None => println!("  {}", "No active session".dimmed()),
        },
        ReplCommand::SessionStart(id) => {
            let id = orchestrator.start_session(id);
            println!("{} {}", "✓ Session".green(), id.bold());
        }
        ReplCommand::SessionEnd { park, close } => {
            match orchestrator.end_session(park, close).await {
                Ok(report) => println!(
                    "{} parked: {}, closed: {}",
                    "✓ Session ended –".green(),
                    yes_no(report.parked),
                    yes_no(report.closed)
                ),
                Err(e) => println!("{}: {}", "Error".red(), e),
            }
        }
        ReplCommand::Force(stage) => {
            match orchestrator.force_stage(stage, "operator request").await {
                Ok(()) => println!("{} {}", "⚠  Forcing stage".yellow().bold(), stage),
                Err(e) => println!("{}: {}", "Error".red(), e),
            }
        }
        ReplCommand::Sim(action) => cmd_sim(site, action),
        ReplCommand::Quit => return Flow::Quit,
    }
    Flow::Continue
}

fn cmd_help() {
    println!();
    println!("{}", "Vigil Commands".bold().underline());
    let rows = [
        ("/status", "verdict, emergency stage, services and queue"),
        ("/slew <ra_h> <dec> <alt> <ha> [name]", "slew the mount"),
        ("/park  /unpark --confirm", "park or unpark the mount"),
        ("/open --confirm  /close", "open or close the roof"),
        ("/stop", "controlled mount stop"),
        ("/estop", "emergency stop, cancels everything"),
        ("/cancel <id|all>", "cancel queued or running commands"),
        ("/session [start [id]|end]", "observing session lifecycle"),
        ("/force <park|close|shutdown>", "escalate the emergency responder"),
        ("/history", "recent emergency transitions"),
        ("/sim <what> <value>", "drive the simulated site"),
        ("/quit  /exit", "safe shutdown and exit"),
    ];
    for (cmd, text) in rows {
        println!("  {:<38} – {}", cmd.bold().cyan(), text);
    }
    println!();
}

fn cmd_status(orchestrator: &Orchestrator) {
    let status = orchestrator.status();
    println!("{}", format!("Site {}", status.site_name).bold().underline());
    let level = status.verdict.level().to_string();
    let level = if status.verdict.is_safe() {
        level.green()
    } else {
        level.red()
    };
    println!("  Verdict  : {} ({})", level.bold(), status.verdict.summary());
    println!("  Stage    : {}", status.stage.to_string().yellow());
    if status.rain_holdoff.active {
        println!(
            "  Rain     : {} ({:.0} min before the roof may open)",
            "holding off".yellow(),
            status.rain_holdoff.minutes_remaining
        );
    }
    println!(
        "  Session  : {}",
        status.session.as_deref().unwrap_or("none")
    );
    for (service, state) in &status.services {
        println!("  {:<10}: {}", service.as_str(), state);
    }
    println!(
        "  Queue    : {} pending, {} enqueued, {} dispatched, {} cancelled, {} dropped",
        status.pending_commands,
        status.queue.enqueued,
        status.queue.dispatched,
        status.queue.cancelled,
        status.queue.dropped
    );
    if let Some(event) = status.last_emergency {
        println!(
            "  Last     : {} → {} at {} ({})",
            event.from,
            event.to,
            event.at.format("%H:%M:%S"),
            event.reason
        );
    }
}

fn cmd_history(orchestrator: &Orchestrator) {
    let history = orchestrator.emergency_history();
    if history.is_empty() {
        println!("  {}", "No emergency transitions".dimmed());
        return;
    }
    for event in history {
        let errors = if event.errors.is_empty() {
            String::new()
        } else {
            format!(" [{}]", event.errors.join("; ")).red().to_string()
        };
        println!(
            "  {} {} → {} ({}){}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.from,
            event.to,
            event.reason,
            errors
        );
    }
}

fn cmd_submit(orchestrator: &Orchestrator, kind: CommandKind, confirmed: bool) {
    let mut request = CommandRequest::new(kind, Priority::Interactive, "repl");
    request.confirmed = confirmed;
    match orchestrator.submit(request) {
        Ok(ticket) => {
            println!("  {} {} {}", "→".cyan(), ticket.command, ticket.id.to_string().dimmed());
            tokio::spawn(async move {
                let command = ticket.command;
                let id = ticket.id;
                let outcome = ticket.outcome().await;
                println!("\n  {} {} {}", describe(&outcome), command, id.to_string().dimmed());
            });
        }
        Err(e) => println!("{}: {}", "Rejected".red(), e),
    }
}

fn cmd_cancel(orchestrator: &Orchestrator, id: Option<Uuid>) {
    match id {
        Some(id) if orchestrator.cancel(id) => println!("{} {}", "✓ Cancelled".green(), id),
        Some(id) => println!("{} {}", "No such command".yellow(), id),
        None => {
            let pending = orchestrator.pending();
            let cancelled = pending.iter().filter(|r| orchestrator.cancel(r.id)).count();
            println!("{} {} command(s)", "✓ Cancelled".green(), cancelled);
        }
    }
}

fn cmd_sim(site: &SimSite, action: SimAction) {
    match &action {
        SimAction::Wind(mph) => site.weather.update(|r| {
            r.wind_mph = Some(*mph);
            r.gust_mph = Some(*mph);
        }),
        SimAction::Humidity(pct) => site.weather.update(|r| r.humidity_pct = Some(*pct)),
        SimAction::Rain(raining) => site.weather.update(|r| r.rain = Some(*raining)),
        SimAction::RainLine(raining) => site.enclosure.trigger_rain(*raining),
        SimAction::Battery(pct) => site.power.set_battery(*pct),
        SimAction::SunAltitude(deg) => site.ephemeris.set_sun_altitude(*deg),
        SimAction::Offline(service, offline) => {
            let faults = match service {
                ServiceKind::Mount => &site.mount.faults,
                ServiceKind::Enclosure => &site.enclosure.faults,
                ServiceKind::Weather => &site.weather.faults,
                ServiceKind::Power => &site.power.faults,
                ServiceKind::Ephemeris => &site.ephemeris.faults,
                ServiceKind::Camera => &site.camera.faults,
            };
            faults.set_offline(*offline);
        }
    }
    println!("  {} {:?}", "sim".dimmed(), action);
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn describe(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Completed => "✓ completed".green().to_string(),
        CommandOutcome::Vetoed { reason } => format!("{} ({reason})", "✗ vetoed".red()),
        CommandOutcome::Cancelled => "cancelled".yellow().to_string(),
        CommandOutcome::TimedOut { after_secs, state } => {
            let state = match state {
                Some(ReconciledState::Mount { state }) => format!(", mount {:?}", state.status),
                Some(ReconciledState::Enclosure { state }) => format!(", roof {state:?}"),
                Some(ReconciledState::Camera { reachable: false }) => ", camera not answering".into(),
                Some(ReconciledState::Camera { reachable: true }) | None => String::new(),
            };
            format!("{} after {after_secs} s{state}", "✗ timed out".red())
        }
        CommandOutcome::Failed { error } => format!("{} ({error})", "✗ failed".red()),
    }
}

fn yes_no(value: bool) -> colored::ColoredString {
    if value { "yes".green() } else { "no".red() }
}
