//! Command surface for the streak engine.
//!
//! - [`run_cli`] executes a fully parsed [`Cli`].
//! - `sk watch` hosts the live evaluator and the periodic sweeper as two
//!   cooperative tasks on one current-thread runtime. They share no memory
//!   and only meet at the history file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use streak_kernel_core::{
    format_sequence, format_unix_ms, ActiveRunEvent, StreakRecord, StreakRuleset,
};
use streak_kernel_store_json::{sweep_once, JsonHistoryFile, LiveEvaluator, LoadStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const NOTIFY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "Streak Kernel CLI")]
pub struct Cli {
    #[arg(long, env = "STREAK_HISTORY_PATH", default_value = "./streak_history.json")]
    history: PathBuf,

    /// Ruleset JSON file overriding the built-in v1 ruleset.
    #[arg(long)]
    ruleset: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Evaluate(EvaluateArgs),
    Watch(WatchArgs),
    Sweep(SweepArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Ruleset {
        #[command(subcommand)]
        command: RulesetCommand,
    },
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Newest-first outcome values, separated by commas or whitespace.
    #[arg(long, allow_hyphen_values = true)]
    window: String,
    #[command(flatten)]
    notify: NotifyArgs,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    notify: NotifyArgs,
    #[arg(long, default_value_t = 1000)]
    sweep_interval_ms: u64,
    #[arg(long)]
    no_sweep: bool,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    #[arg(long)]
    once: bool,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[derive(Debug, Clone, Default, Args)]
pub struct NotifyArgs {
    #[arg(long, env = "STREAK_TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_bot_token: Option<String>,
    #[arg(long, env = "STREAK_TELEGRAM_CHAT_ID")]
    telegram_chat_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(HistoryListArgs),
    Clear,
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    /// Only show streaks of exactly this length.
    #[arg(long)]
    length: Option<usize>,
    /// Defaults to the ruleset display limit.
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetCommand {
    Show,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the ruleset cannot be loaded, the window input is
/// malformed, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.log_json);
    let ruleset = load_ruleset(cli.ruleset.as_deref())?;

    match cli.command {
        Command::Evaluate(args) => run_evaluate(&args, &cli.history, ruleset),
        Command::Watch(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build watch runtime")?;
            runtime.block_on(run_watch(args, cli.history, ruleset))
        }
        Command::Sweep(args) => run_sweep(&args, &cli.history),
        Command::History { command } => match command {
            HistoryCommand::List(args) => run_history_list(&args, &cli.history, &ruleset),
            HistoryCommand::Clear => {
                let report = clear_history(&cli.history)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        },
        Command::Ruleset { command } => match command {
            RulesetCommand::Show => {
                println!("{}", serde_json::to_string_pretty(&ruleset)?);
                Ok(())
            }
        },
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct HistoryClearReport {
    path: String,
    removed: bool,
}

fn clear_history(history: &Path) -> Result<HistoryClearReport> {
    let file = JsonHistoryFile::new(history);
    let removed = file.remove()?;
    info!(path = %file.path().display(), removed, "cleared streak history");
    Ok(HistoryClearReport {
        path: file.path().display().to_string(),
        removed,
    })
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // Already installed when embedded in a host that set up its own subscriber.
    if let Err(err) = result {
        debug!(error = %err, "tracing subscriber already initialized");
    }
}

fn load_ruleset(path: Option<&Path>) -> Result<StreakRuleset> {
    let Some(path) = path else {
        return Ok(StreakRuleset::v1());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read ruleset file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("ruleset file {} is not valid JSON", path.display()))?;
    StreakRuleset::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
}

/// Parses a newest-first window such as `"3, 3, 14 3"`.
///
/// # Errors
/// Returns an error when any token is not a non-negative integer.
pub fn parse_window(raw: &str) -> Result<Vec<u32>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<u32>()
                .with_context(|| format!("invalid outcome value in window: {token:?}"))
        })
        .collect()
}

fn run_evaluate(args: &EvaluateArgs, history: &Path, ruleset: StreakRuleset) -> Result<()> {
    let window = parse_window(&args.window)?;
    let notifier = build_notifier(&args.notify)?;
    let mut evaluator = LiveEvaluator::new(ruleset, history)?;
    let report = evaluator.evaluate(&window);

    for event in &report.events {
        deliver(notifier.as_ref(), event);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_watch(args: WatchArgs, history: PathBuf, ruleset: StreakRuleset) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::from(build_notifier(&args.notify)?);
    let mut evaluator = LiveEvaluator::new(ruleset, &history)?;
    let sweeper_file = JsonHistoryFile::new(&history);
    let period = Duration::from_millis(args.sweep_interval_ms.max(1));

    info!(
        path = %history.display(),
        sweep = !args.no_sweep,
        sweep_interval_ms = args.sweep_interval_ms,
        notifier = notifier.name(),
        "watching window stream on stdin"
    );

    let sweeper = async {
        if args.no_sweep {
            std::future::pending::<()>().await;
        } else {
            run_sweeper(&sweeper_file, period).await;
        }
    };

    tokio::select! {
        result = evaluate_stream(&mut evaluator, &notifier) => result,
        () = sweeper => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupted; stopping watch");
            Ok(())
        }
    }
}

async fn evaluate_stream(evaluator: &mut LiveEvaluator, notifier: &Arc<dyn Notifier>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read window from stdin")?
    {
        let window = match parse_window(&line) {
            Ok(window) => window,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "skipping malformed window line");
                continue;
            }
        };

        let report = evaluator.evaluate(&window);
        println!("{}", serde_json::to_string(&report)?);

        for event in report.events {
            let notifier = Arc::clone(notifier);
            // Fire and forget: delivery is at most once and never blocks detection.
            drop(tokio::task::spawn_blocking(move || {
                deliver(notifier.as_ref(), &event);
            }));
        }
    }

    info!("window stream closed");
    Ok(())
}

async fn run_sweeper(file: &JsonHistoryFile, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match sweep_once(file) {
            Ok(report) if report.status == LoadStatus::Unreadable => {
                debug!(path = %file.path().display(), "history unreadable; sweep skipped");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "sweep failed; history left unchanged");
            }
        }
    }
}

fn run_sweep(args: &SweepArgs, history: &Path) -> Result<()> {
    let file = JsonHistoryFile::new(history);
    if args.once {
        let report = sweep_once(&file)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build sweeper runtime")?;
    let period = Duration::from_millis(args.interval_ms.max(1));
    info!(path = %file.path().display(), interval_ms = args.interval_ms, "sweeper started");

    runtime.block_on(async {
        tokio::select! {
            () = run_sweeper(&file, period) => Ok(()),
            signal = tokio::signal::ctrl_c() => signal
                .context("failed to listen for ctrl-c")
                .map(|()| info!("interrupted; stopping sweeper")),
        }
    })
}

fn run_history_list(args: &HistoryListArgs, history: &Path, ruleset: &StreakRuleset) -> Result<()> {
    let report = JsonHistoryFile::new(history).load();
    if report.status == LoadStatus::Unreadable {
        return Err(anyhow!(
            "history file {} is not a valid streak history",
            history.display()
        ));
    }

    let limit = args.limit.unwrap_or(ruleset.display_limit);
    let selected = select_history(&report.records, args.length, limit);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&selected)?);
    } else {
        print_history_table(&selected)?;
    }
    Ok(())
}

/// Newest-first records, optionally filtered to one exact length, capped at
/// `limit`.
#[must_use]
pub fn select_history(
    records: &[StreakRecord],
    length: Option<usize>,
    limit: usize,
) -> Vec<StreakRecord> {
    records
        .iter()
        .filter(|record| length.is_none() || length == Some(record.length))
        .take(limit)
        .cloned()
        .collect()
}

fn print_history_table(records: &[StreakRecord]) -> Result<()> {
    println!(
        "{:<24} {:<5} {:<6} sequence",
        "recorded_at", "group", "length"
    );
    println!("{}", "-".repeat(80));
    for record in records {
        println!(
            "{:<24} {:<5} {:<6} {}",
            format_unix_ms(record.timestamp).map_err(|err| anyhow!(err.to_string()))?,
            record.group,
            record.length,
            format_sequence(&record.sequence)
        );
    }
    Ok(())
}

/// Delivers active-run events to an operator channel.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends one message.
    ///
    /// # Errors
    /// Returns an error when the channel rejects the message or is
    /// unreachable.
    fn notify(&self, event: &ActiveRunEvent) -> Result<()>;
}

/// Stand-in used when no channel is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, event: &ActiveRunEvent) -> Result<()> {
        info!(
            kind = ?event.kind,
            group = %event.group,
            length = event.length,
            "notification channel not configured; event logged only"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    agent: ureq::Agent,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    #[must_use]
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS))
            .build();
        Self {
            agent,
            endpoint: format!("{TELEGRAM_API_BASE}/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
        }
    }
}

impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn notify(&self, event: &ActiveRunEvent) -> Result<()> {
        let payload = telegram_payload(&self.chat_id, event);
        let response = self
            .agent
            .post(&self.endpoint)
            .set("content-type", "application/json")
            .send_json(&payload);

        match response {
            Ok(response) => {
                let body: Value = response
                    .into_json()
                    .context("telegram response was not valid JSON")?;
                if body.get("ok").and_then(Value::as_bool) == Some(true) {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "telegram rejected message: {}",
                        body.get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("no description")
                    ))
                }
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!("telegram http status {code}: {body}"))
            }
            // Transport errors can echo the URL, which carries the bot token.
            Err(ureq::Error::Transport(err)) => Err(anyhow!(
                "telegram transport failure: {}",
                err.kind()
            )),
        }
    }
}

#[must_use]
pub fn telegram_payload(chat_id: &str, event: &ActiveRunEvent) -> Value {
    json!({
        "chat_id": chat_id,
        "text": event.message(),
    })
}

/// Picks the notification channel from the configured credentials.
///
/// # Errors
/// Returns an error when only one of token and chat id is set.
pub fn build_notifier(args: &NotifyArgs) -> Result<Box<dyn Notifier>> {
    let token = args.telegram_bot_token.as_deref().filter(|value| !value.is_empty());
    let chat_id = args.telegram_chat_id.as_deref().filter(|value| !value.is_empty());

    match (token, chat_id) {
        (Some(token), Some(chat_id)) => Ok(Box::new(TelegramNotifier::new(token, chat_id))),
        (None, None) => Ok(Box::new(LogNotifier)),
        _ => Err(anyhow!(
            "telegram notifications need both --telegram-bot-token and --telegram-chat-id"
        )),
    }
}

fn deliver(notifier: &dyn Notifier, event: &ActiveRunEvent) {
    match notifier.notify(event) {
        Ok(()) => debug!(
            notifier = notifier.name(),
            kind = ?event.kind,
            length = event.length,
            "notification delivered"
        ),
        Err(err) => warn!(
            notifier = notifier.name(),
            kind = ?event.kind,
            length = event.length,
            error = %format!("{err:#}"),
            "notification failed; not retried"
        ),
    }
}
