use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Map;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use loggoblin_logs::{
    BackpressurePolicy, Multiplexer, Normalizer, RuleStore, Scrollback, Severity, SourceReader,
    SourceSpec,
};

mod config;
mod output;

use config::Config;
use output::{Presenter, shared_preamble};

/// loggob - Tail, merge and filter several log sources into one stream
#[derive(Parser, Debug)]
#[command(name = "loggob")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File path, `-` for stdin, or `!command` to read a command's output
    #[arg(value_name = "SOURCE", required = true)]
    sources: Vec<String>,

    /// Filter rule, e.g. `exclude severity<WARN` or `include /timeout/i` (repeatable, in order)
    #[arg(short = 'r', long = "rule", value_name = "RULE", allow_hyphen_values = true)]
    rules: Vec<String>,

    /// Hide records below this severity
    #[arg(short = 'm', long, value_name = "LEVEL")]
    min_severity: Option<String>,

    /// Number of entries kept for re-filtering
    #[arg(short = 'k', long, value_name = "K")]
    scrollback: Option<usize>,

    /// What to do when a source outpaces the output: block, drop-oldest or sample
    #[arg(long, value_name = "POLICY")]
    backpressure: Option<BackpressurePolicy>,

    /// JSON keys to move to the front of the body
    #[arg(long, value_name = "KEYS", value_delimiter = ',')]
    zoom: Vec<String>,

    /// Start tailing files at their end
    #[arg(long)]
    from_end: bool,

    /// Configuration file (default: ~/.config/loggoblin/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also print records the rules exclude
    #[arg(long)]
    show_excluded: bool,

    /// Print raw lines instead of normalized bodies
    #[arg(long)]
    raw: bool,

    /// Show timestamps in UTC instead of local time
    #[arg(long)]
    utc: bool,

    /// Leave JSON fields that are the same in every record out of the body
    /// and print them once as a `<SHARED>` line
    #[arg(long)]
    elide_shared: bool,

    /// Verbose diagnostics on stderr
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Diagnostics go to stderr, records to stdout
    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    };

    // A stdin read in progress blocks its thread until input arrives
    runtime.shutdown_background();
    code
}

/// Apply command line overrides on top of the configuration file
fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(capacity) = args.scrollback {
        config.scrollback.capacity = capacity;
    }
    if let Some(policy) = args.backpressure {
        config.multiplexer.backpressure = policy;
    }
    if !args.zoom.is_empty() {
        config.normalizer.zoom = args.zoom.clone();
    }
    if args.from_end {
        config.reader.start_at_end = true;
    }
    config
}

/// Rules in priority order: minimum severity, configuration file, command line
fn rule_exprs(config_rules: &[String], args: &Args) -> Result<Vec<String>> {
    let mut exprs = Vec::with_capacity(config_rules.len() + args.rules.len() + 1);

    if let Some(level) = &args.min_severity {
        let Some(severity) = Severity::from_keyword(level) else {
            bail!("unknown severity '{}'", level);
        };
        exprs.push(format!("exclude severity<{severity}"));
    }

    exprs.extend(config_rules.iter().cloned());
    exprs.extend(args.rules.iter().cloned());
    Ok(exprs)
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = apply_overrides(Config::load(args.config.as_deref())?, &args);

    let normalizer = Arc::new(
        Normalizer::with_config(&config.normalizer).context("invalid normalizer pattern")?,
    );
    let rules = Arc::new(
        RuleStore::from_exprs(rule_exprs(&config.rules, &args)?).context("invalid filter rule")?,
    );
    let scrollback = Scrollback::new(config.scrollback.capacity);

    let mut mux = Multiplexer::new(
        config.multiplexer.clone(),
        Arc::clone(&normalizer),
        Arc::clone(&rules),
    );
    let mut health = mux.subscribe_health();

    for source in &args.sources {
        let spec = SourceSpec::parse(source);
        let reader = SourceReader::open(&spec, config.reader.clone())
            .await
            .with_context(|| format!("cannot open source '{}'", spec))?;
        mux.register(reader);
    }

    let presenter = Presenter {
        show_excluded: args.show_excluded,
        raw: args.raw,
        highlight: io::stdout().is_terminal(),
        utc: args.utc,
    };

    let handle = mux.handle();
    let mut hangup = Hangup::new()?;
    let mut stopping = false;
    let mut shared = Map::new();
    let mut stdout = io::stdout().lock();

    loop {
        tokio::select! {
            entry = mux.next() => {
                let Some(entry) = entry else { break };
                let entry = scrollback.append(entry);

                let mut lines = Vec::with_capacity(2);
                if args.elide_shared {
                    if let Some(preamble) = shared_preamble(&mut shared, scrollback.shared_fields()) {
                        lines.push(preamble);
                    }
                }
                let formatted = if args.elide_shared && entry.record.is_json && !shared.is_empty() {
                    let body = normalizer.json_body(&entry.record.fields, &shared);
                    presenter.format_body(&entry, &body)
                } else {
                    presenter.format(&entry)
                };
                lines.extend(formatted);
                if lines.is_empty() {
                    continue;
                }

                if let Err(e) = lines.iter().try_for_each(|line| writeln!(stdout, "{}", line)) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        debug!("stdout closed");
                        handle.shutdown().await;
                        return Ok(ExitCode::SUCCESS);
                    }
                    return Err(e).context("failed to write output");
                }
            }

            event = health.recv() => match event {
                Ok(event) => eprintln!("loggob: {}: {}", event.tag, event.health),
                Err(RecvError::Lagged(missed)) => warn!(missed, "health events dropped"),
                Err(RecvError::Closed) => {}
            },

            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("interrupted, closing sources");
                stopping = true;
                let handle = handle.clone();
                tokio::spawn(async move { handle.shutdown().await });
            }

            _ = hangup.recv() => {
                if let Err(e) = reload(args.config.as_deref(), &args, &rules, &scrollback) {
                    warn!("reload failed, keeping current rules: {:#}", e);
                }
            }
        }
    }

    let counts = scrollback.severity_counts();
    info!(
        visible = counts.total(),
        errors = counts.error + counts.fatal,
        dropped = mux.dropped_count(),
        "all sources closed"
    );

    if let Some(e) = mux.close_reason() {
        eprintln!("Error: {}", e);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Re-read the rules from the configuration file and re-filter the scrollback
fn reload(
    path: Option<&Path>,
    args: &Args,
    rules: &RuleStore,
    scrollback: &Scrollback,
) -> Result<()> {
    let config = Config::load(path)?;
    let set = rules
        .install(rule_exprs(&config.rules, args)?)
        .context("invalid filter rule")?;
    let changed = scrollback.reevaluate(set);
    info!(changed, "reloaded rules");
    Ok(())
}

/// SIGHUP listener
#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self(
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
        ))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("loggob").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_sources_are_required() {
        assert!(Args::try_parse_from(["loggob"]).is_err());
    }

    #[test]
    fn test_rule_order() {
        let args = args(&["-m", "warn", "-r", "include /db/", "--rule", "- tag:stdin", "app.log"]);
        let exprs = rule_exprs(&["exclude /health/".to_string()], &args).unwrap();
        assert_eq!(
            exprs,
            vec!["exclude severity<WARN", "exclude /health/", "include /db/", "- tag:stdin"]
        );
        assert!(RuleStore::from_exprs(&exprs).is_ok());
    }

    #[test]
    fn test_unknown_min_severity() {
        let args = args(&["-m", "loud", "app.log"]);
        assert!(rule_exprs(&[], &args).is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = args(&[
            "-k",
            "50",
            "--backpressure",
            "drop-oldest",
            "--zoom",
            "level,msg",
            "--from-end",
            "-",
            "!journalctl -f",
        ]);
        assert_eq!(args.sources, vec!["-", "!journalctl -f"]);

        let config = apply_overrides(Config::default(), &args);
        assert_eq!(config.scrollback.capacity, 50);
        assert_eq!(config.multiplexer.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(config.normalizer.zoom, vec!["level", "msg"]);
        assert!(config.reader.start_at_end);
    }

    #[test]
    fn test_config_values_survive_without_flags() {
        let config = Config::parse("[scrollback]\ncapacity = 7\n").unwrap();
        let config = apply_overrides(config, &args(&["app.log"]));
        assert_eq!(config.scrollback.capacity, 7);
        assert!(!config.reader.start_at_end);
    }

    #[test]
    fn test_bad_policy_is_rejected() {
        assert!(Args::try_parse_from(["loggob", "--backpressure", "shed", "a.log"]).is_err());
    }
}
