use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttlegate::clock::system_clock;
use throttlegate::config::EngineSettings;
use throttlegate::ratelimit::{
    Direction, FileConfigSource, RequestProxy, ThrottleConfig, Throttler, Verdict,
};

#[derive(Parser, Debug)]
#[command(name = "throttlegate", version, about = "Distributed request throttling engine")]
struct Cli {
    /// Engine settings file (YAML)
    #[arg(short, long, global = true)]
    settings: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a request against the configured rules
    Check(CheckArgs),
    /// Parse and compile a rules file
    Validate {
        /// Rules file; defaults to `rules_path` from the settings
        #[arg(short, long)]
        rules: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Rules file; defaults to `rules_path` from the settings
    #[arg(short, long)]
    rules: Option<String>,

    /// HTTP method of the request
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request URI
    #[arg(short, long)]
    uri: String,

    /// Request header as `name=value`; may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Evaluate the request this many times
    #[arg(short = 'n', long, default_value_t = 1)]
    repeat: u32,

    /// Keep semaphore slots until the end of the run instead of after each request
    #[arg(long)]
    hold: bool,

    /// Treat the request as an outgoing call
    #[arg(long)]
    egress: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=').or_else(|| raw.split_once(':')) {
        Some((name, value)) => Ok((name.trim().to_string(), value.trim().to_string())),
        None => Err(format!("expected name=value, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let settings = EngineSettings::load(cli.settings.as_deref())?;

    match cli.command {
        Command::Check(args) => check(settings, args).await,
        Command::Validate { rules } => validate(&settings, rules),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn rules_path(settings: &EngineSettings, rules: Option<String>) -> anyhow::Result<String> {
    match rules.or_else(|| settings.rules_path.clone()) {
        Some(path) => Ok(path),
        None => bail!("no rules file given; pass --rules or set rules_path in the settings"),
    }
}

fn validate(settings: &EngineSettings, rules: Option<String>) -> anyhow::Result<()> {
    let path = rules_path(settings, rules)?;
    let snapshot = ThrottleConfig::from_file(&path)?
        .compile()
        .with_context(|| format!("invalid rules in {}", path))?;

    println!("unique_name: {}", snapshot.unique_name);
    for rule in &snapshot.rules {
        println!(
            "  {} -> {} (max delay {}s)",
            rule.display_name(),
            rule.method.cache_key_fragment(),
            rule.max_delay_seconds
        );
    }
    println!("whitelist entries: {}", snapshot.whitelist.len());
    Ok(())
}

async fn check(settings: EngineSettings, args: CheckArgs) -> anyhow::Result<()> {
    let path = rules_path(&settings, args.rules)?;
    let shutdown = CancellationToken::new();
    let clock = system_clock();

    let mut source = FileConfigSource::new(&path);
    if let Some(name) = &settings.unique_name {
        source = source.with_default_unique_name(name.clone());
    }

    let store = settings.open_store(clock.clone(), &shutdown).await?;
    let direction = if args.egress {
        Direction::Egress
    } else {
        Direction::Ingress
    };
    let throttler = Arc::new(
        Throttler::builder(direction)
            .store(store)
            .source(Arc::new(source))
            .clock(clock)
            .delay_poll_interval(settings.delay_poll_interval())
            .build()
            .await,
    );
    if throttler.snapshot().rules.is_empty() {
        warn!(path = %path, "No throttling rules in effect");
    }
    if let Some(interval) = settings.reload_interval() {
        throttler.clone().spawn_reload(interval, shutdown.clone());
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let mut request = RequestProxy::parse(&args.method, &args.uri)?;
    for (name, value) in &args.headers {
        request = request.with_header(name, value)?;
    }

    let mut held = Vec::new();
    for attempt in 1..=args.repeat {
        if shutdown.is_cancelled() {
            break;
        }
        let evaluation = throttler.check(&request, &shutdown).await?;
        match &evaluation.verdict {
            Verdict::Exceeded(result) => println!(
                "#{} exceeded status={} retry_after={}s rule={}",
                attempt,
                result.status_code,
                result.retry_after_seconds,
                result
                    .rule
                    .as_ref()
                    .map(|r| r.display_name())
                    .unwrap_or_default()
            ),
            verdict => println!("#{} {}", attempt, verdict),
        }

        if args.hold {
            held.push(evaluation);
        } else {
            evaluation.release().await;
        }
        // Let deferred releases and reloads make progress between attempts
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for evaluation in held {
        evaluation.release().await;
    }
    shutdown.cancel();
    info!("Done");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
