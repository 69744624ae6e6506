use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_core::config::Logs;
use courier_core::impls::{AmqpLink, HttpReporter};
use courier_core::{CommandStrategy, Dispatcher, Runner, Settings};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Consume a RabbitMQ queue and run a command for every message", long_about = None)]
struct Args {
    /// Path to the INI configuration file
    #[arg(short = 'c', long)]
    configuration: PathBuf,

    /// Command line to run per message; the base64 payload is appended
    #[arg(short = 'e', long)]
    executable: Option<String>,

    /// POST each payload to this URL instead of running a process
    #[arg(long)]
    url: Option<String>,

    /// Content-Type for --url requests
    #[arg(long)]
    content_type: Option<String>,

    /// Deliveries are zlib-compressed
    #[arg(long)]
    compression: bool,

    /// Also log to stdout
    #[arg(short = 'V', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = Settings::load(&args.configuration)?;
    let _guards = init_logging(&settings.logs, args.verbose)?;

    let strategy = choose_strategy(&args, &settings)?;
    info!(?strategy, "command strategy");

    let runner = if settings.logs.rpc.is_empty() {
        Runner::new()
    } else {
        Runner::with_sink(Arc::new(HttpReporter::new(&settings.logs.rpc)?))
    };

    let link = AmqpLink::connect(&settings).await?;

    let mut builder = Dispatcher::builder(link.queue(), strategy.into_factory()?, runner)
        .compression(args.compression || settings.rabbitmq.compression)
        .on_malformed_retry_header(settings.worker.on_malformed_retry_header);
    if settings.dead_letter_enabled() {
        builder = builder.dead_letter(settings.deadexchange.retry, Arc::new(link.publisher().await?));
    }
    let dispatcher = builder.build();
    let source = link.subscribe().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                shutdown_tx.closed().await;
            }
        }
    });

    let result = dispatcher.run_until(source, shutdown_rx).await;
    info!(stats = ?dispatcher.stats(), "worker stopped");
    link.close().await;
    result?;
    Ok(())
}

/// `--url` (or `[http] url`) selects HTTP, otherwise `--executable` is run.
fn choose_strategy(args: &Args, settings: &Settings) -> anyhow::Result<CommandStrategy> {
    let url = args
        .url
        .clone()
        .or_else(|| (!settings.http.url.is_empty()).then(|| settings.http.url.clone()));
    if let Some(url) = url {
        let content_type = args
            .content_type
            .clone()
            .unwrap_or_else(|| settings.http.content_type.clone());
        return Ok(CommandStrategy::Http { url, content_type });
    }

    let line = args
        .executable
        .as_deref()
        .context("either --executable or --url is required")?;
    CommandStrategy::process_from_line(line).context("--executable must name a program")
}

/// Info destination gets INFO and above, error destination ERROR only. An
/// empty path falls back to stdout/stderr.
fn init_logging(logs: &Logs, verbose: bool) -> anyhow::Result<Vec<WorkerGuard>> {
    let (info_writer, info_guard) = writer(&logs.info, Fallback::Stdout)?;
    let (error_writer, error_guard) = writer(&logs.error, Fallback::Stderr)?;
    let console = (verbose && !logs.info.is_empty()).then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(info_writer)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(error_writer)
                .with_filter(LevelFilter::ERROR),
        )
        .with(console)
        .try_init()?;

    Ok(vec![info_guard, error_guard])
}

enum Fallback {
    Stdout,
    Stderr,
}

fn writer(path: &str, fallback: Fallback) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    if path.is_empty() {
        return Ok(match fallback {
            Fallback::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            Fallback::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {path}"))?;
    Ok(tracing_appender::non_blocking(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["courier", "-c", "courier.ini"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.apply_defaults();
        s
    }

    #[test]
    fn executable_line_is_split() {
        let strategy = choose_strategy(&args(&["-e", "php consume.php --env prod"]), &settings()).unwrap();
        assert_eq!(
            strategy,
            CommandStrategy::Process {
                program: "php".into(),
                args: vec!["consume.php".into(), "--env".into(), "prod".into()],
            }
        );
    }

    #[test]
    fn url_wins_over_executable() {
        let strategy = choose_strategy(
            &args(&["-e", "php consume.php", "--url", "http://svc/hook"]),
            &settings(),
        )
        .unwrap();
        assert_eq!(
            strategy,
            CommandStrategy::Http {
                url: "http://svc/hook".into(),
                content_type: "application/json".into(),
            }
        );
    }

    #[test]
    fn url_from_settings_with_flag_content_type() {
        let mut s = settings();
        s.http.url = "http://svc/from-config".into();
        let strategy = choose_strategy(&args(&["--content-type", "text/plain"]), &s).unwrap();
        assert_eq!(
            strategy,
            CommandStrategy::Http {
                url: "http://svc/from-config".into(),
                content_type: "text/plain".into(),
            }
        );
    }

    #[test]
    fn nothing_to_run_is_an_error() {
        assert!(choose_strategy(&args(&[]), &settings()).is_err());
        assert!(choose_strategy(&args(&["-e", "   "]), &settings()).is_err());
    }

    #[test]
    fn flags_parse() {
        let a = args(&["--compression", "-V", "-e", "true"]);
        assert!(a.compression);
        assert!(a.verbose);
    }
}
