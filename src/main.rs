use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{LimiterRegistry, Sweeper};

/// Admission control driver: reads `<operation> <key>` lines from stdin and
/// writes one JSON decision per line to stdout.
///
/// The key is everything after the first run of whitespace, so keys may
/// themselves contain spaces.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file (built-in limiters when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// One line of driver output.
#[derive(Debug, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum Output<'a> {
    Admitted {
        operation: &'a str,
        key: &'a str,
        remaining: u64,
    },
    Rejected {
        operation: &'a str,
        key: &'a str,
        reason: &'static str,
        retry_after_ms: u64,
    },
    Error {
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    info!("Starting Turnstile admission controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    info!(limiters = config.limiters.len(), "Configuration loaded");

    let registry = Arc::new(config.build_registry()?);
    let stdin = BufReader::new(tokio::io::stdin());
    run(registry, config.sweep.interval(), stdin, tokio::io::stdout()).await
}

/// Serve requests until end of input or a shutdown signal.
///
/// The sweeper is stopped before returning, whether serving succeeded or not.
async fn run<R, W>(
    registry: Arc<LimiterRegistry>,
    sweep_interval: Option<Duration>,
    reader: R,
    writer: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sweeper = sweep_interval.map(|interval| Sweeper::spawn(registry.clone(), interval));

    let result = tokio::select! {
        result = serve(&registry, reader, writer) => result,
        _ = shutdown_signal() => Ok(()),
    };

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }

    info!("Turnstile admission controller stopped");
    result
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;

    // Logs go to stderr so stdout carries only decisions.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Answer admission queries until end of input.
///
/// Lines are read as raw bytes; a line that is not valid UTF-8 gets an error
/// decision and does not stop the loop.
async fn serve<R, W>(
    registry: &LimiterRegistry,
    mut reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let output = match std::str::from_utf8(&buf) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                decide(registry, line)
            }
            Err(e) => {
                warn!(error = %e, "Request line is not valid UTF-8");
                Output::Error {
                    message: format!("request line is not valid UTF-8: {}", e),
                }
            }
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }

    info!("End of input");
    Ok(())
}

fn decide<'a>(registry: &LimiterRegistry, line: &'a str) -> Output<'a> {
    let split = line
        .split_once(char::is_whitespace)
        .map(|(operation, key)| (operation, key.trim_start()));
    let (operation, key) = match split {
        Some((operation, key)) if !key.is_empty() => (operation, key),
        _ => {
            warn!(line = %line, "Malformed request line");
            return Output::Error {
                message: format!("expected '<operation> <key>', got '{}'", line),
            };
        }
    };

    let limiter = match registry.get(operation) {
        Ok(limiter) => limiter,
        Err(e) => {
            warn!(operation = %operation, "Request for unregistered operation");
            return Output::Error {
                message: e.to_string(),
            };
        }
    };

    match limiter.check_limit(key) {
        Ok(admitted) => Output::Admitted {
            operation,
            key,
            remaining: admitted.remaining,
        },
        Err(rejected) => Output::Rejected {
            operation,
            key,
            reason: rejected.reason.as_str(),
            retry_after_ms: rejected.retry_after.as_millis() as u64,
        },
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use turnstile::ratelimit::RateLimitConfig;

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn registry() -> LimiterRegistry {
        LimiterRegistry::new(vec![("login".to_string(), RateLimitConfig::new(1))]).unwrap()
    }

    #[test]
    fn test_decide_admits_then_rejects() {
        let registry = registry();

        let first = serde_json::to_value(decide(&registry, "login alice")).unwrap();
        assert_eq!(first["decision"], "admitted");
        assert_eq!(first["remaining"], 0);

        let second = serde_json::to_value(decide(&registry, "login alice")).unwrap();
        assert_eq!(second["decision"], "rejected");
        assert_eq!(second["reason"], "cooldown-active");
        let retry_after_ms = second["retry_after_ms"].as_u64().unwrap();
        assert!(retry_after_ms > 4000 && retry_after_ms <= 5000);
    }

    #[test]
    fn test_decide_reports_errors() {
        let registry = registry();

        let unknown = serde_json::to_value(decide(&registry, "upload alice")).unwrap();
        assert_eq!(unknown["decision"], "error");

        let malformed = serde_json::to_value(decide(&registry, "login")).unwrap();
        assert_eq!(malformed["decision"], "error");
    }

    #[test]
    fn test_decide_key_may_contain_spaces() {
        let registry = registry();

        let first = serde_json::to_value(decide(&registry, "login  alice smith")).unwrap();
        assert_eq!(first["decision"], "admitted");
        assert_eq!(first["key"], "alice smith");

        // A different key than plain "alice".
        let other = serde_json::to_value(decide(&registry, "login alice")).unwrap();
        assert_eq!(other["decision"], "admitted");
    }

    #[tokio::test]
    async fn test_serve_continues_after_invalid_utf8() {
        let registry = registry();
        let input: &[u8] = b"login alice\n\xff\xfe bob\n\n# comment\nlogin carol";
        let mut output = Vec::new();

        serve(&registry, input, &mut output).await.unwrap();

        let decisions: Vec<serde_json::Value> = output
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[0]["decision"], "admitted");
        assert_eq!(decisions[0]["key"], "alice");
        assert_eq!(decisions[1]["decision"], "error");
        assert_eq!(decisions[2]["decision"], "admitted");
        assert_eq!(decisions[2]["key"], "carol");
    }

    #[tokio::test]
    async fn test_run_stops_sweeper_on_write_error() {
        let registry = Arc::new(registry());
        let input: &[u8] = b"login alice\n";

        let result = run(
            registry.clone(),
            Some(Duration::from_secs(3600)),
            input,
            BrokenPipe,
        )
        .await;

        assert!(result.is_err());
        // The sweep task held the only other reference.
        assert_eq!(Arc::strong_count(&registry), 1);
    }

    #[tokio::test]
    async fn test_run_until_end_of_input() {
        let registry = Arc::new(registry());
        let input: &[u8] = b"login alice\n";
        let mut output = Vec::new();

        run(registry.clone(), Some(Duration::from_secs(3600)), input, &mut output)
            .await
            .unwrap();

        assert_eq!(output.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(Arc::strong_count(&registry), 1);
    }
}
