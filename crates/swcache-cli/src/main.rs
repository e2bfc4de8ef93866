//! Command-line driver for the offline cache worker.
//!
//! Boots a worker from a JSON config (install, then activate) and prints one
//! JSON line per result, so runs can be scripted and diffed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use swcache_common::{try_init_logging, LogConfig, SwCacheError};
use swcache_net::Request;
use swcache_worker::{
    ClientMessage, ClientRegistry, OfflineWorker, UsageReporter, WorkerConfig, WorkerResult,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Drive the offline cache worker from the command line")]
struct Args {
    /// Worker config (JSON); built-in defaults when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Precache the manifest and activate
    Install,
    /// Serve URLs through a freshly activated worker
    Fetch {
        /// URLs to request
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Print the usage message clients would receive
    Usage,
}

#[derive(Serialize)]
struct InstallLine {
    version: String,
    cached: usize,
    failed: Vec<String>,
    deleted: Vec<String>,
}

#[derive(Serialize)]
struct FetchLine {
    url: String,
    strategy: &'static str,
    status: u16,
    source: String,
    bytes: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "swcache failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> WorkerResult<()> {
    let config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };

    let logging = if args.verbose {
        LogConfig::debug()
    } else {
        config.logging.clone()
    };
    match try_init_logging(&logging) {
        Ok(()) | Err(SwCacheError::Logging(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let clients = Arc::new(ClientRegistry::new());
    let worker = OfflineWorker::from_config(&config, clients.clone()).await?;

    match args.command {
        Command::Install => {
            let installed = worker.install().await?;
            let activated = worker.activate().await?;
            emit(&InstallLine {
                version: worker.version().to_string(),
                cached: installed.cached,
                failed: installed.failed.iter().map(|u| u.to_string()).collect(),
                deleted: activated.deleted,
            })?;
        }
        Command::Fetch { urls } => {
            let installed = worker.install().await?;
            info!(cached = installed.cached, failed = installed.failed.len(), "Worker installed");
            worker.activate().await?;

            for url in urls {
                let request = Request::parse_get(&url)?;
                let Some(handled) = worker.handle_fetch(request).await else {
                    continue;
                };
                emit(&FetchLine {
                    url,
                    strategy: handled.strategy.name(),
                    status: handled.response.status,
                    source: format!("{:?}", handled.response.source).to_lowercase(),
                    bytes: handled.response.content_length(),
                })?;
            }
        }
        Command::Usage => {
            let reporter =
                UsageReporter::new(worker.store().clone(), clients, config.usage_timeout());
            emit(&ClientMessage::CacheSizeUpdate {
                size: reporter.estimate().await,
            })?;
        }
    }

    worker.shutdown().await;
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> WorkerResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| SwCacheError::internal(format!("cannot encode output: {e}")))?;
    println!("{line}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let args =
            Args::parse_from(["swcache", "-c", "worker.json", "fetch", "https://dicey.test/"]);
        assert_eq!(args.config, Some(PathBuf::from("worker.json")));
        assert!(matches!(args.command, Command::Fetch { ref urls } if urls.len() == 1));
        assert!(Args::try_parse_from(["swcache", "fetch"]).is_err());
    }

    #[tokio::test]
    async fn test_bad_log_filter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "logging": { "filter": "swcache_worker=loud" } }"#).unwrap();

        let args = Args::parse_from(["swcache", "-c", path.to_str().unwrap(), "usage"]);
        let err = run(args).await.unwrap_err();
        assert!(err.to_string().contains("logging"), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_log_level_fails_even_when_verbose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "logging": { "level": "loud" } }"#).unwrap();

        let args = Args::parse_from(["swcache", "-v", "-c", path.to_str().unwrap(), "usage"]);
        assert!(run(args).await.is_err());
    }
}
