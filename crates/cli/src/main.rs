//! bulwark - signature scan daemon and client.

mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{Config, ListenerConfig, Verdict};
use bulwark_daemon::{Client, Daemon, DaemonHandle, DrainStatus, Endpoint, ScanReply};
use clap::Parser;
use eyre::WrapErr;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ENDPOINT: &str = "127.0.0.1:3310";

/// How long blocking scans abandoned by a forced drain may delay exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("BULWARK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Serve {
            ref database,
            ref listen_tcp,
            ref listen_local,
            max_threads,
        } => {
            let config = match load_config(cli.config.as_deref()) {
                Ok(mut config) => {
                    if let Some(dir) = database {
                        config.database_directory.clone_from(dir);
                    }
                    config
                        .listeners
                        .extend(listen_tcp.iter().map(ListenerConfig::tcp));
                    config
                        .listeners
                        .extend(listen_local.iter().map(ListenerConfig::local));
                    if let Some(n) = max_threads {
                        config.max_threads = n;
                    }
                    config.debug |= cli.debug;
                    config
                }
                Err(e) => {
                    init_tracing(cli.debug);
                    error!(%e, "invalid configuration");
                    eprintln!("bulwark: {e:#}");
                    return ExitCode::FAILURE;
                }
            };
            init_tracing(config.debug);
            run_serve(config)
        }
        cli::Command::Client(ref command) => {
            init_tracing(cli.debug);
            let client = Client::new(endpoint(&cli), Duration::from_secs(cli.timeout));
            run_client(&client, command)
        }
    }
}

fn load_config(path: Option<&Path>) -> bulwark_core::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    Ok(config)
}

fn endpoint(cli: &cli::Cli) -> Endpoint {
    if let Some(ref path) = cli.local {
        return Endpoint::Local(path.clone());
    }
    Endpoint::Tcp(cli.tcp.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.into()))
}

fn run_serve(config: Config) -> ExitCode {
    if let Err(e) = config.validate() {
        error!(%e, "invalid configuration");
        eprintln!("bulwark: {e}");
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!(%e, "failed to build tokio runtime");
            eprintln!("runtime error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run_to_completion(rt, serve(Arc::new(config))) {
        Ok(status) => {
            info!(?status, "daemon exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "daemon failed to start");
            eprintln!("bulwark: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Drive `future` to completion, then stop the runtime without waiting on
/// blocking tasks past the grace period.
fn run_to_completion<F: std::future::Future>(rt: tokio::runtime::Runtime, future: F) -> F::Output {
    let output = rt.block_on(future);
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    output
}

async fn serve(config: Arc<Config>) -> bulwark_core::Result<DrainStatus> {
    let daemon = Daemon::start(config)
        .await
        .wrap_err("daemon startup failed")?;
    spawn_signal_handlers(daemon.handle())?;
    Ok(daemon.run().await)
}

#[cfg(unix)]
fn spawn_signal_handlers(handle: DaemonHandle) -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading database");
                    handle.trigger_reload();
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    handle.shutdown();
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    handle.shutdown();
                    break;
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(handle: DaemonHandle) -> eyre::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            handle.shutdown();
        }
    });
    Ok(())
}

fn run_client(client: &Client, command: &cli::ClientCommand) -> ExitCode {
    debug!("running client command");
    match client_command(client, command) {
        Ok(code) => code,
        Err(e) => {
            warn!(%e, "client command failed");
            eprintln!("bulwark: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn client_command(client: &Client, command: &cli::ClientCommand) -> eyre::Result<ExitCode> {
    match command {
        cli::ClientCommand::Ping => {
            client.ping().wrap_err("ping failed")?;
            println!("PONG");
        }
        cli::ClientCommand::Version => println!("{}", client.version()?),
        cli::ClientCommand::Stats => println!("{}", client.stats()?),
        cli::ClientCommand::Reload => {
            client.reload()?;
            println!("RELOAD");
        }
        cli::ClientCommand::Shutdown => client.shutdown()?,
        cli::ClientCommand::Scan { path, mode } => {
            let path = absolute(path)?;
            let replies = match mode {
                cli::ScanMode::Scan => client.scan(&path)?,
                cli::ScanMode::Cont => client.contscan(&path)?,
                cli::ScanMode::Multi => client.multiscan(&path)?,
            };
            return Ok(report(&replies));
        }
        cli::ClientCommand::Stream => {
            let reply = client.instream(std::io::stdin().lock())?;
            return Ok(report(std::slice::from_ref(&reply)));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn absolute(path: &Path) -> eyre::Result<PathBuf> {
    std::path::absolute(path).wrap_err_with(|| format!("cannot resolve {}", path.display()))
}

/// Print verdicts; exit 1 if anything was infected, 2 on scan errors only.
fn report(replies: &[ScanReply]) -> ExitCode {
    let mut infected = false;
    let mut errors = false;
    for reply in replies {
        match &reply.verdict {
            Verdict::Clean => println!("{}: OK", reply.target),
            Verdict::Infected(name) => {
                infected = true;
                println!("{}: {name} FOUND", reply.target);
            }
            Verdict::Error(reason) => {
                errors = true;
                println!("{}: {reason} ERROR", reply.target);
            }
        }
    }
    if infected {
        ExitCode::FAILURE
    } else if errors {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn serve_and_client_commands_parse_apart() {
        let cli = cli::Cli::try_parse_from(["bulwark", "serve", "--max-threads", "4"]).unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::Serve {
                max_threads: Some(4),
                ..
            }
        ));

        let cli = cli::Cli::try_parse_from(["bulwark", "scan", "/tmp", "--mode", "multi"]).unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::Client(cli::ClientCommand::Scan {
                mode: cli::ScanMode::Multi,
                ..
            })
        ));
    }

    #[test]
    fn abandoned_blocking_scan_does_not_hold_exit() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let started = Instant::now();
        let output = run_to_completion(rt, async {
            drop(tokio::task::spawn_blocking(|| {
                std::thread::sleep(Duration::from_secs(10));
            }));
            7
        });
        assert_eq!(output, 7);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
