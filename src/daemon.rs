//! The long-running supervisor. Whatever the role, the daemon holds a lock
//! on its own reserved lockfile and runs a monitor worker that keeps a copy
//! of this binary alive in the opposite role, so the pair watch each other.
//! Only the primary brings up the configured processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{error, info};

use crate::cli::Role;
use crate::config::{self, Paths};
use crate::lockfile::{now_epoch, Lockfile};
use crate::monitor;
use crate::process::{build_graph, ProcessRecord, SupervisorContext};
use crate::scheduler;

pub async fn run(config_path: PathBuf, role: Role, verbose: bool) -> Result<()> {
    let paths = Paths::load();
    spawn_termination_handler()?;

    // Configuration problems must surface before the pair is started, or a
    // healthy backup would keep respawning a primary that dies on parse.
    let procs = if role == Role::Primary {
        build_graph(config::load(&config_path)?)?
    } else {
        Vec::new()
    };

    let argv0 = std::env::args().next().unwrap_or_else(|| "procmon".to_string());

    // Our own lockfile, locked for the process lifetime: this is what the
    // peer supervisor blocks on to detect our death.
    let own_exec = command_line(&argv0, verbose, role.own_flag(), &config_path);
    let _own_lock = Lockfile::create(
        &paths.lock_dir,
        role.own_id(),
        std::process::id() as i32,
        &own_exec,
        now_epoch(),
    )
    .with_context(|| format!("failed to create the {role} supervisor lockfile"))?;

    let ctx = Arc::new(SupervisorContext {
        paths,
        procs,
        verbose,
    });

    // The peer record is not part of the dependency graph; its worker execs
    // a copy of this binary in the opposite role and monitors it like any
    // other process.
    let peer_exec = command_line(&argv0, verbose, role.peer_flag(), &config_path);
    let peer = Arc::new(ProcessRecord::supervisor(role.peer_id(), peer_exec, verbose));
    monitor::spawn_worker(&ctx, &peer);

    if role == Role::Primary {
        if verbose {
            display_config(&ctx);
        }
        scheduler::run_processes(&ctx).await;
    }

    info!(
        "process monitor running in {role} role (pid {})",
        std::process::id()
    );

    // All forward progress happens in the monitor workers.
    loop {
        sleep(Duration::from_secs(10)).await;
    }
}

/// SIGTERM/SIGINT are abnormal for a supervisor: log and exit 1, and let
/// the peer bring a replacement up.
fn spawn_termination_handler() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        error!("abnormal termination of process monitor");
        std::process::exit(1);
    });
    Ok(())
}

fn command_line(argv0: &str, verbose: bool, flag: &str, config: &Path) -> String {
    if verbose {
        format!("{argv0} -v {flag} {}", config.display())
    } else {
        format!("{argv0} {flag} {}", config.display())
    }
}

fn display_config(ctx: &SupervisorContext) {
    for record in &ctx.procs {
        println!("process: {}", record.id);
        println!("\tstate: {}", record.state());
        println!("\texec: {}", record.exec);
        if record.wait > 0 {
            println!("\twait: {}", record.wait);
        }
        println!(
            "\tmonitored: {}",
            if record.monitored { "yes" } else { "no" }
        );
        println!("\tDepends on: [{}]", id_list(ctx, &record.parents));
        println!("\tDependency of: [{}]", id_list(ctx, &record.children));
        println!();
    }
}

fn id_list(ctx: &SupervisorContext, indices: &[usize]) -> String {
    indices
        .iter()
        .map(|&idx| ctx.procs[idx].id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::command_line;

    #[test]
    fn command_lines_round_trip_through_the_cli_surface() {
        assert_eq!(
            command_line("procmon", false, "-F", Path::new("procs.json")),
            "procmon -F procs.json"
        );
        assert_eq!(
            command_line("./procmon", true, "-f", Path::new("/etc/procs.json")),
            "./procmon -v -f /etc/procs.json"
        );
    }
}
