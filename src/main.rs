// dered — the dere daemon binary.
//
// Startup order matters: config, then storage (migrations under the
// advisory lock), then recovery sweeps, then background loops, then the
// request surface. Exit codes: 0 clean shutdown, 1 startup failure,
// 2 schema/migration mismatch.

use dere::engine::activities::ActivityRegistry;
use dere::engine::config::DaemonConfig;
use dere::engine::queue::WorkerPool;
use dere::engine::state::DaemonState;
use dere::engine::{ambient, missions, paths, server, store, swarm, workflow};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("[daemon] {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = paths::ensure_data_dir().and_then(|_| paths::cleanup_stale_files()) {
        error!("[daemon] {e}");
        return ExitCode::from(1);
    }

    let state = match DaemonState::new(config) {
        Ok(state) => Arc::new(state),
        Err(e) if store::is_schema_mismatch(&e) => {
            error!("[daemon] {e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("[daemon] {e}");
            return ExitCode::from(1);
        }
    };

    let http_addr = format!("127.0.0.1:{}", state.config.http_port);
    if let Err(e) = paths::write_runtime_files(&http_addr, &state.config.db_path) {
        error!("[daemon] {e}");
        return ExitCode::from(1);
    }

    info!(
        "[daemon] Starting (db={:?}, workers={}, http={})",
        state.config.db_path, state.config.worker_count, http_addr
    );

    // ── Recovery sweeps ────────────────────────────────────────────────
    // Stale tasks are recovered inside WorkerPool::spawn; swarms and
    // workflow runs here.
    swarm::cleanup_orphans(&state);
    workflow::resume_unfinished_runs(&state);

    // ── Background loops ───────────────────────────────────────────────
    let pool = WorkerPool::spawn(state.clone(), Arc::new(ActivityRegistry::default()));
    let fsm = Arc::new(ambient::AmbientFsm::new(state.clone()));
    let fsm_handle = tokio::spawn(fsm.run());
    let missions_handle = tokio::spawn(missions::scheduler_loop(state.clone()));
    let monitor_handle = tokio::spawn(workflow::monitor_loop(state.clone()));

    // ── Request surface ────────────────────────────────────────────────
    let http_state = state.clone();
    let http_port = state.config.http_port;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = server::http::run_server(http_state, http_port).await {
            error!("[daemon] HTTP server failed: {e}");
        }
    });
    let uds_state = state.clone();
    let uds_handle = tokio::spawn(async move {
        if let Err(e) = server::uds::run_server(uds_state, &paths::socket_file()).await {
            error!("[daemon] UDS server failed: {e}");
        }
    });

    // ── Wait for a shutdown signal ─────────────────────────────────────
    wait_for_signal().await;
    info!("[daemon] Shutdown requested");
    state.shutdown.cancel();

    // Stop accepting, then drain in-flight handlers within the budget.
    server::http::drain_inflight(
        &state,
        Duration::from_secs(dere::atoms::constants::SHUTDOWN_DRAIN_SECS),
    )
    .await;

    pool.join().await;
    for handle in [fsm_handle, missions_handle, monitor_handle, http_handle, uds_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    paths::remove_runtime_files();
    info!("[daemon] Clean shutdown");
    ExitCode::from(0)
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
