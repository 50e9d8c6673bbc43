// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::Client;
use kube_lease_manager::LeaseManagerBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use svcat::{
    admission::{admission_router, AdmissionState},
    config::{write_completions, Cli, Command, LeaseConfig, RunArgs},
    constants::TOKIO_WORKER_THREADS,
    context::Context,
    engine::Engine,
    metrics::{self, Metrics},
    osb::BrokerClientManager,
    store::Stores,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(Command::Completions { shell }) = cli.command {
        write_completions(shell, &mut std::io::stdout());
        return Ok(());
    }
    cli.run.validate()?;

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("svcat-controller")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli.run))
}

async fn async_main(args: RunArgs) -> Result<()> {
    // Respects RUST_LOG (default info) and RUST_LOG_FORMAT=json|text
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting service catalog controller");

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install the rustls ring crypto provider");
    }

    debug!("Initializing Kubernetes client");
    let client = Client::try_default()
        .await
        .context("Kubernetes API is unreachable")?;

    let metrics = Arc::new(Metrics::new()?);
    let settings = args.settings();
    info!(cluster_id = %settings.cluster_id, osb_api_version = %settings.osb_api_version, "Engine settings loaded");
    let stores = Stores::kubernetes(&client);
    let ctx = Arc::new(Context::new(
        stores.clone(),
        BrokerClientManager::new(),
        Arc::clone(&metrics),
        settings,
    ));

    let metrics_listener = bind(args.metrics_addr(), "metrics").await?;
    let admission_listener = bind(args.listen_addr()?, "admission").await?;
    let admission = admission_router(Arc::new(AdmissionState::new(Arc::clone(
        &stores.service_instances,
    ))));

    let engine = run_engine(client, ctx, &args);

    tokio::select! {
        result = axum::serve(metrics_listener, metrics::router(metrics)) => {
            error!("CRITICAL: metrics server exited: {:?}", result);
            result?;
            anyhow::bail!("metrics server exited unexpectedly")
        }
        result = axum::serve(admission_listener, admission) => {
            error!("CRITICAL: admission server exited: {:?}", result);
            result?;
            anyhow::bail!("admission server exited unexpectedly")
        }
        result = engine => {
            result?;
            info!("Graceful shutdown completed successfully");
            Ok(())
        }
    }
}

async fn bind(addr: SocketAddr, what: &str) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {what} listener on {addr}"))?;
    info!("Serving {} on {}", what, addr);
    Ok(listener)
}

/// Run reconcilers until a signal arrives, holding the lease when configured.
async fn run_engine(client: Client, ctx: Arc<Context>, args: &RunArgs) -> Result<()> {
    let engine = Engine::new(Arc::clone(&ctx), args.engine_config());
    let Some(lease) = args.lease() else {
        engine.run(shutdown_signal()).await;
        return Ok(());
    };

    let identity = leader_identity();
    info!(lease = %lease.name, namespace = %lease.namespace, identity = %identity, "Waiting for leadership");
    let (mut leader, task) = lease_manager(client, &lease, &identity).await?.watch().await;

    let elected = tokio::select! {
        () = wait_for_leadership(&mut leader, true) => true,
        () = shutdown_signal() => false,
    };
    if !elected {
        drop(leader);
        task.await??;
        return Ok(());
    }
    info!(identity = %identity, "Acquired leadership");
    ctx.metrics.record_leader_elected(&identity);

    engine
        .run(async {
            tokio::select! {
                () = wait_for_leadership(&mut leader, false) => {
                    warn!("Leadership lost; stopping reconcilers");
                }
                () = shutdown_signal() => {}
            }
        })
        .await;
    let still_leader = *leader.borrow();
    ctx.metrics.record_leader_lost(&identity);

    info!("Releasing leader election lease");
    drop(leader);
    task.await??;

    if still_leader {
        Ok(())
    } else {
        // Exit non-zero so the pod restarts and rejoins the election.
        anyhow::bail!("leader election lease lost")
    }
}

async fn lease_manager(
    client: Client,
    lease: &LeaseConfig,
    identity: &str,
) -> Result<kube_lease_manager::LeaseManager> {
    let manager = LeaseManagerBuilder::new(client, &lease.name)
        .with_namespace(&lease.namespace)
        .with_identity(identity)
        .with_duration(lease.duration_secs)
        .with_grace(lease.grace_secs)
        .build()
        .await?;
    Ok(manager)
}

/// Pod name when running in a cluster, hostname otherwise.
fn leader_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("svcat-{}", svcat::reconcilers::generate_external_id()))
}

/// Resolve once the lease state equals `want`, or never if the manager is gone.
async fn wait_for_leadership(leader: &mut watch::Receiver<bool>, want: bool) {
    loop {
        if *leader.borrow_and_update() == want {
            return;
        }
        if leader.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating graceful shutdown..."),
        () = terminate => info!("Received SIGTERM (pod termination), initiating graceful shutdown..."),
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod main_tests;
