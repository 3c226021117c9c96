// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Loomy operator entrypoint.
//!
//! Wires the engine to a cluster: reflector stores for the Loomy CRD
//! types, a controller per CRD kind, one dynamic composite controller per
//! established `CompositeResourceDefinition`, leader election, and the
//! metrics/health endpoints.

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use futures::StreamExt;
use kube::{
    core::{ApiResource, DynamicObject},
    runtime::{controller::Action, reflector, watcher, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use kube_lease_manager::LeaseManagerBuilder;
use loomy::{
    api::{parse_gvk, KubeResourceClient, ResourceKey},
    connection::SecretStore,
    constants::{
        DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_GRACE_SECS, DEFAULT_POLL_INTERVAL_SECS,
        DEFAULT_RECONCILE_DEADLINE_SECS, DEFAULT_WORKER_COUNT, KIND_COMPOSITE, KIND_COMPOSITION,
        KIND_COMPOSITE_RESOURCE_DEFINITION, LEASE_NAME, METRICS_SERVER_BIND_ADDRESS,
        METRICS_SERVER_PATH, METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
    },
    context::{Context, Stores},
    crd::{Composition, CompositionRevision, CompositeResourceDefinition},
    metrics,
    pipeline::InProcessRunner,
    reconcilers::{
        definition::DefinedType, reconcile_composite, reconcile_composition,
        reconcile_definition, retry::RequeueTracker, Engine, EngineConfig, ReconcileOutcome,
    },
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ReconcileError(#[from] anyhow::Error);

/// Composite resource reconciliation engine for Kubernetes.
#[derive(Parser, Debug, Clone)]
#[command(name = "loomy", version, about)]
struct Cli {
    /// Concurrent reconcile workers per composite controller.
    #[arg(long, env = "LOOMY_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Requeue interval after a successful composite reconcile, in seconds.
    #[arg(long, env = "LOOMY_POLL_INTERVAL_SECONDS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval_seconds: u64,

    /// Per-reconcile deadline, in seconds.
    #[arg(long, env = "LOOMY_RECONCILE_DEADLINE_SECONDS", default_value_t = DEFAULT_RECONCILE_DEADLINE_SECS)]
    reconcile_deadline_seconds: u64,

    /// Port for the metrics and health HTTP server.
    #[arg(long, env = "LOOMY_METRICS_PORT", default_value_t = METRICS_SERVER_PORT)]
    metrics_port: u16,

    /// Enable leader election (disable for local development).
    #[arg(
        long,
        env = "LOOMY_ENABLE_LEADER_ELECTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    enable_leader_election: bool,

    /// Namespace holding the leader election lease.
    #[arg(long, env = "LOOMY_LEASE_NAMESPACE", default_value = "loomy-system")]
    lease_namespace: String,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            reconcile_deadline: Duration::from_secs(self.reconcile_deadline_seconds),
            worker_count: self.workers,
            ..EngineConfig::default()
        }
    }
}

fn main() -> Result<()> {
    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("loomy-engine")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise defaults to INFO level.
/// Respects `RUST_LOG_FORMAT` environment variable for output format (json or text).
fn initialize_logging() {
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

    info!("Starting Loomy composite resource engine");
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging();

    let config = kube::Config::infer().await?;
    let client = Client::try_from(config)?;
    info!("Kubernetes client initialized");

    let context = initialize_shared_context(client.clone());
    let _metrics_handle = start_metrics_server(cli.metrics_port);

    if cli.enable_leader_election {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("loomy-{}", rand::random::<u32>()));

        info!(
            lease_name = LEASE_NAME,
            lease_namespace = %cli.lease_namespace,
            identity = %identity,
            "Leader election enabled, waiting to acquire leadership..."
        );

        let lease_manager = LeaseManagerBuilder::new(client.clone(), LEASE_NAME)
            .with_namespace(&cli.lease_namespace)
            .with_identity(&identity)
            .with_duration(DEFAULT_LEASE_DURATION_SECS)
            .with_grace(DEFAULT_LEASE_GRACE_SECS)
            .build()
            .await?;

        let (leader_rx, _lease_handle) = lease_manager.watch().await;

        let mut rx = leader_rx.clone();
        while !*rx.borrow_and_update() {
            rx.changed().await?;
        }
        info!("Leadership acquired, starting controllers");

        tokio::select! {
            result = run_operators(context, cli) => result?,
            result = monitor_leadership(leader_rx) => {
                warn!("Leadership lost, shutting down");
                result?;
            }
            result = shutdown_signal() => {
                info!("Shutdown signal received, stopping controllers");
                result?;
            }
        }
    } else {
        warn!("Leader election DISABLED - running without high availability");
        tokio::select! {
            result = run_operators(context, cli) => result?,
            result = shutdown_signal() => {
                info!("Shutdown signal received, stopping controllers");
                result?;
            }
        }
    }

    info!("Graceful shutdown completed");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C)");
            result.map_err(anyhow::Error::from)
        }
        result = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                sigterm.recv().await;
                Ok::<(), anyhow::Error>(())
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            }
        } => {
            info!("Received SIGTERM (pod termination)");
            result
        }
    }
}

/// Monitor leadership status - returns when leadership is lost.
async fn monitor_leadership(
    mut leader_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    loop {
        leader_rx.changed().await?;
        if !*leader_rx.borrow() {
            return Ok(());
        }
    }
}

/// Start reflectors for all Loomy CRD types and build the shared context.
fn initialize_shared_context(client: Client) -> Arc<Context> {
    info!("Initializing reflectors for Loomy CRD types");

    let definitions_api = Api::<CompositeResourceDefinition>::all(client.clone());
    let compositions_api = Api::<Composition>::all(client.clone());
    let revisions_api = Api::<CompositionRevision>::all(client.clone());

    let (definitions_store, definitions_writer) = reflector::store();
    let (compositions_store, compositions_writer) = reflector::store();
    let (revisions_store, revisions_writer) = reflector::store();

    tokio::spawn(async move {
        let stream = watcher(definitions_api, watcher::Config::default());
        reflector(definitions_writer, stream)
            .for_each(|_| futures::future::ready(()))
            .await;
        warn!("CompositeResourceDefinition reflector stream ended");
    });

    tokio::spawn(async move {
        let stream = watcher(compositions_api, watcher::Config::default());
        reflector(compositions_writer, stream)
            .for_each(|_| futures::future::ready(()))
            .await;
        warn!("Composition reflector stream ended");
    });

    tokio::spawn(async move {
        let stream = watcher(revisions_api, watcher::Config::default());
        reflector(revisions_writer, stream)
            .for_each(|_| futures::future::ready(()))
            .await;
        warn!("CompositionRevision reflector stream ended");
    });

    Arc::new(Context {
        client,
        stores: Stores {
            definitions: definitions_store,
            compositions: compositions_store,
            revisions: revisions_store,
        },
    })
}

/// Serve `/metrics` and `/healthz`.
fn start_metrics_server(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let router = Router::new()
            .route(
                METRICS_SERVER_PATH,
                get(|| async {
                    metrics::gather_metrics()
                        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
                }),
            )
            .route("/healthz", get(|| async { "ok" }));

        let address = format!("{METRICS_SERVER_BIND_ADDRESS}:{port}");
        info!(address = %address, "Starting metrics server");
        match tokio::net::TcpListener::bind(&address).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, router).await {
                    error!("Metrics server error: {e}");
                }
            }
            Err(e) => error!("Failed to bind metrics server to {address}: {e}"),
        }
    })
}

/// Shared state of the definition operator: which composite controllers
/// are already running.
struct OperatorState {
    context: Arc<Context>,
    cli: Cli,
    tracker: RequeueTracker,
    running: Mutex<HashSet<String>>,
}

/// Run the Composition and definition operators; composite controllers are
/// spawned dynamically as definitions establish.
async fn run_operators(context: Arc<Context>, cli: Cli) -> Result<()> {
    let state = Arc::new(OperatorState {
        context: context.clone(),
        cli,
        tracker: RequeueTracker::new(),
        running: Mutex::new(HashSet::new()),
    });

    tokio::select! {
        result = run_definition_operator(state.clone()) => {
            error!("CRITICAL: definition operator exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("definition operator exited unexpectedly without error")
        }
        result = run_composition_operator(state.clone()) => {
            error!("CRITICAL: composition operator exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("composition operator exited unexpectedly without error")
        }
    }
}

/// Run the `CompositeResourceDefinition` operator.
async fn run_definition_operator(state: Arc<OperatorState>) -> Result<()> {
    info!("Starting CompositeResourceDefinition operator");
    let api = Api::<CompositeResourceDefinition>::all(state.context.client.clone());

    Controller::new(api, Config::default())
        .run(reconcile_definition_wrapper, definition_error_policy, state)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

async fn reconcile_definition_wrapper(
    xrd: Arc<CompositeResourceDefinition>,
    state: Arc<OperatorState>,
) -> Result<Action, ReconcileError> {
    let start = std::time::Instant::now();
    let name = xrd.name_any();

    match reconcile_definition(state.context.client.clone(), (*xrd).clone()).await {
        Ok(Some(defined)) => {
            metrics::record_reconciliation_success(
                KIND_COMPOSITE_RESOURCE_DEFINITION,
                start.elapsed(),
            );
            state.tracker.reset(&name);

            if let Some(default) = &defined.default_composition {
                if state.context.stores.get_composition(default).is_none() {
                    warn!(
                        definition = %name,
                        composition = %default,
                        "Default composition does not exist (yet)"
                    );
                }
            }

            ensure_composite_controller(&state, defined);
            Ok(Action::await_change())
        }
        Ok(None) => {
            metrics::record_reconciliation_success(
                KIND_COMPOSITE_RESOURCE_DEFINITION,
                start.elapsed(),
            );
            state.tracker.reset(&name);
            Ok(Action::await_change())
        }
        Err(e) => {
            error!(definition = %name, error = %e, "Failed to reconcile definition");
            metrics::record_reconciliation_error(
                KIND_COMPOSITE_RESOURCE_DEFINITION,
                start.elapsed(),
            );
            Err(ReconcileError(e))
        }
    }
}

fn definition_error_policy(
    xrd: Arc<CompositeResourceDefinition>,
    _err: &ReconcileError,
    state: Arc<OperatorState>,
) -> Action {
    Action::requeue(state.tracker.backoff(&xrd.name_any()))
}

/// Run the `Composition` operator (revision cutting and GC).
async fn run_composition_operator(state: Arc<OperatorState>) -> Result<()> {
    info!("Starting Composition operator");
    let api = Api::<Composition>::all(state.context.client.clone());
    let revisions_api = Api::<CompositionRevision>::all(state.context.client.clone());

    Controller::new(api, Config::default())
        .owns(revisions_api, Config::default())
        .run(reconcile_composition_wrapper, composition_error_policy, state)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

async fn reconcile_composition_wrapper(
    composition: Arc<Composition>,
    state: Arc<OperatorState>,
) -> Result<Action, ReconcileError> {
    let start = std::time::Instant::now();
    let name = composition.name_any();

    match reconcile_composition(state.context.client.clone(), (*composition).clone()).await {
        Ok(()) => {
            metrics::record_reconciliation_success(KIND_COMPOSITION, start.elapsed());
            state.tracker.reset(&name);
            Ok(Action::await_change())
        }
        Err(e) => {
            error!(composition = %name, error = %e, "Failed to reconcile composition");
            metrics::record_reconciliation_error(KIND_COMPOSITION, start.elapsed());
            Err(ReconcileError(e))
        }
    }
}

fn composition_error_policy(
    composition: Arc<Composition>,
    _err: &ReconcileError,
    state: Arc<OperatorState>,
) -> Action {
    Action::requeue(state.tracker.backoff(&composition.name_any()))
}

/// Spawn a dynamic composite controller for an established definition,
/// once per defined type.
fn ensure_composite_controller(state: &Arc<OperatorState>, defined: DefinedType) {
    let key = format!("{}/{}", defined.api_version, defined.kind);
    {
        let mut running = state.running.lock().expect("registry poisoned");
        if !running.insert(key.clone()) {
            return;
        }
    }

    info!(composite_type = %key, "Starting composite controller");
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_composite_operator(state, defined).await {
            error!(composite_type = %key, error = %e, "Composite controller exited");
        }
    });
}

/// Per-composite-controller context.
struct CompositeCtx {
    engine: Engine,
    tracker: RequeueTracker,
    resource: ApiResource,
}

/// Run one dynamic composite controller for a defined type.
async fn run_composite_operator(state: Arc<OperatorState>, defined: DefinedType) -> Result<()> {
    let gvk = parse_gvk(&defined.api_version, &defined.kind)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let resource = loomy::api::api_resource(&gvk);
    let client = state.context.client.clone();

    let kube_client = Arc::new(KubeResourceClient::new(client.clone()));
    let engine = Engine {
        client: kube_client.clone(),
        // Remote function transports plug in here by implementing
        // FunctionRunner; the stock binary hosts in-process functions.
        runner: Arc::new(InProcessRunner::new()),
        fetcher: kube_client,
        secrets: Arc::new(SecretStore::new(client.clone())),
        default_composition: defined.default_composition.clone(),
        config: state.cli.engine_config(),
    };

    let ctx = Arc::new(CompositeCtx {
        engine,
        tracker: RequeueTracker::new(),
        resource: resource.clone(),
    });

    let api = Api::<DynamicObject>::all_with(client.clone(), &resource);
    let controller_config = kube::runtime::controller::Config::default()
        .concurrency(state.cli.workers as u16);
    let controller = Controller::new_with(api, Config::default(), resource.clone())
        .with_config(controller_config);

    // Revision rotation re-reconciles every composite bound to the rotated
    // Composition, without waiting for the poll interval.
    let composites = controller.store();
    let dyntype = resource.clone();
    let revisions_api = Api::<CompositionRevision>::all(client);
    let controller = controller.watches(
        revisions_api,
        Config::default(),
        move |revision: CompositionRevision| {
            let composition = revision
                .labels()
                .get(loomy::labels::REVISION_COMPOSITION_LABEL)
                .cloned()
                .unwrap_or_default();
            composites
                .state()
                .into_iter()
                .filter(|xr| {
                    xr.data
                        .pointer("/spec/compositionRef/name")
                        .and_then(|v| v.as_str())
                        == Some(composition.as_str())
                })
                .map(|xr| {
                    kube::runtime::reflector::ObjectRef::from_obj_with(
                        xr.as_ref(),
                        dyntype.clone(),
                    )
                })
                .collect::<Vec<_>>()
        },
    );

    controller
        .run(reconcile_composite_wrapper, composite_error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

async fn reconcile_composite_wrapper(
    object: Arc<DynamicObject>,
    ctx: Arc<CompositeCtx>,
) -> Result<Action, ReconcileError> {
    let start = std::time::Instant::now();
    let key = ResourceKey::new(&object.name_any(), object.namespace().as_deref());
    let gvk = kube::core::GroupVersionKind {
        group: ctx.resource.group.clone(),
        version: ctx.resource.version.clone(),
        kind: ctx.resource.kind.clone(),
    };

    debug!(composite = %key, kind = %gvk.kind, "Reconcile wrapper called");

    // The per-reconcile deadline cancels blocking fetches and function
    // invocations through future cancellation.
    let result = tokio::time::timeout(
        ctx.engine.config.reconcile_deadline,
        Box::pin(reconcile_composite(&ctx.engine, &gvk, &key)),
    )
    .await
    .unwrap_or_else(|_| {
        Err(loomy::errors::EngineError::Transient {
            operation: "reconcile".to_string(),
            reason: "deadline exceeded".to_string(),
        })
    });

    match result {
        Ok(outcome) => {
            metrics::record_reconciliation_success(KIND_COMPOSITE, start.elapsed());
            ctx.tracker.reset(&key.to_string());
            Ok(match outcome {
                ReconcileOutcome::Done => Action::await_change(),
                ReconcileOutcome::RequeueNow => {
                    metrics::record_reconciliation_requeue(KIND_COMPOSITE);
                    Action::requeue(Duration::ZERO)
                }
                ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
            })
        }
        Err(e) => {
            metrics::record_reconciliation_error(KIND_COMPOSITE, start.elapsed());
            metrics::record_error(KIND_COMPOSITE, e.status_reason());
            Err(ReconcileError(anyhow::Error::msg(e.to_string())))
        }
    }
}

fn composite_error_policy(
    object: Arc<DynamicObject>,
    _err: &ReconcileError,
    ctx: Arc<CompositeCtx>,
) -> Action {
    let key = ResourceKey::new(&object.name_any(), object.namespace().as_deref());
    Action::requeue(ctx.tracker.backoff(&key.to_string()))
}
