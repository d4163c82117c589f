// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: startup, shutdown, recovery.
//!
//! Startup wires every singleton through the dependency context, takes
//! the single-instance lock, restores the config tree (snapshot, then
//! transaction-log replay on top), re-registers surviving services,
//! binds the IPC socket, and writes a fresh bootstrap token. Shutdown
//! unwinds in reverse: stop services, flush and snapshot the store,
//! drop the on-disk runtime files.

use crate::context::{Context, ContextError};
use crate::credentials::FileCredentialSource;
use crate::deployment::{DeploymentEngine, EngineCtx, EngineDriver, NoopBroadcaster};
use crate::env::EmberPaths;
use crate::ipc::{
    AuthzPolicy, Authenticator, CliHandler, ConfigHandler, CredentialsHandler, LifecycleHandler,
    Router, TokenRegistry,
};
use crate::scripts::HostScriptRunner;
use crate::supervisor::{ServiceSpec, Supervisor, SupervisorConfig, SupervisorDriver};
use ember_config::{ConfigStore, ConfigValue, SnapshotError, Tlog, TlogError};
use ember_core::SystemClock;
use ember_recipe::RecipeCache;
use ember_wire::Destination;
use fs2::FileExt;
use indexmap::IndexMap;
use semver::Version;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Daemon supervisor with the real clock.
pub type DaemonSupervisor = Supervisor<SystemClock>;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: EmberPaths,
}

impl Config {
    /// Resolve the root directory (`--root`, `$EMBER_ROOT`, `~/.ember`).
    pub fn load(explicit_root: Option<PathBuf>) -> Result<Self, LifecycleError> {
        let paths = EmberPaths::resolve(explicit_root).ok_or(LifecycleError::NoRoot)?;
        Ok(Self { paths })
    }
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine a root directory")]
    NoRoot,

    #[error("failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("transaction log: {0}")]
    Tlog(#[from] TlogError),

    #[error("context: {0}")]
    Context(#[from] ContextError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live daemon state.
pub struct DaemonState {
    pub config: Config,
    // NOTE(lifetime): held for the exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
    pub context: Context,
    pub store: Arc<ConfigStore>,
    pub supervisor: DaemonSupervisor,
    pub engine: DeploymentEngine,
    pub router: Arc<Router>,
    pub shutdown_token: CancellationToken,
}

/// Everything `main` spawns after startup.
pub struct StartupResult {
    pub daemon: DaemonState,
    pub listener: UnixListener,
    pub supervisor_driver: SupervisorDriver<SystemClock>,
    pub engine_driver: EngineDriver<SystemClock>,
    pub engine_ctx: Arc<EngineCtx<SystemClock>>,
}

/// Bring the daemon up. The caller spawns the returned drivers and the
/// router's accept loop.
pub fn startup(config: Config) -> Result<StartupResult, LifecycleError> {
    let paths = config.paths.clone();
    for dir in [
        paths.config_dir(),
        paths.recipes_dir(),
        paths.artifacts_root(),
        paths.deployments_dir(),
        paths.ipc_dir(),
        paths.log_dir(),
        paths.root().join("work"),
    ] {
        std::fs::create_dir_all(dir)?;
    }

    // Single instance lock + pid file.
    let lock_file = File::create(paths.lock_path())?;
    lock_file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    let mut pid_writer = &lock_file;
    let _ = write!(pid_writer, "{}", std::process::id());

    let context = Context::new();
    let clock = SystemClock::default();
    context.put("clock", Arc::new(clock.clone()))?;
    context.put("paths", Arc::new(paths.clone()))?;

    // Restore the tree: snapshot first, then replay any records the
    // log holds beyond it (crash leftovers), then append from here.
    let store = Arc::new(ConfigStore::new());
    if ember_config::load_file(&store, &paths.snapshot_path())? {
        info!(path = %paths.snapshot_path().display(), "loaded config snapshot");
    }
    let records = Tlog::read_all(&paths.tlog_path())?;
    if !records.is_empty() {
        info!(count = records.len(), "replaying transaction log");
        store.replay(records);
    }
    store.attach_log(Tlog::open(&paths.tlog_path())?);
    context.put("config-store", Arc::clone(&store))?;
    {
        let store = Arc::clone(&store);
        let snapshot_path = paths.snapshot_path();
        context.on_close("config-store", move || {
            if let Err(e) = store.flush_log() {
                warn!(error = %e, "log flush on shutdown failed");
            }
            if let Err(e) = ember_config::dump_file(&store, &snapshot_path) {
                warn!(error = %e, "shutdown snapshot failed");
            }
        });
    }

    {
        let store = Arc::clone(&store);
        let clock = clock.clone();
        context.register("token-registry", move |_| {
            Arc::new(TokenRegistry::new(Arc::clone(&store), clock.clone()))
        })?;
    }
    let tokens: Arc<TokenRegistry<SystemClock>> = context.get("token-registry")?;

    {
        let recipes_dir = paths.recipes_dir();
        context.register("recipe-cache", move |_| Arc::new(RecipeCache::new(recipes_dir.clone())))?;
    }
    let cache: Arc<RecipeCache> = context.get("recipe-cache")?;

    // Supervisor over the host script runner.
    let supervisor_config = SupervisorConfig {
        work_root: paths.root().join("work"),
        credentials_url: std::env::var("EMBER_CREDENTIALS_URL").ok(),
        ..SupervisorConfig::default()
    };
    let (supervisor, supervisor_driver) = Supervisor::new(
        Arc::clone(&store),
        Arc::new(HostScriptRunner::new()),
        clock.clone(),
        supervisor_config,
    );

    // Router + deployment engine.
    let router = Arc::new(Router::new(
        Arc::clone(&tokens) as Arc<dyn Authenticator>,
        AuthzPolicy,
    ));
    let notify = validation_events_enabled();
    let engine_ctx = EngineCtx {
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        supervisor: supervisor.clone(),
        tokens: Arc::clone(&tokens),
        broadcaster: if notify {
            Arc::clone(&router) as Arc<dyn crate::deployment::ValidationBroadcaster>
        } else {
            Arc::new(NoopBroadcaster)
        },
        clock: clock.clone(),
        paths: paths.clone(),
        os: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        settle: crate::fsm::DEPLOYMENT_SETTLE,
    };
    let (engine, engine_driver) = EngineDriver::new(engine_ctx);
    let engine_ctx = engine_driver.context();

    router.register(
        Destination::Lifecycle,
        Arc::new(LifecycleHandler::new(supervisor.clone())),
    );
    router.register(
        Destination::ConfigStore,
        Arc::new(ConfigHandler::new(Arc::clone(&store), clock.clone(), Arc::clone(&router))),
    );
    router.register(
        Destination::Cli,
        Arc::new(CliHandler::new(
            supervisor.clone(),
            engine.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            paths.clone(),
            clock.clone(),
        )),
    );
    router.register(
        Destination::Credentials,
        Arc::new(CredentialsHandler::new(Arc::new(FileCredentialSource::new(
            paths.config_dir().join("credentials.json"),
        )))),
    );

    // Fresh bootstrap token every start.
    tokens.write_bootstrap_token(&paths.cli_token_path())?;

    // Bind the socket, clearing any stale file from a previous run.
    let socket_path = paths.socket_path();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| LifecycleError::BindFailed(socket_path.clone(), e))?;

    // Surviving services from the restored tree rejoin the supervisor.
    reconcile_services(&store, &cache, &supervisor);

    Ok(StartupResult {
        daemon: DaemonState {
            config,
            lock_file,
            context,
            store,
            supervisor,
            engine,
            router,
            shutdown_token: CancellationToken::new(),
        },
        listener,
        supervisor_driver,
        engine_driver,
        engine_ctx,
    })
}

/// Whether deployments announce configuration for validation over IPC.
/// Always on; the hook exists for headless tests via env override.
fn validation_events_enabled() -> bool {
    std::env::var("EMBER_SKIP_VALIDATION_EVENTS").is_err()
}

/// Re-register services found in the restored config tree and bring
/// them back up.
fn reconcile_services(
    store: &Arc<ConfigStore>,
    cache: &RecipeCache,
    supervisor: &DaemonSupervisor,
) {
    let Some(root) = store.lookup(&crate::env::services_root()) else {
        return;
    };
    let mut desired = IndexMap::new();
    for name in root.children {
        let version_path = crate::env::service_version_path(&name);
        let Some(ConfigValue::String(version)) = store.get_value(&version_path) else {
            continue;
        };
        let Ok(version) = Version::parse(&version) else {
            warn!(service = %name, %version, "unparseable version leaf");
            continue;
        };
        match cache.load(&name, &version) {
            Ok(Some(recipe)) => {
                let spec = ServiceSpec::from_recipe(
                    &recipe,
                    std::env::consts::OS,
                    std::env::consts::ARCH,
                );
                supervisor.upsert_service(spec);
                desired.insert(name, true);
            }
            Ok(None) => warn!(service = %name, %version, "recipe missing at startup"),
            Err(e) => warn!(service = %name, error = %e, "recipe unreadable at startup"),
        }
    }
    if !desired.is_empty() {
        info!(count = desired.len(), "restarting surviving services");
        supervisor.submit(desired);
    }
}

impl DaemonState {
    /// Graceful shutdown: stop services, then unwind the context
    /// (flush + snapshot) and drop runtime files.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown_token.cancel();
        let _ = self.supervisor.shutdown().await;

        // Close hooks flush the log and write the shutdown snapshot.
        self.context.shutdown();

        // The snapshot now holds everything; the log restarts empty.
        let paths = &self.config.paths;
        if let Err(e) = std::fs::remove_file(paths.tlog_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove transaction log");
            }
        }
        for path in [paths.socket_path(), paths.cli_token_path(), paths.lock_path()] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove runtime file");
                }
            }
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
