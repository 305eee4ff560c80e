use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use rolesync_core::paths::{rolesync_root, socket_path};
use rolesync_core::{Config, IntentStore, MemberUpdate, SubjectId};
use rolesync_engine::{
    ChangeListener, InMemoryPlatform, ListenerOutcome, RatePolicy, Reconciler, ResetProgress,
    ResetService, SyncError, Topology,
};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Counters for membership notifications seen by the event task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub received: u64,
    pub suppressed: u64,
    pub ignored: u64,
    pub recorded: u64,
    pub failed: u64,
    pub last_event_at_unix: u64,
}

impl EventStats {
    fn record(&mut self, outcome: &Result<ListenerOutcome, SyncError>) {
        match outcome {
            Ok(ListenerOutcome::Suppressed { .. }) => self.suppressed += 1,
            Ok(ListenerOutcome::Ignored { .. }) => self.ignored += 1,
            Ok(ListenerOutcome::Recorded { .. }) => self.recorded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Everything a socket client or the event task needs.
#[derive(Clone)]
struct DaemonState {
    home: PathBuf,
    config: Arc<Config>,
    platform: Arc<InMemoryPlatform>,
    engine: Arc<Reconciler>,
    listener: ChangeListener,
    resets: ResetService,
    stats: Arc<RwLock<EventStats>>,
    started_at_unix: u64,
}

impl DaemonState {
    fn new(
        home: PathBuf,
        config: Config,
        platform: Arc<InMemoryPlatform>,
        store: IntentStore,
    ) -> Self {
        let engine = Arc::new(
            Reconciler::new(platform.clone(), platform.clone(), Arc::new(store))
                .with_call_timeout(config.call_timeout()),
        );
        let resets = ResetService::new(engine.clone(), config.primary_group.clone());
        Self {
            home,
            config: Arc::new(config),
            platform,
            listener: ChangeListener::new(engine.clone()),
            engine,
            resets,
            stats: Arc::new(RwLock::new(EventStats::default())),
            started_at_unix: unix_seconds_now(),
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until `stop` or ctrl-c.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let root = rolesync_root(&home);
    fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;

    let config = Config::load_at(&home)?;
    let topology_path = config.topology_path_at(&home);
    let platform = Arc::new(InMemoryPlatform::from_topology(Topology::load(&topology_path)?)?);
    let events = platform.subscribe();
    let store = IntentStore::open_at(&home)?;
    let state = DaemonState::new(home, config, platform, store);

    let syncable = state.engine.rebuild_roles().await?;
    tracing::info!(
        topology = %topology_path.display(),
        syncable,
        primary = ?state.config.primary_group,
        "daemon connected",
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let events_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = event_task(state, events, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (events_result, socket_result, signal_result) =
        tokio::join!(events_handle, socket_handle, signal_handle);

    handle_join("event_listener", events_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Hand each notification to a listener task.
///
/// A notification for a subject that is mid-pass is dropped on arrival.
/// Otherwise its task first waits for the subject's previous task, so two
/// quick edits to one member reach the intent store in the order they
/// happened. Different subjects never wait on each other.
async fn event_task(
    state: DaemonState,
    mut events: mpsc::UnboundedReceiver<MemberUpdate>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut pending: HashMap<SubjectId, JoinHandle<()>> = HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            update = events.recv() => {
                let Some(update) = update else {
                    return Err(DaemonError::ChannelClosed("platform events"));
                };
                state.stats.write().await.received += 1;

                if state.engine.guard().is_locked(&update.subject) {
                    tracing::debug!(
                        subject = %update.subject,
                        group = %update.group,
                        "subject mid-reconciliation; dropping notification",
                    );
                    let mut stats = state.stats.write().await;
                    stats.suppressed += 1;
                    stats.last_event_at_unix = unix_seconds_now();
                    continue;
                }

                pending.retain(|_, task| !task.is_finished());
                let previous = pending.remove(&update.subject);
                let subject = update.subject.clone();
                let listener = state.listener.clone();
                let stats = state.stats.clone();
                let task = tokio::spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let group = update.group.clone();
                    let outcome = listener.handle(update).await;
                    {
                        let mut stats = stats.write().await;
                        stats.record(&outcome);
                        stats.last_event_at_unix = unix_seconds_now();
                    }
                    match outcome {
                        Ok(ListenerOutcome::Recorded { subject, reconcile: Some(pass), .. }) => {
                            tracing::info!(subject = %subject, group = %group, "{}", pass.summary());
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(group = %group, error = %err, "membership change handling failed");
                        }
                    }
                });
                pending.insert(subject, task);
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    state: DaemonState,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: DaemonState,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let (progress_tx, progress_rx) = mpsc::channel::<ResetProgress>(32);
        let (response, forwarded) = tokio::join!(
            dispatch(&state, request, &shutdown_tx, Some(progress_tx)),
            forward_progress(&mut writer, progress_rx),
        );
        forwarded?;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Write each bulk-reset step to the client until the sender side is dropped.
///
/// On a write failure the receiver is dropped, so the reset keeps going without a listener.
async fn forward_progress(
    writer: &mut OwnedWriteHalf,
    mut progress_rx: mpsc::Receiver<ResetProgress>,
) -> Result<(), DaemonError> {
    while let Some(progress) = progress_rx.recv().await {
        tracing::info!(
            done = progress.done,
            total = progress.total,
            subject = %progress.result.subject,
            success = progress.result.success,
            "{}",
            progress.result.message,
        );
        let frame = DaemonResponse::progress(serde_json::to_value(&progress)?);
        write_response(writer, &frame).await?;
    }
    Ok(())
}

async fn dispatch(
    state: &DaemonState,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
    progress: Option<mpsc::Sender<ResetProgress>>,
) -> DaemonResponse {
    let result = match request.cmd.as_str() {
        "status" => Ok(build_status_payload(state).await),
        "sync" => handle_sync(state, request, progress).await,
        "event" => handle_event(state, request),
        "rebuild" => state
            .engine
            .rebuild_roles()
            .await
            .map(|syncable| json!({ "syncable": syncable }))
            .map_err(DaemonError::from),
        "roles" => Ok(json!({ "roles": state.engine.roles().names().await })),
        "intents" => Ok(match request.subject {
            Some(subject) => json!({
                "subject": subject,
                "roles": state.engine.store().list_roles(&subject),
            }),
            None => json!({ "subjects": state.engine.store().snapshot() }),
        }),
        "stop" => {
            let _ = shutdown_tx.send(());
            Ok(json!({ "stopping": true }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    };

    match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

/// One subject, or every member with a progress frame per subject.
async fn handle_sync(
    state: &DaemonState,
    request: DaemonRequest,
    progress: Option<mpsc::Sender<ResetProgress>>,
) -> Result<Value, DaemonError> {
    if let Some(subject) = request.subject {
        let report = state.resets.reset_subject(&subject).await?;
        let summary = report.outcome.summary();
        tracing::info!(subject = %subject, "{summary}");
        return Ok(json!({ "summary": summary, "report": report }));
    }

    let policy = RatePolicy::per_second(state.config.sync_all.calls_per_second);
    let summary = state.resets.reset_all(policy, progress).await?;
    Ok(serde_json::to_value(summary)?)
}

fn handle_event(state: &DaemonState, request: DaemonRequest) -> Result<Value, DaemonError> {
    let (Some(group), Some(subject)) = (request.group, request.subject) else {
        return Err(DaemonError::Protocol(
            "event requires 'group' and 'subject'".to_string(),
        ));
    };
    let roles = request.roles.unwrap_or_default();
    let names: Vec<&str> = roles.iter().map(|r| r.0.as_str()).collect();
    let update = state
        .platform
        .edit_member(&group, &subject, &names)
        .map_err(|err| DaemonError::Sync(err.into()))?;
    Ok(json!({ "queued": update }))
}

async fn build_status_payload(state: &DaemonState) -> Value {
    let stats = state.stats.read().await.clone();
    let syncable = state.engine.roles().names().await;
    let store = state.engine.store();

    json!({
        "running": true,
        "started_at_unix": state.started_at_unix,
        "primary_group": state.config.primary_group,
        "syncable_roles": syncable.len(),
        "subjects_with_intents": store.subjects().len(),
        "reconciling": state.engine.guard().locked_subjects(),
        "events": stats,
        "intents_file": store.path().display().to_string(),
        "socket": socket_path(&state.home).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("ROLESYNC_LOG_FORMAT").as_deref() == Ok("json") {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
