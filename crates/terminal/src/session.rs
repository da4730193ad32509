//! One interactive terminal per WebSocket connection.

use std::{sync::Arc, time::Instant};

use {
    axum::{
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{CloseFrame, Message, WebSocket},
        },
        http::HeaderMap,
        response::IntoResponse,
    },
    futures::{SinkExt, StreamExt, stream::SplitSink},
    labrun_accounting::{AccountingStore, AdmissionGate, AdmissionPermit, keys},
    labrun_common::ProjectRef,
    labrun_config::LabrunConfig,
    labrun_containers::{ContainerResolver, SchedulerClient},
    serde::Deserialize,
    tracing::{debug, info, warn},
};

use crate::{
    access::{Caller, ProjectDirectory, authorize},
    error::Result,
    pty::{PtyEvent, PtyProcess},
    strategy::{SpawnContext, SpawnPlan, SpawnStrategy, select_strategy},
    workspace::WorkspaceManager,
};

/// Close code for a shell that exited on its own.
const CLOSE_NORMAL: u16 = 1000;

/// Prefix of the reserved resize control frame.
const RESIZE_PREFIX: &str = "resize:";

#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub runtime: String,
    pub workspace_mount: String,
    pub shell: String,
    pub default_rows: u16,
    pub default_cols: u16,
    pub max_input_bytes: usize,
    pub max_sessions: u32,
}

impl TerminalSettings {
    pub fn from_config(config: &LabrunConfig) -> Self {
        Self {
            runtime: config.containers.runtime.clone(),
            workspace_mount: config.execution.workspace_mount.clone(),
            shell: config.terminal.shell.clone(),
            default_rows: config.terminal.default_rows,
            default_cols: config.terminal.default_cols,
            max_input_bytes: config.terminal.max_input_bytes,
            max_sessions: config.terminal.max_sessions,
        }
    }
}

/// Shared state behind the terminal endpoint.
#[derive(Clone)]
pub struct TerminalService {
    settings: Arc<TerminalSettings>,
    resolver: Arc<ContainerResolver>,
    workspaces: Arc<WorkspaceManager>,
    projects: Arc<dyn ProjectDirectory>,
    gate: AdmissionGate,
    scheduler: Option<Arc<SchedulerClient>>,
    strategy: Option<SpawnStrategy>,
}

impl TerminalService {
    pub fn new(
        settings: TerminalSettings,
        resolver: Arc<ContainerResolver>,
        workspaces: WorkspaceManager,
        projects: Arc<dyn ProjectDirectory>,
        store: Arc<dyn AccountingStore>,
    ) -> Self {
        let gate = match settings.max_sessions {
            0 => AdmissionGate::unbounded(store, keys::ACTIVE_TERMINALS),
            limit => AdmissionGate::new(store, keys::ACTIVE_TERMINALS, limit),
        };
        Self {
            settings: Arc::new(settings),
            resolver,
            workspaces: Arc::new(workspaces),
            projects,
            gate,
            scheduler: None,
            strategy: None,
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerClient>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Skip environment probing and always use `strategy`.
    #[must_use]
    pub fn with_strategy(mut self, strategy: SpawnStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn settings(&self) -> &TerminalSettings {
        &self.settings
    }

    pub fn active_sessions(&self) -> i64 {
        self.gate.in_flight()
    }

    /// Everything before streaming: access, admission, workspace, image,
    /// strategy and the PTY itself.
    async fn open(
        &self,
        headers: &HeaderMap,
        project: Option<&str>,
        label: &str,
    ) -> Result<OpenSession> {
        let caller = Caller::from_headers(headers)?;
        let project = authorize(self.projects.as_ref(), &caller, project).await?;
        let permit = self.gate.try_acquire()?;
        let user = caller.identity();

        let paths = self.workspaces.ensure_workspace(user, &project).await?;
        let image = self.resolver.resolve_scoped(user, Some(&project));
        let strategy = self.strategy.unwrap_or_else(|| {
            select_strategy(
                &self.settings.runtime,
                &image.path,
                self.scheduler.as_deref(),
            )
        });

        let ctx = SpawnContext {
            runtime: &self.settings.runtime,
            image: &image.path,
            project_dir: &paths.project_dir,
            user_root: &paths.user_root,
            workspace_mount: &self.settings.workspace_mount,
            shell: &self.settings.shell,
            job_name: format!("labrun-term-{}-{}", user.username, project.slug),
        };
        let plan = SpawnPlan::build(strategy, &ctx, self.scheduler.as_deref());
        let pty = PtyProcess::spawn(
            &plan,
            self.settings.default_rows,
            self.settings.default_cols,
            label,
        )?;

        info!(
            user = %user,
            project = project.id,
            strategy = %strategy,
            image = %image.path.display(),
            scope = %image.scope,
            pid = ?pty.pid(),
            "terminal session started"
        );
        Ok(OpenSession {
            pty,
            _permit: permit,
            project,
        })
    }
}

struct OpenSession {
    pty: PtyProcess,
    _permit: AdmissionPermit,
    project: ProjectRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalQuery {
    project: Option<String>,
}

/// `GET /ws/terminal?project=<id>`
pub async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    State(service): State<TerminalService>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, service, headers, query.project))
}

async fn handle_terminal_socket(
    socket: WebSocket,
    service: TerminalService,
    headers: HeaderMap,
    project: Option<String>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let label: String = conn_id.chars().take(8).collect();
    let started = Instant::now();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut session = match service.open(&headers, project.as_deref(), &label).await {
        Ok(session) => session,
        Err(e) => {
            warn!(conn_id = %conn_id, project = ?project, error = %e, "terminal session rejected");
            send_close(&mut ws_tx, e.close_code(), e.close_reason()).await;
            return;
        },
    };
    let max_input = service.settings().max_input_bytes;

    loop {
        tokio::select! {
            event = session.pty.recv() => match event {
                Some(PtyEvent::Output(data)) => {
                    if ws_tx.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                },
                Some(PtyEvent::Error(err)) => {
                    warn!(conn_id = %conn_id, error = %err, "terminal stream error");
                },
                Some(PtyEvent::Closed) | None => {
                    send_close(&mut ws_tx, CLOSE_NORMAL, "terminal exited".into()).await;
                    break;
                },
            },
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else {
                    break;
                };
                let input = match msg {
                    Message::Text(text) => {
                        if let Some(spec) = text.as_str().strip_prefix(RESIZE_PREFIX) {
                            match parse_resize(spec) {
                                Some((rows, cols)) => {
                                    if let Err(e) = session.pty.resize(rows, cols) {
                                        warn!(conn_id = %conn_id, error = %e, "terminal resize failed");
                                    }
                                },
                                None => debug!(conn_id = %conn_id, "dropping malformed resize frame"),
                            }
                            continue;
                        }
                        text.as_str().as_bytes().to_vec()
                    },
                    Message::Binary(bytes) => bytes.to_vec(),
                    Message::Ping(payload) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    },
                    Message::Close(_) => break,
                    Message::Pong(_) => continue,
                };
                if input.is_empty() {
                    continue;
                }
                if input.len() > max_input {
                    warn!(conn_id = %conn_id, bytes = input.len(), max_input, "dropping oversized terminal input");
                    continue;
                }
                if let Err(e) = session.pty.write(input) {
                    warn!(conn_id = %conn_id, error = %e, "terminal input failed");
                    break;
                }
            },
        }
    }

    session.pty.shutdown();
    info!(
        conn_id = %conn_id,
        project = session.project.id,
        duration_ms = started.elapsed().as_millis() as u64,
        "terminal session closed"
    );
}

async fn send_close(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to send close frame");
    }
}

/// Parse `<rows>:<cols>` from a resize frame. Zero sizes are rejected.
fn parse_resize(spec: &str) -> Option<(u16, u16)> {
    let (rows, cols) = spec.trim().split_once(':')?;
    let rows: u16 = rows.parse().ok()?;
    let cols: u16 = cols.parse().ok()?;
    (rows > 0 && cols > 0).then_some((rows, cols))
}
