//! Control socket.
//!
//! One newline-terminated JSON request per connection, one JSON response
//! back, then the connection closes. Every command is dispatched to the
//! orchestrator; errors come back as `{"ok":false,"error":...}`.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetdock_protocol::{ControlCommand, ControlRequest, ControlResponse};

use crate::error::{OrchestratorError, Result};
use crate::health::{MuxHealth, RestartOutcome};
use crate::lifecycle::RecoverOutcome;
use crate::orchestrator::{CreateThreadRequest, Orchestrator};
use crate::tabs::TabRef;
use crate::thread::Thread;

/// Requests larger than this are rejected unread.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct ControlContext {
    pub orchestrator: Arc<Orchestrator>,
    pub health: Arc<MuxHealth>,
}

/// Bind `socket` and serve until `cancel` fires. A leftover socket file from
/// a previous run is replaced; the new one is readable by the owner only.
pub async fn serve(
    ctx: Arc<ControlContext>,
    socket: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if socket.exists() {
        std::fs::remove_file(socket)?;
    }
    let listener = UnixListener::bind(socket)?;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))?;
    info!(
        component = "control",
        event = "control.listening",
        socket = %socket.display(),
        "Control socket listening"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(handle_connection(ctx, stream));
                }
                Err(e) => warn!(
                    component = "control",
                    event = "control.accept_failed",
                    error = %e,
                    "Failed to accept control connection"
                ),
            },
        }
    }

    let _ = std::fs::remove_file(socket);
    info!(
        component = "control",
        event = "control.stopped",
        "Control socket closed"
    );
    Ok(())
}

async fn handle_connection(ctx: Arc<ControlContext>, stream: UnixStream) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let response = match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) if !line.ends_with('\n') && line.len() as u64 >= MAX_REQUEST_BYTES => {
            ControlResponse::failure(None, "request too large")
        }
        Ok(_) => match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => {
                debug!(
                    component = "control",
                    event = "control.request",
                    connection_id = conn_id,
                    command = request.command.name(),
                );
                dispatch(&ctx, request).await
            }
            Err(e) => ControlResponse::failure(None, format!("invalid request: {e}")),
        },
        Err(e) => ControlResponse::failure(None, format!("read failed: {e}")),
    };

    if let Err(e) = write.write_all(response.to_line().as_bytes()).await {
        debug!(
            component = "control",
            event = "control.write_failed",
            connection_id = conn_id,
            error = %e,
            "Client went away before the response was written"
        );
    }
    let _ = write.shutdown().await;
}

/// Run one request and build its response.
pub async fn dispatch(ctx: &ControlContext, request: ControlRequest) -> ControlResponse {
    let id = request.id;
    let name = request.command.name();
    match handle(ctx, id.clone(), request.command).await {
        Ok(response) => response,
        Err(e) => {
            info!(
                component = "control",
                event = "control.command_failed",
                command = name,
                error = %e,
                "Control command failed"
            );
            ControlResponse::failure(id, e.to_string())
        }
    }
}

fn target(o: &Orchestrator, id: Option<String>, name: Option<String>) -> Result<Thread> {
    o.resolve_thread(id.as_deref(), name.as_deref())
}

fn recover_label(outcome: &RecoverOutcome) -> &'static str {
    match outcome {
        RecoverOutcome::Recovered => "recovered",
        RecoverOutcome::MainThreadMissing => "main-thread-missing",
        RecoverOutcome::ProjectNotFound => "project-not-found",
        RecoverOutcome::Failed(_) => "failed",
    }
}

async fn handle(
    ctx: &ControlContext,
    id: Option<String>,
    command: ControlCommand,
) -> Result<ControlResponse> {
    let o = &ctx.orchestrator;
    let ok = ControlResponse::success(id);

    let response = match command {
        ControlCommand::Ping => ok.with("pong", true).with("pid", std::process::id()),

        ControlCommand::CreateThread {
            project,
            agent_type,
            thread_name,
            prompt,
        } => {
            let thread = o
                .create_thread(CreateThreadRequest {
                    project,
                    agent: agent_type,
                    name: thread_name,
                    prompt,
                })
                .await?;
            ok.with("thread", thread.summary())
        }
        ControlCommand::ListProjects => ok.with("projects", o.list_projects()),
        ControlCommand::ListThreads {
            project,
            include_archived,
        } => ok.with(
            "threads",
            o.list_threads(project.as_deref(), include_archived)?,
        ),
        ControlCommand::SendPrompt {
            thread_id,
            thread_name,
            session_name,
            prompt,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let session = o
                .send_prompt(&thread.id, session_name.as_deref(), &prompt)
                .await?;
            ok.with("sessionName", session)
        }
        ControlCommand::ArchiveThread {
            thread_id,
            thread_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let cleanup = o.archive_thread(&thread.id).await?;
            ok.with("cleanupWarnings", cleanup.failures)
        }
        ControlCommand::DeleteThread {
            thread_id,
            thread_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let cleanup = o.delete_thread(&thread.id).await?;
            ok.with("cleanupWarnings", cleanup.failures)
        }
        ControlCommand::RenameThread {
            thread_id,
            thread_name,
            description,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let report = o.rename_from_description(&thread.id, &description).await?;
            let renamed = o.resolve_thread(Some(&thread.id), None)?;
            ok.with("thread", renamed.summary())
                .with("oldName", report.old_name)
                .with("cleanupWarnings", report.cleanup.failures)
        }
        ControlCommand::RenameThreadExact {
            thread_id,
            thread_name,
            new_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let report = o.rename_thread(&thread.id, &new_name).await?;
            let renamed = o.resolve_thread(Some(&thread.id), None)?;
            ok.with("thread", renamed.summary())
                .with("oldName", report.old_name)
                .with("cleanupWarnings", report.cleanup.failures)
        }
        ControlCommand::CurrentThread { session_name } => {
            let thread = o
                .thread_for_session(&session_name)
                .ok_or(OrchestratorError::SessionNotFound(session_name))?;
            ok.with("thread", thread.summary())
        }
        ControlCommand::ThreadInfo {
            thread_id,
            thread_name,
        } => ok.with(
            "thread",
            o.thread_info(thread_id.as_deref(), thread_name.as_deref())
                .await?,
        ),
        ControlCommand::ThreadDiff {
            thread_id,
            thread_name,
        } => ok.with(
            "diff",
            o.thread_diff(thread_id.as_deref(), thread_name.as_deref())
                .await?,
        ),
        ControlCommand::PinThread {
            thread_id,
            thread_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            ok.with("thread", o.pin_thread(&thread.id, true).await?.summary())
        }
        ControlCommand::UnpinThread {
            thread_id,
            thread_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            ok.with("thread", o.pin_thread(&thread.id, false).await?.summary())
        }
        ControlCommand::MoveThread {
            thread_id,
            thread_name,
            section_name,
            position,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            let moved = o
                .move_thread(&thread.id, section_name.as_deref(), position)
                .await?;
            ok.with("thread", moved.summary())
        }
        ControlCommand::RecoverThread {
            thread_id,
            thread_name,
        } => {
            // Archived threads are valid targets here.
            let thread = o.resolve_record(thread_id.as_deref(), thread_name.as_deref())?;
            let outcome = o.recover_worktree(&thread.id).await?;
            let response = ok.with("outcome", recover_label(&outcome));
            match outcome {
                RecoverOutcome::Failed(message) => response.with("message", message),
                _ => response,
            }
        }

        ControlCommand::ListTabs {
            thread_id,
            thread_name,
        } => ok.with("tabs", target(o, thread_id, thread_name)?.tabs()),
        ControlCommand::CreateTab {
            thread_id,
            thread_name,
            agent_type,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            ok.with("tab", o.add_tab(&thread.id, agent_type.as_deref()).await?)
        }
        ControlCommand::CloseTab {
            thread_id,
            thread_name,
            tab_index,
            session_name,
        } => {
            let tab = match (session_name, tab_index) {
                (Some(session), _) => TabRef::Session(session),
                (None, Some(index)) => TabRef::Index(index),
                (None, None) => {
                    return Ok(ControlResponse::failure(
                        ok.id,
                        "close-tab needs tabIndex or sessionName",
                    ))
                }
            };
            let thread = target(o, thread_id, thread_name)?;
            let cleanup = o.remove_tab(&thread.id, tab).await?;
            ok.with("cleanupWarnings", cleanup.failures)
        }
        ControlCommand::FocusTab { session_name } => {
            let thread = o.focus_session(&session_name).await?;
            ok.with("thread", thread.summary())
        }
        ControlCommand::PinTab {
            thread_id,
            thread_name,
            session_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            o.pin_tab(&thread.id, &session_name, true).await?;
            ok
        }
        ControlCommand::UnpinTab {
            thread_id,
            thread_name,
            session_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            o.pin_tab(&thread.id, &session_name, false).await?;
            ok
        }
        ControlCommand::RenameTab {
            thread_id,
            thread_name,
            session_name,
            new_name,
        } => {
            let thread = target(o, thread_id, thread_name)?;
            o.set_tab_display_name(&thread.id, &session_name, new_name.as_deref())
                .await?;
            ok
        }

        ControlCommand::ListSections { project } => {
            ok.with("sections", o.list_sections(project.as_deref())?)
        }
        ControlCommand::AddSection {
            project,
            section_name,
            section_color,
        } => {
            let section = o
                .add_section(project.as_deref(), &section_name, section_color.as_deref())
                .await?;
            ok.with("section", section)
        }
        ControlCommand::RemoveSection {
            project,
            section_name,
        } => {
            o.remove_section(project.as_deref(), &section_name).await?;
            ok
        }
        ControlCommand::ReorderSection {
            project,
            section_name,
            position,
        } => {
            o.reorder_section(project.as_deref(), &section_name, position)
                .await?;
            ok.with("sections", o.list_sections(project.as_deref())?)
        }
        ControlCommand::RenameSection {
            project,
            section_name,
            new_name,
        } => {
            o.rename_section(project.as_deref(), &section_name, &new_name)
                .await?;
            ok
        }
        ControlCommand::HideSection {
            project,
            section_name,
        } => {
            o.set_section_hidden(project.as_deref(), &section_name, true)
                .await?;
            ok
        }
        ControlCommand::ShowSection {
            project,
            section_name,
        } => {
            o.set_section_hidden(project.as_deref(), &section_name, false)
                .await?;
            ok
        }

        ControlCommand::RestartMux => match ctx.health.restart_mux().await? {
            RestartOutcome::Restarted { recreated } => ok.with("recreated", recreated),
            RestartOutcome::AlreadyRunning => ok.with("alreadyRunning", true),
        },
    };
    Ok(response)
}

/// Send one request to a running server and wait for its response.
pub async fn request(
    socket: &Path,
    request: &ControlRequest,
    timeout: Duration,
) -> anyhow::Result<ControlResponse> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await?;
        let response: ControlResponse = serde_json::from_str(reply.trim())?;
        Ok::<_, anyhow::Error>(response)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("no response from {} within {:?}", socket.display(), timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFleet;
    use serde_json::{json, Value};

    fn context(fleet: &TestFleet) -> ControlContext {
        ControlContext {
            orchestrator: fleet.orchestrator.clone(),
            health: MuxHealth::new(fleet.orchestrator.clone()),
        }
    }

    async fn call(ctx: &ControlContext, body: Value) -> ControlResponse {
        let request: ControlRequest = serde_json::from_value(body).unwrap();
        dispatch(ctx, request).await
    }

    #[tokio::test]
    async fn ping_echoes_id() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);
        let response = call(&ctx, json!({"id": "r1", "command": "ping"})).await;
        assert!(response.ok);
        assert_eq!(response.id.as_deref(), Some("r1"));
        assert_eq!(response.payload["pong"], json!(true));
    }

    #[tokio::test]
    async fn thread_commands_round_trip() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);

        let created = call(
            &ctx,
            json!({"command": "create-thread", "project": "webapp", "threadName": "login"}),
        )
        .await;
        assert!(created.ok, "{:?}", created.error);
        assert_eq!(created.payload["thread"]["name"], json!("login"));

        let listed = call(&ctx, json!({"command": "list-threads", "project": "webapp"})).await;
        let names: Vec<_> = listed.payload["threads"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"login".to_string()));

        let renamed = call(
            &ctx,
            json!({"command": "rename-thread-exact", "threadName": "login", "newName": "signin"}),
        )
        .await;
        assert!(renamed.ok, "{:?}", renamed.error);
        assert_eq!(renamed.payload["oldName"], json!("login"));

        let current = call(&ctx, json!({"command": "current-thread", "sessionName": "signin"})).await;
        assert_eq!(current.payload["thread"]["name"], json!("signin"));

        let diff = call(&ctx, json!({"command": "thread-diff", "threadName": "signin"})).await;
        assert!(diff.ok, "{:?}", diff.error);
        assert!(diff.payload["diff"].as_str().unwrap().ends_with("against main\n"));

        let archived = call(&ctx, json!({"command": "archive-thread", "threadName": "signin"})).await;
        assert!(archived.ok);
        assert_eq!(archived.payload["cleanupWarnings"], json!([]));

        let recovered = call(&ctx, json!({"command": "recover-thread", "threadName": "signin"})).await;
        assert_eq!(recovered.payload["outcome"], json!("recovered"));
    }

    #[tokio::test]
    async fn tab_commands() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);
        fleet.create("webapp", Some("x")).await;

        let tab = call(&ctx, json!({"command": "create-tab", "threadName": "x"})).await;
        assert_eq!(tab.payload["tab"]["sessionName"], json!("x_2"));

        let pinned = call(
            &ctx,
            json!({"command": "pin-tab", "threadName": "x", "sessionName": "x_2"}),
        )
        .await;
        assert!(pinned.ok);
        let labeled = call(
            &ctx,
            json!({"command": "rename-tab", "threadName": "x", "sessionName": "x_2", "newName": "logs"}),
        )
        .await;
        assert!(labeled.ok);

        let tabs = call(&ctx, json!({"command": "list-tabs", "threadName": "x"})).await;
        let second = &tabs.payload["tabs"][1];
        assert_eq!(second["isPinned"], json!(true));
        assert_eq!(second["displayName"], json!("logs"));

        let missing = call(&ctx, json!({"command": "close-tab", "threadName": "x"})).await;
        assert!(!missing.ok);

        let closed = call(
            &ctx,
            json!({"command": "close-tab", "threadName": "x", "tabIndex": 1}),
        )
        .await;
        assert!(closed.ok, "{:?}", closed.error);
        assert!(!fleet.mux.is_live("x_2"));
    }

    #[tokio::test]
    async fn errors_become_failures() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);
        let response = call(
            &ctx,
            json!({"id": "7", "command": "archive-thread", "threadName": "ghost"}),
        )
        .await;
        assert!(!response.ok);
        assert_eq!(response.id.as_deref(), Some("7"));
        assert!(response.error.unwrap().contains("ghost"));

        let main = fleet.orchestrator.create_main_thread("webapp").await.unwrap();
        let response = call(
            &ctx,
            json!({"command": "delete-thread", "threadId": main.id}),
        )
        .await;
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn section_commands() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);
        let added = call(
            &ctx,
            json!({"command": "add-section", "sectionName": "Blocked", "sectionColor": "#f00"}),
        )
        .await;
        assert_eq!(added.payload["section"]["name"], json!("Blocked"));

        let reordered = call(
            &ctx,
            json!({"command": "reorder-section", "sectionName": "Blocked", "position": 0}),
        )
        .await;
        assert_eq!(reordered.payload["sections"][0]["name"], json!("Blocked"));

        call(&ctx, json!({"command": "hide-section", "sectionName": "Blocked"})).await;
        let listed = call(&ctx, json!({"command": "list-sections"})).await;
        assert_eq!(listed.payload["sections"][0]["hidden"], json!(true));
    }

    #[tokio::test]
    async fn restart_mux_reports_recreated() {
        let fleet = TestFleet::new().await;
        let ctx = context(&fleet);
        fleet.create("webapp", Some("x")).await;
        let response = call(&ctx, json!({"command": "restart-mux"})).await;
        assert_eq!(response.payload["recreated"], json!(1));
    }

    #[tokio::test]
    async fn serves_over_unix_socket() {
        let fleet = TestFleet::new().await;
        let ctx = Arc::new(context(&fleet));
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        // A stale file from a crashed run must not block the bind.
        std::fs::write(&socket, b"").unwrap();

        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let socket = socket.clone();
            let cancel = cancel.clone();
            async move { serve(ctx, &socket, cancel).await }
        });

        let ping = ControlRequest {
            id: Some("a".into()),
            command: ControlCommand::Ping,
        };
        let mut response = None;
        for _ in 0..50 {
            match request(&socket, &ping, Duration::from_secs(2)).await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let response = response.expect("server answered");
        assert!(response.ok);
        assert_eq!(response.id.as_deref(), Some("a"));

        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Garbage gets a failure, not a dropped connection.
        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(b"{not json}\n").await.unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await.unwrap();
        let reply: ControlResponse = serde_json::from_str(reply.trim()).unwrap();
        assert!(!reply.ok);

        cancel.cancel();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
