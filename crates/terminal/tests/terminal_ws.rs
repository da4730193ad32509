#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end terminal sessions over a real WebSocket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    labrun_accounting::{AccountingStore, MemoryStore, keys},
    labrun_config::ProjectEntry,
    labrun_containers::{ContainerResolver, ProcessRunner, WorkspaceLayout},
    labrun_terminal::{
        SpawnStrategy, StaticProjectDirectory, TerminalService, TerminalSettings, WorkspaceManager,
        access::{SESSION_HEADER, USER_ID_HEADER, USERNAME_HEADER},
        build_router,
    },
    tokio::net::TcpListener,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
    },
};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    store: MemoryStore,
    layout: WorkspaceLayout,
    _tmp: tempfile::TempDir,
}

async fn start_server(max_sessions: u32) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base.sif");
    std::fs::write(&base, b"sif").unwrap();
    let layout = WorkspaceLayout::new(tmp.path().join("workspaces"), tmp.path().join("storage"));
    let resolver = Arc::new(ContainerResolver::new(layout.clone(), &base).unwrap());
    let projects = StaticProjectDirectory::from_entries(&[ProjectEntry {
        id: 1,
        slug: "thesis".into(),
        owner: "alice".into(),
        collaborators: Vec::new(),
        guest_sessions: vec!["visitor-1".into()],
    }])
    .unwrap();
    let store = MemoryStore::default();
    let settings = TerminalSettings {
        runtime: "singularity".into(),
        workspace_mount: "/workspace".into(),
        shell: "/bin/sh".into(),
        default_rows: 24,
        default_cols: 80,
        max_input_bytes: 4096,
        max_sessions,
    };
    let service = TerminalService::new(
        settings,
        resolver,
        WorkspaceManager::new(layout.clone(), "lab.test", Arc::new(ProcessRunner)),
        Arc::new(projects),
        Arc::new(store.clone()),
    )
    .with_strategy(SpawnStrategy::BareShell);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(service)).await.unwrap();
    });
    TestServer {
        addr,
        store,
        layout,
        _tmp: tmp,
    }
}

async fn connect(addr: SocketAddr, query: &str, headers: &[(&'static str, &str)]) -> Ws {
    let mut request = format!("ws://{addr}/ws/terminal{query}")
        .into_client_request()
        .unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_str(value).unwrap());
    }
    let (ws, _) = connect_async(request).await.expect("ws connect failed");
    ws
}

fn alice() -> [(&'static str, &'static str); 2] {
    [(USER_ID_HEADER, "7"), (USERNAME_HEADER, "alice")]
}

/// Next close frame's code and reason, skipping any output.
async fn expect_close(ws: &mut Ws) -> (u16, String) {
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            if let Message::Close(frame) = msg.unwrap() {
                let frame = frame.expect("close frame without code");
                return (u16::from(frame.code), frame.reason.as_str().to_string());
            }
        }
        panic!("stream ended without a close frame");
    });
    deadline.await.expect("no close frame within 10s")
}

/// Collect output until `needle` shows up.
async fn read_until(ws: &mut Ws, needle: &str) -> String {
    let mut seen = String::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            match msg.unwrap() {
                Message::Binary(bytes) => {
                    seen.push_str(&String::from_utf8_lossy(&bytes));
                    if seen.contains(needle) {
                        return;
                    }
                },
                Message::Close(frame) => panic!("closed early: {frame:?}\n{seen}"),
                _ => {},
            }
        }
    })
    .await;
    assert!(result.is_ok(), "{needle:?} not seen in output:\n{seen}");
    seen
}

async fn wait_for_counter(store: &MemoryStore, expected: i64) {
    for _ in 0..100 {
        if store.get(keys::ACTIVE_TERMINALS) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "active_terminals stuck at {}",
        store.get(keys::ACTIVE_TERMINALS)
    );
}

#[tokio::test]
async fn missing_project_is_closed_with_policy_code() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "", &alice()).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "invalid project id");
    assert!(!server.layout.user_root("alice").exists());
}

#[tokio::test]
async fn unknown_project_creates_no_workspace() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=99", &alice()).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "project 99 not found");
    assert!(!server.layout.user_root("alice").exists());
    assert_eq!(server.store.get(keys::ACTIVE_TERMINALS), 0);
}

#[tokio::test]
async fn foreign_user_is_denied() {
    let server = start_server(4).await;
    let mut ws = connect(
        server.addr,
        "?project=1",
        &[(USER_ID_HEADER, "8"), (USERNAME_HEADER, "mallory")],
    )
    .await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert!(!server.layout.user_root("mallory").exists());
}

#[tokio::test]
async fn anonymous_caller_without_headers_is_rejected() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &[]).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "missing identity headers");
}

#[tokio::test]
async fn shell_round_trip() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &alice()).await;

    // The quotes keep the echoed command line from matching.
    ws.send(Message::Text("printf '%s\\n' \"lab\"\"run\"\n".into()))
        .await
        .unwrap();
    read_until(&mut ws, "labrun").await;

    let project_dir = server.layout.project_dir("alice", "thesis");
    assert!(project_dir.is_dir());
    assert!(
        server
            .layout
            .dotfiles_dir("alice")
            .join(".bashrc")
            .is_file()
    );
    assert_eq!(server.store.get(keys::ACTIVE_TERMINALS), 1);

    ws.close(None).await.ok();
    wait_for_counter(&server.store, 0).await;
}

#[tokio::test]
async fn shell_starts_in_project_directory() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &alice()).await;

    // Output proves the session is up, so the workspace exists by now.
    ws.send(Message::Text("echo ready-$((6*7))\n".into()))
        .await
        .unwrap();
    read_until(&mut ws, "ready-42").await;

    let project_dir = server.layout.project_dir("alice", "thesis");
    let canonical = std::fs::canonicalize(&project_dir).unwrap();
    ws.send(Message::Binary(b"pwd -P\n".to_vec().into()))
        .await
        .unwrap();
    read_until(&mut ws, &canonical.to_string_lossy()).await;
    ws.close(None).await.ok();
}

#[tokio::test]
async fn bare_shell_home_is_the_user_root() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &alice()).await;
    ws.send(Message::Text("printf 'home=%s;\\n' \"$HOME\"\n".into()))
        .await
        .unwrap();
    let home = server.layout.user_root("alice");
    read_until(&mut ws, &format!("home={};", home.display())).await;
    ws.close(None).await.ok();
}

#[tokio::test]
async fn resize_frames_are_not_forwarded() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &alice()).await;

    // A forwarded frame would be glued onto the next command line and break it.
    ws.send(Message::Text("resize:abc".into())).await.unwrap();
    ws.send(Message::Text("resize:40:120".into())).await.unwrap();
    ws.send(Message::Text("stty size\n".into())).await.unwrap();
    read_until(&mut ws, "40 120").await;
    ws.close(None).await.ok();
}

#[tokio::test]
async fn exiting_shell_closes_normally() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &alice()).await;
    ws.send(Message::Text("exit\n".into())).await.unwrap();
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "terminal exited");
    wait_for_counter(&server.store, 0).await;
}

#[tokio::test]
async fn guest_with_allocated_session_gets_a_shell() {
    let server = start_server(4).await;
    let mut ws = connect(server.addr, "?project=1", &[(SESSION_HEADER, "visitor-1")]).await;
    ws.send(Message::Text("echo guest-$((40+2))\n".into()))
        .await
        .unwrap();
    read_until(&mut ws, "guest-42").await;
    assert!(guest_root(&server.layout).is_dir());
    ws.close(None).await.ok();
}

fn guest_root(layout: &WorkspaceLayout) -> std::path::PathBuf {
    layout.user_root("guest-visitor1")
}

#[tokio::test]
async fn sessions_beyond_the_cap_are_rejected() {
    let server = start_server(1).await;
    let mut first = connect(server.addr, "?project=1", &alice()).await;
    first
        .send(Message::Text("echo first-$((1+1))\n".into()))
        .await
        .unwrap();
    read_until(&mut first, "first-2").await;

    let mut second = connect(server.addr, "?project=1", &alice()).await;
    let (code, reason) = expect_close(&mut second).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "terminal capacity reached");
    assert_eq!(server.store.get(keys::ACTIVE_TERMINALS), 1);

    first.close(None).await.ok();
    wait_for_counter(&server.store, 0).await;

    let mut third = connect(server.addr, "?project=1", &alice()).await;
    third
        .send(Message::Text("echo third-$((1+2))\n".into()))
        .await
        .unwrap();
    read_until(&mut third, "third-3").await;
    third.close(None).await.ok();
}
