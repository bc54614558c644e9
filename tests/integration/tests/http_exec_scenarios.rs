#![cfg(unix)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{middleware, routing::any, Router};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tau_exec::{CommandDescriptor, CommandDispatcher, ProcessRegistry, ProvisionedCommand};
use tau_exec_gateway::{
    exec_middleware, load_exec_gateway_config, serve_exec_gateway, ExecGateway,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

struct RunningGateway {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<tau_exec::ProcessShutdownReport>>,
}

impl RunningGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(mut self) -> tau_exec::ProcessShutdownReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server
            .await
            .expect("server task")
            .expect("server result")
    }
}

fn write_gateway_config(root: &Path, routes: Value) -> std::path::PathBuf {
    let path = root.join("exec-gateway.json");
    let payload = json!({
        "schema_version": 1,
        "bind": "127.0.0.1:0",
        "shutdown_grace_ms": 2000,
        "status_endpoint": "/exec/status",
        "routes": routes,
    });
    std::fs::write(&path, format!("{payload:#}\n")).expect("write gateway config");
    path
}

async fn start_gateway(root: &Path, routes: Value) -> Result<RunningGateway> {
    let config = load_exec_gateway_config(&write_gateway_config(root, routes))?;
    let gateway = ExecGateway::from_config(&config)?;
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_exec_gateway(
        listener,
        gateway,
        config.shutdown_grace(),
        async move {
            let _ = stop_rx.await;
        },
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(RunningGateway {
        addr,
        stop: Some(stop_tx),
        server,
    })
}

fn parse_sse_events(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut event = String::new();
            let mut data = Vec::new();
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = name.trim_start().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                }
            }
            (event, data.join("\n"))
        })
        .collect()
}

async fn wait_for_idle_runs(client: &Client, gateway: &RunningGateway) -> Value {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut active_runs = Value::Null;
    while Instant::now() < deadline {
        active_runs = client
            .get(gateway.url("/exec/status"))
            .send()
            .await
            .expect("status request")
            .json::<Value>()
            .await
            .expect("status payload")["active_runs"]
            .clone();
        if active_runs == json!(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    active_runs
}

async fn spawn_counting_router(
    descriptor: CommandDescriptor,
    calls: Arc<AtomicUsize>,
) -> (SocketAddr, JoinHandle<()>) {
    let command = ProvisionedCommand::provision("/hook", descriptor).expect("provision");
    let dispatcher = CommandDispatcher::new(command, ProcessRegistry::new());
    let app = Router::new().route(
        "/hook",
        any(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                "continued"
            }
        })
        .layer(middleware::from_fn_with_state(dispatcher, exec_middleware)),
    );
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, handle)
}

#[tokio::test]
async fn integration_collected_echo_returns_exact_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{"path": "/echo", "command": {"command": "echo", "args": ["hello"], "foreground": true}}]),
    )
    .await
    .expect("start gateway");

    let response = Client::new()
        .get(gateway.url("/echo"))
        .send()
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await.expect("payload"),
        json!({"status": "success", "stdout": "hello\n", "stderr": "", "exit_code": 0})
    );

    gateway.stop().await;
}

#[tokio::test]
async fn integration_detached_false_returns_server_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{"path": "/fail", "command": {"command": "false"}}]),
    )
    .await
    .expect("start gateway");

    let response = Client::new()
        .post(gateway.url("/fail"))
        .send()
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload, json!({"status": "error", "error": "exit status 1"}));
    assert!(payload.get("stdout").is_none());
    assert!(payload.get("stderr").is_none());

    gateway.stop().await;
}

#[tokio::test]
async fn integration_streamed_shell_delivers_both_channels_then_close() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{"path": "/stream", "command": {"command": "sh", "args": ["-c", "echo out; echo err 1>&2"], "stream": true}}]),
    )
    .await
    .expect("start gateway");

    let response = Client::new()
        .get(gateway.url("/stream"))
        .send()
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_sse_events(&response.text().await.expect("read stream"));

    let count = |name: &str, data: &str| {
        events
            .iter()
            .filter(|(event, payload)| event == name && payload == data)
            .count()
    };
    assert_eq!(count("stdout", "out"), 1);
    assert_eq!(count("stderr", "err"), 1);
    assert!(!events.iter().any(|(event, _)| event == "error"));
    assert_eq!(
        events.last(),
        Some(&("close".to_string(), "Command finished".to_string()))
    );

    gateway.stop().await;
}

#[tokio::test]
async fn integration_timeout_fails_near_configured_bound() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{"path": "/slow", "command": {"command": "sleep", "args": ["10"], "timeout": "400ms"}}]),
    )
    .await
    .expect("start gateway");

    let started = Instant::now();
    let response = Client::new()
        .get(gateway.url("/slow"))
        .send()
        .await
        .expect("send request");
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.json::<Value>().await.expect("payload"),
        json!({"status": "error", "error": "command timed out after 400ms"})
    );
    assert!(elapsed >= Duration::from_millis(400), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "returned after {elapsed:?}");

    gateway.stop().await;
}

#[tokio::test]
async fn integration_pass_through_invokes_continuation_exactly_once() {
    for (program, foreground) in [("true", false), ("false", false), ("true", true), ("false", true)] {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut descriptor = CommandDescriptor::new(program);
        descriptor.foreground = foreground;
        descriptor.pass_thru = true;
        let (addr, handle) = spawn_counting_router(descriptor, calls.clone()).await;

        let response = Client::new()
            .post(format!("http://{addr}/hook"))
            .send()
            .await
            .expect("send request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), "continued");
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "program={program} foreground={foreground}"
        );

        handle.abort();
    }
}

#[tokio::test]
async fn integration_stream_mode_never_invokes_continuation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut descriptor = CommandDescriptor::new("echo").with_args(["streamed"]);
    descriptor.stream = true;
    descriptor.pass_thru = true;
    let (addr, handle) = spawn_counting_router(descriptor, calls.clone()).await;

    let body = Client::new()
        .get(format!("http://{addr}/hook"))
        .send()
        .await
        .expect("send request")
        .text()
        .await
        .expect("read stream");
    let events = parse_sse_events(&body);
    assert_eq!(events.first(), Some(&("stdout".to_string(), "streamed".to_string())));
    assert_eq!(events.last().map(|(event, _)| event.as_str()), Some("close"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    handle.abort();
}

#[tokio::test]
async fn integration_concurrent_triggers_resolve_their_own_arguments() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{
            "path": "/echo",
            "command": {"command": "sh", "args": ["-c", "sleep 0.2; echo \"$0\"", "{http.request.uri.query.id}"], "foreground": true}
        }]),
    )
    .await
    .expect("start gateway");

    let client = Client::new();
    let requests = (0..6).map(|id| {
        let client = client.clone();
        let url = gateway.url(&format!("/echo?id=run-{id}"));
        tokio::spawn(async move {
            let payload = client
                .get(url)
                .send()
                .await
                .expect("send request")
                .json::<Value>()
                .await
                .expect("payload");
            (id, payload)
        })
    });
    let started = Instant::now();
    for request in requests.collect::<Vec<_>>() {
        let (id, payload) = request.await.expect("request task");
        assert_eq!(payload["stdout"], json!(format!("run-{id}\n")));
        assert_eq!(payload["exit_code"], 0);
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    gateway.stop().await;
}

#[tokio::test]
async fn integration_working_directory_is_applied() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path().join("work");
    std::fs::create_dir_all(&workdir).expect("create workdir");
    std::fs::write(workdir.join("marker.txt"), "present\n").expect("write marker");
    let gateway = start_gateway(
        temp.path(),
        json!([{
            "path": "/cat",
            "command": {"command": "cat", "args": ["marker.txt"], "directory": workdir, "foreground": true}
        }]),
    )
    .await
    .expect("start gateway");

    let payload = Client::new()
        .get(gateway.url("/cat"))
        .send()
        .await
        .expect("send request")
        .json::<Value>()
        .await
        .expect("payload");
    assert_eq!(payload["stdout"], "present\n");

    gateway.stop().await;
}

#[tokio::test]
async fn integration_stream_client_disconnect_terminates_process() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([{
            "path": "/tail",
            "command": {"command": "sh", "args": ["-c", "echo start; while true; do sleep 0.1; echo tick; done"], "stream": true, "timeout": "0"}
        }]),
    )
    .await
    .expect("start gateway");
    let client = Client::new();

    let mut response = client
        .get(gateway.url("/tail"))
        .send()
        .await
        .expect("send request");
    let first = response
        .chunk()
        .await
        .expect("read chunk")
        .expect("first chunk");
    assert!(String::from_utf8_lossy(&first).contains("start"));
    drop(response);

    assert_eq!(wait_for_idle_runs(&client, &gateway).await, json!(0));

    let report = gateway.stop().await;
    assert_eq!(report.remaining_runs, 0);
}

#[tokio::test]
async fn integration_buffered_client_disconnect_terminates_process() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gateway = start_gateway(
        temp.path(),
        json!([
            {"path": "/slow", "command": {"command": "sleep", "args": ["30"], "foreground": true, "timeout": "0"}},
            {"path": "/bg", "command": {"command": "sleep", "args": ["30"], "timeout": "0"}}
        ]),
    )
    .await
    .expect("start gateway");
    let client = Client::new();

    for path in ["/slow", "/bg"] {
        let observer = client.clone();
        let status_url = gateway.url("/exec/status");
        let observed = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            observer
                .get(status_url)
                .send()
                .await
                .expect("status request")
                .json::<Value>()
                .await
                .expect("status payload")["active_runs"]
                .clone()
        });

        let error = client
            .get(gateway.url(path))
            .timeout(Duration::from_millis(300))
            .send()
            .await
            .expect_err("client gives up before the command ends");
        assert!(error.is_timeout(), "{path}: {error}");
        assert_eq!(observed.await.expect("status task"), json!(1), "{path}");

        assert_eq!(wait_for_idle_runs(&client, &gateway).await, json!(0), "{path}");
    }

    let report = gateway.stop().await;
    assert_eq!(report.cancelled_runs, 0);
    assert_eq!(report.remaining_runs, 0);
}
