use std::time::Duration;

use mockito::{Matcher, Server};
use serde_json::json;
use toolgate_core::{
    AuditFilter, AuditOutcome, BackendError, FailureKind, SandboxBackend, SandboxConfig,
    SessionHandle, SessionSpec, ToolInput,
};
use toolgate_remote::{executor_for, HttpBackendConfig, HttpSandboxBackend};

fn backend(server: &Server) -> HttpSandboxBackend {
    HttpSandboxBackend::new(HttpBackendConfig::new(&server.url()).with_token("sk-test")).unwrap()
}

fn handle() -> SessionHandle {
    SessionHandle::new("sbx-1")
}

#[tokio::test]
async fn connect_sends_spec_and_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/sandboxes")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "template": "base",
            "workingDirectory": "/workspace"
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"sbx-1"}"#)
        .create_async()
        .await;

    let spec = SessionSpec::from_config(&SandboxConfig::memory());
    let handle = backend(&server).connect(&spec).await.unwrap();

    mock.assert_async().await;
    assert_eq!(handle.id, "sbx-1");
}

#[tokio::test]
async fn execute_command_maps_response() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/sandboxes/sbx-1/commands")
        .match_body(Matcher::Json(json!({
            "command": "ls -la",
            "cwd": "/workspace",
            "timeoutSeconds": 45
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"stdout":"a.txt\n","stderr":"","exitCode":0}"#)
        .create_async()
        .await;

    let out = backend(&server)
        .execute_command(&handle(), "ls -la", "/workspace", Duration::from_secs(45))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(out.stdout, "a.txt\n");
    assert!(out.success());
}

#[tokio::test]
async fn read_file_passes_path_as_query() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/sandboxes/sbx-1/files")
        .match_query(Matcher::UrlEncoded("path".into(), "/workspace/a b.txt".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"content":"hello"}"#)
        .create_async()
        .await;

    let content = backend(&server)
        .read_file(&handle(), "/workspace/a b.txt")
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(content, "hello");
}

#[tokio::test]
async fn client_errors_are_operation_failures() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/sandboxes/sbx-1/files")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"error":"no such file: /workspace/missing"}"#)
        .create_async()
        .await;

    let err = backend(&server)
        .read_file(&handle(), "/workspace/missing")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::Operation("no such file: /workspace/missing".into())
    );
}

#[tokio::test]
async fn server_errors_and_gone_sandboxes_are_transport_failures() {
    let mut server = Server::new_async().await;
    server
        .mock("PUT", "/sandboxes/sbx-1/files")
        .with_status(503)
        .with_body("upstream overloaded")
        .create_async()
        .await;
    server
        .mock("POST", "/sandboxes/sbx-1/search")
        .with_status(410)
        .create_async()
        .await;

    let b = backend(&server);
    let err = b.write_file(&handle(), "/workspace/a", "x").await.unwrap_err();
    assert!(err.is_transport());
    assert!(err.to_string().contains("upstream overloaded"));

    let err = b.search_files(&handle(), "TODO", "/workspace").await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn unreachable_service_is_transport_failure() {
    let b = HttpSandboxBackend::new(
        HttpBackendConfig::new("http://127.0.0.1:1").with_request_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let spec = SessionSpec::from_config(&SandboxConfig::memory());
    let err = b.connect(&spec).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn close_tolerates_already_deleted_sandbox() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/sandboxes/sbx-1")
        .with_status(410)
        .create_async()
        .await;
    server
        .mock("DELETE", "/sandboxes/sbx-2")
        .with_status(500)
        .create_async()
        .await;

    let b = backend(&server);
    b.close(&handle()).await.unwrap();
    assert!(b.close(&SessionHandle::new("sbx-2")).await.is_err());
}

#[tokio::test]
async fn executor_runs_tool_calls_against_service() {
    let mut server = Server::new_async().await;
    let create = server
        .mock("POST", "/sandboxes")
        .with_status(201)
        .with_body(r#"{"id":"sbx-9"}"#)
        .expect(1)
        .create_async()
        .await;
    let run = server
        .mock("POST", "/sandboxes/sbx-9/commands")
        .match_body(Matcher::PartialJson(json!({"command": "cargo --version"})))
        .with_status(200)
        .with_body(r#"{"stdout":"cargo 1.80.0\n","stderr":"","exitCode":0}"#)
        .create_async()
        .await;
    let search = server
        .mock("POST", "/sandboxes/sbx-9/search")
        .match_body(Matcher::PartialJson(json!({"query": "fn main"})))
        .with_status(200)
        .with_body(
            json!({"matches": [
                {"path": "/workspace/src/main.rs", "line": 1, "text": "fn main() {}"}
            ]})
            .to_string(),
        )
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", "/sandboxes/sbx-9")
        .with_status(204)
        .create_async()
        .await;

    let config = SandboxConfig::default()
        .with_endpoint(server.url())
        .with_api_key("sk-test");
    let exec = executor_for(config).unwrap();

    let result = exec
        .execute(ToolInput::new("Bash", json!({"command": "cargo --version"})))
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "cargo 1.80.0\n");
    assert_eq!(result.sandbox_id.as_deref(), Some("sbx-9"));

    let result = exec
        .execute(ToolInput::new("Grep", json!({"pattern": "fn main"})))
        .await;
    assert_eq!(result.output, "/workspace/src/main.rs:1:fn main() {}\n");

    let rejected = exec
        .execute(ToolInput::new("Bash", json!({"command": "rm -rf /"})))
        .await;
    assert_eq!(rejected.failure, Some(FailureKind::Rejected));

    let audit = exec.get_audit_logs(&AuditFilter::new());
    assert_eq!(audit.len(), 3);
    assert_eq!(audit[2].outcome, AuditOutcome::Rejected);

    exec.shutdown().await;

    create.assert_async().await;
    run.assert_async().await;
    search.assert_async().await;
    delete.assert_async().await;
}
