//! Rate limiting under concurrency, through the limiter and the executor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use toolgate_core::{
    FailureKind, MemorySandbox, RateLimitConfig, RateLimiter, SandboxBackend, SandboxConfig,
    SandboxExecutor, ToolInput,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_checks_never_exceed_limit() {
    for max in [1u32, 3, 17] {
        let limiter = Arc::new(RateLimiter::new(max, Duration::from_secs(3600)));
        let admitted = Arc::new(AtomicU32::new(0));

        let handles = (0..100).map(|_| {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            tokio::spawn(async move {
                if limiter.check("shared").allowed {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        for joined in join_all(handles).await {
            joined.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), max);
    }
}

#[tokio::test(start_paused = true)]
async fn test_window_resets_rather_than_accumulates() {
    let limiter = RateLimiter::new(3, Duration::from_secs(60));
    for _ in 0..3 {
        assert!(limiter.check("x").allowed);
    }
    assert!(!limiter.check("x").allowed);

    tokio::time::advance(Duration::from_secs(60)).await;
    for _ in 0..3 {
        assert!(limiter.check("x").allowed);
    }
    assert!(!limiter.check("x").allowed);
}

#[tokio::test(start_paused = true)]
async fn test_executor_rejects_over_limit_without_touching_sandbox() {
    let mem = Arc::new(MemorySandbox::new());
    let backend: Arc<dyn SandboxBackend> = mem.clone();
    let config = SandboxConfig {
        rate_limit: Some(RateLimitConfig {
            max_requests: 2,
            window_seconds: 60,
            retention_windows: 2,
        }),
        ..SandboxConfig::memory()
    };
    let exec = SandboxExecutor::new(config, backend).unwrap();

    let call = || ToolInput::new("Bash", json!({"command": "echo hi"})).with_caller("agent-7");
    assert!(exec.execute(call()).await.success);
    assert!(exec.execute(call()).await.success);

    let limited = exec.execute(call()).await;
    assert_eq!(limited.failure, Some(FailureKind::Rejected));
    let error = limited.error.unwrap();
    assert!(error.starts_with("rate limit exceeded: "), "{error}");
    assert!(error.contains("agent-7"));
    assert_eq!(mem.commands().len(), 2);

    let other = exec
        .execute(ToolInput::new("Bash", json!({"command": "echo hi"})).with_caller("agent-8"))
        .await;
    assert!(other.success);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(exec.execute(call()).await.success);
}

#[tokio::test]
async fn test_rate_limit_disabled() {
    let mem = Arc::new(MemorySandbox::new());
    let backend: Arc<dyn SandboxBackend> = mem.clone();
    let config = SandboxConfig {
        rate_limit: None,
        ..SandboxConfig::memory()
    };
    let exec = SandboxExecutor::new(config, backend).unwrap();
    assert!(exec.security().rate_limiter().is_none());
    for _ in 0..150 {
        assert!(exec
            .execute(ToolInput::new("Read", json!({"file_path": "missing"})))
            .await
            .failure
            .is_some_and(|f| f != FailureKind::Rejected));
    }
}
