//! Sandbox integration tests
//!
//! Blocked code must never produce side effects, and script modules run every
//! hook as a sandboxed execution.

#![cfg(unix)]

mod common;

use common::*;
use module_runtime::config::SandboxConfig;
use module_runtime::module::registry::RegistryMetadata;
use module_runtime::module::{ModuleError, ModuleStatus, Sandbox};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TENANT: &str = "tenant-t";

fn sandbox(max_cpu_seconds: u64) -> Sandbox {
    Sandbox::new(SandboxConfig {
        max_cpu_seconds,
        ..SandboxConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_blocked_code_has_no_side_effects() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("marker");
    let sandbox = sandbox(2);
    let ctx = sandbox.create_context("tenant-t/billing", None);

    let mut bindings = HashMap::new();
    bindings.insert("MARKER".to_string(), marker.display().to_string());

    let err = sandbox
        .execute(&ctx, "eval \"echo x\"\ntouch \"$MARKER\"", &bindings)
        .await
        .unwrap_err();
    match err {
        ModuleError::SecurityViolation { operation, .. } => assert_eq!(operation, "eval"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!marker.exists());

    let stats = sandbox.stats("tenant-t/billing").await;
    assert_eq!(stats.violations, 1);
    assert_eq!(stats.executions, 0);
    assert_eq!(stats.last_runtime, Duration::ZERO);

    // The same code without the blocked word runs
    let output = sandbox
        .execute(&ctx, "touch \"$MARKER\"", &bindings)
        .await
        .unwrap();
    assert!(output.success());
    assert!(marker.exists());
}

#[tokio::test]
async fn test_namespace_cannot_be_bypassed() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("escaped");
    let sandbox = sandbox(2);
    let ctx = sandbox.create_context("tenant-t/billing", None);

    let attempts = [
        ("/usr/bin/id -u".to_string(), "path"),
        (format!("printf x > {}", marker.display()), "redirection"),
        ("e''val 'touch escaped'".to_string(), "eval"),
        ("CMD=touch; \"$CMD\" escaped".to_string(), "dynamic-command"),
    ];
    for (code, expected) in &attempts {
        match sandbox.execute(&ctx, code, &HashMap::new()).await {
            Err(ModuleError::SecurityViolation { operation, .. }) => {
                assert_eq!(operation, *expected, "code: {}", code)
            }
            other => panic!("{} was not rejected: {:?}", code, other),
        }
    }
    assert!(!marker.exists());

    let stats = sandbox.stats("tenant-t/billing").await;
    assert_eq!(stats.violations, attempts.len() as u64);
    assert_eq!(stats.executions, 0);
}

#[tokio::test]
async fn test_environment_is_cleared() {
    std::env::set_var("MODRT_HOST_SECRET", "hunter2");
    let sandbox = sandbox(2);
    let ctx = sandbox.create_context("tenant-t/billing", None);

    let output = sandbox
        .execute(&ctx, "printf '%s' \"$MODRT_HOST_SECRET\"", &HashMap::new())
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout, "");
}

#[tokio::test]
async fn test_terminate_interrupts_running_execution() {
    let sandbox = Arc::new(sandbox(10));
    let runner = sandbox.clone();
    let handle = tokio::spawn(async move {
        let ctx = runner.create_context("tenant-t/billing", None);
        runner.execute(&ctx, "sleep 5", &HashMap::new()).await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    sandbox.terminate("tenant-t/billing").await;

    let result = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ModuleError::Terminated(_))));
}

#[tokio::test]
async fn test_modules_do_not_share_execution_state() {
    let sandbox = Arc::new(sandbox(2));
    let ctx_a = sandbox.create_context("tenant-a/billing", None);
    let ctx_b = sandbox.create_context("tenant-b/billing", None);

    let env = HashMap::new();
    let (a, b) = tokio::join!(
        sandbox.execute(&ctx_a, "printf a", &env),
        sandbox.execute(&ctx_b, "printf b", &env),
    );
    assert_eq!(a.unwrap().stdout, "a");
    assert_eq!(b.unwrap().stdout, "b");

    assert_eq!(sandbox.stats("tenant-a/billing").await.executions, 1);
    assert_eq!(sandbox.stats("tenant-b/billing").await.executions, 1);
}

#[tokio::test]
async fn test_script_with_blocked_operation_fails_activation() {
    let fixture = ModuleTestFixture::new(&[]);
    let dir = fixture.artifact_dir("reporter", "1.0.0");
    write_artifact(
        &dir,
        "reporter",
        "1.0.0",
        "runtime = \"script\"\nhooks = [\"initialize\", \"cleanup\"]\n",
        "eval \"$MODULE_CONFIG\"\n",
    );
    fixture
        .publish_dir("reporter", "1.0.0", RegistryMetadata::default(), &dir)
        .await;

    fixture.manager.install(TENANT, "reporter", None, None).await.unwrap();
    let err = fixture.manager.activate(TENANT, "reporter").await.unwrap_err();
    assert!(matches!(err, ModuleError::SecurityViolation { .. }));

    assert_eq!(fixture.status(TENANT, "reporter").await, Some(ModuleStatus::Error));
    assert!(fixture.manager.get_loaded(TENANT, "reporter").await.is_none());
}

#[tokio::test]
async fn test_script_module_runs_hooks_in_sandbox() {
    let fixture = ModuleTestFixture::new(&[]);
    let dir = fixture.artifact_dir("reporter", "1.0.0");
    write_artifact(
        &dir,
        "reporter",
        "1.0.0",
        "runtime = \"script\"\nhooks = [\"initialize\", \"cleanup\", \"health_check\"]\n",
        "case \"$MODULE_HOOK\" in\n  initialize) touch started ;;\n  health_check) printf healthy ;;\nesac\n",
    );
    fixture
        .publish_dir("reporter", "1.0.0", RegistryMetadata::default(), &dir)
        .await;

    fixture.manager.install(TENANT, "reporter", None, None).await.unwrap();
    fixture.manager.activate(TENANT, "reporter").await.unwrap();

    let data_dir = fixture
        .manager
        .config()
        .data_dir
        .join(TENANT)
        .join("reporter");
    assert!(data_dir.join("started").exists());

    let summary = fixture.manager.run_health_sweep().await;
    assert_eq!(summary.healthy, 1);

    let health = fixture.manager.get_health(TENANT, "reporter").await.unwrap();
    assert_eq!(health.status, ModuleStatus::Active);
    assert!(health.sandbox.executions >= 2);

    fixture.manager.deactivate(TENANT, "reporter").await.unwrap();
    fixture.manager.uninstall(TENANT, "reporter").await.unwrap();
    assert!(!data_dir.exists());
}
