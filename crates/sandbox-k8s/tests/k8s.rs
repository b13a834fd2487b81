//! End-to-end tests against a live cluster reachable through the local
//! kubeconfig. Run with `cargo test -p sandbox-k8s -- --ignored`.
//!
//! `SANDBOX_K8S_NAMESPACE` selects the namespace (default `default`).

use sandbox::{ResourceLimits, Sandbox, SandboxError, TIMEOUT_EXIT_CODE};
use sandbox_k8s::{KubernetesConfig, OrchestratorSandbox};

fn config() -> KubernetesConfig {
    KubernetesConfig {
        namespace: std::env::var("SANDBOX_K8S_NAMESPACE").unwrap_or_else(|_| "default".to_owned()),
        ..KubernetesConfig::default()
    }
}

async fn sandbox(limits: ResourceLimits) -> OrchestratorSandbox {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    OrchestratorSandbox::connect(config(), limits)
        .await
        .expect("reachable cluster")
}

#[tokio::test]
#[ignore = "requires a kubernetes cluster"]
async fn hello_world_succeeds() {
    let limits = ResourceLimits::testing()
        .to_builder()
        .timeout_seconds(120)
        .build()
        .unwrap();
    let sandbox = sandbox(limits).await;
    let result = sandbox.execute("print('Hello, World!')").await.unwrap();

    assert!(result.success(), "{result:?}");
    assert_eq!(result.exit_code(), 0);
    assert!(result.stdout().contains("Hello, World!"));
    assert!(result.stderr().is_empty());
}

#[tokio::test]
#[ignore = "requires a kubernetes cluster"]
async fn traceback_is_attributed_to_stderr() {
    let limits = ResourceLimits::testing()
        .to_builder()
        .timeout_seconds(120)
        .build()
        .unwrap();
    let sandbox = sandbox(limits).await;
    let result = sandbox.execute("raise ValueError('Test error')").await.unwrap();

    assert!(!result.success());
    assert_ne!(result.exit_code(), 0);
    assert!(result.stderr().contains("ValueError"), "{result:?}");
    assert!(result.stdout().is_empty());
}

#[tokio::test]
#[ignore = "requires a kubernetes cluster"]
async fn overrun_times_out() {
    let limits = ResourceLimits::testing()
        .to_builder()
        .timeout_seconds(2)
        .build()
        .unwrap();
    let sandbox = sandbox(limits).await;
    let result = sandbox.execute("import time; time.sleep(60)").await.unwrap();

    assert!(result.timed_out());
    assert!(!result.success());
    assert_eq!(result.exit_code(), TIMEOUT_EXIT_CODE);
    assert!(result.execution_time() >= 2.0, "{}", result.execution_time());
    assert!(result.execution_time() < 3.0, "{}", result.execution_time());
}

#[tokio::test]
#[ignore = "requires a kubernetes cluster"]
async fn missing_namespace_fails_construction() {
    let config = KubernetesConfig {
        namespace: "sandbox-k8s-no-such-namespace".to_owned(),
        ..KubernetesConfig::default()
    };
    let err = OrchestratorSandbox::connect(config, ResourceLimits::testing())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SandboxError::NamespaceNotFound(_)), "got: {err}");
}
