use async_trait::async_trait;

use crate::error::Result;
use crate::limits::ResourceLimits;
use crate::result::ExecutionResult;

/// Runs untrusted code in one ephemeral, resource-bounded unit per call.
///
/// Backends share helpers from [`crate::unit`] and [`crate::output`] rather
/// than a base implementation. `execute` returns `Err` only when the unit
/// could not be provisioned or supervised; anything the code itself does,
/// including overrunning its timeout, comes back as an [`ExecutionResult`].
/// Every unit created by a call is gone by the time the call returns.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short backend name (e.g. "docker"), used in logs and metric tags.
    fn backend(&self) -> &str;

    fn limits(&self) -> &ResourceLimits;

    async fn execute(&self, code: &str) -> Result<ExecutionResult>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::output::attribute_merged_output;
    use crate::unit::{Stopwatch, reject_blank};

    /// Echoes the code back as merged output; exits 1 when it contains "fail".
    struct EchoSandbox {
        limits: ResourceLimits,
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        fn backend(&self) -> &str {
            "echo"
        }

        fn limits(&self) -> &ResourceLimits {
            &self.limits
        }

        async fn execute(&self, code: &str) -> Result<ExecutionResult> {
            if let Some(rejected) = reject_blank(code) {
                return Ok(rejected);
            }
            let stopwatch = Stopwatch::start();
            let exit_code = if code.contains("fail") { 1 } else { 0 };
            let output = attribute_merged_output(code.to_owned(), exit_code);
            Ok(ExecutionResult::completed(
                output.stdout,
                output.stderr,
                exit_code,
                stopwatch.elapsed(),
            ))
        }
    }

    #[tokio::test]
    async fn shared_across_tasks_as_trait_object() {
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox {
            limits: ResourceLimits::testing(),
        });

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sandbox = Arc::clone(&sandbox);
                tokio::spawn(async move { sandbox.execute(&format!("print({i})")).await })
            })
            .collect();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert!(result.success());
            assert!(result.stdout().starts_with("print("));
        }
        assert_eq!(sandbox.limits(), &ResourceLimits::testing());
    }

    #[tokio::test]
    async fn error_output_lands_in_stderr() {
        let sandbox = EchoSandbox {
            limits: ResourceLimits::default(),
        };
        let result = sandbox.execute("fail with ValueError").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.stderr(), "fail with ValueError");
        assert!(result.stdout().is_empty());

        let result = sandbox.execute(" ").await.unwrap();
        assert!(result.error_message().unwrap().contains("empty input"));
    }
}
