use std::time::Duration;

use serde::Serialize;

/// Conventional exit code reported for runs killed by the wall-clock limit.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code reported when execution never started or its status is unknown.
pub const GENERIC_FAILURE_EXIT_CODE: i64 = 1;

/// Outcome of one `execute()` call.
///
/// Fields are private and only set through the constructors, which keep
/// `success == (exit_code == 0 && !timed_out)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    stdout: String,
    stderr: String,
    exit_code: i64,
    /// Seconds from the start of provisioning to the start of teardown.
    execution_time: f64,
    success: bool,
    timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_used_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl ExecutionResult {
    /// The unit ran to completion (successfully or not).
    pub fn completed(stdout: String, stderr: String, exit_code: i64, elapsed: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            execution_time: elapsed.as_secs_f64(),
            success: exit_code == 0,
            timed_out: false,
            memory_used_mb: None,
            error_message: None,
        }
    }

    /// The unit overran its wall-clock limit and was stopped.
    pub fn timeout(stdout: String, stderr: String, timeout_seconds: u32, elapsed: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            execution_time: elapsed.as_secs_f64(),
            success: false,
            timed_out: true,
            memory_used_mb: None,
            error_message: Some(format!(
                "execution timed out after {timeout_seconds} seconds"
            )),
        }
    }

    /// Execution was refused or could not produce an exit status.
    pub fn rejected(message: impl Into<String>, elapsed: Duration) -> Self {
        let message = message.into();
        Self {
            stdout: String::new(),
            stderr: message.clone(),
            exit_code: GENERIC_FAILURE_EXIT_CODE,
            execution_time: elapsed.as_secs_f64(),
            success: false,
            timed_out: false,
            memory_used_mb: None,
            error_message: Some(message),
        }
    }

    pub fn with_memory_used_mb(mut self, memory_used_mb: Option<f64>) -> Self {
        self.memory_used_mb = memory_used_mb;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn execution_time(&self) -> f64 {
        self.execution_time
    }

    pub fn execution_duration(&self) -> Duration {
        Duration::from_secs_f64(self.execution_time)
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn memory_used_mb(&self) -> Option<f64> {
        self.memory_used_mb
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Short label for logs and metric tags.
    pub fn outcome(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.success {
            "success"
        } else {
            "failure"
        }
    }
}
