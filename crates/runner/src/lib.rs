//! Settings file loading and backend selection.
//!
//! ```yaml
//! backend:
//!   kind: docker
//!   image: python:3.12-slim
//! limits:
//!   preset: testing
//!   timeout_seconds: 20
//! ```

mod config;
mod connect;
mod error;

pub use config::{BackendSettings, Settings, load};
pub use connect::{connect, connect_with_metrics};
pub use error::{RunnerError, RunnerResult};
