//! Observability for the pub/sub client
//!
//! Structured logging via the tracing crate; format and level are selected
//! through environment variables so the same binary serves development and
//! fleet deployments.

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
