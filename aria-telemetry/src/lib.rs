//! # Aria Telemetry
//!
//! Structured logging for the Aria voice agent, built on `tracing`.
//!
//! ## Usage
//!
//! ```rust
//! use aria_telemetry::{init_telemetry, info};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_telemetry("voice-console")?;
//!     info!("ready");
//!     Ok(())
//! }
//! ```

pub mod init;
pub mod spans;

// Re-export tracing macros for convenience
pub use tracing::{Span, debug, error, info, instrument, trace, warn};

pub use init::{LogFormat, TelemetryConfig, TelemetryError, init_telemetry, init_with_config};
pub use spans::*;
