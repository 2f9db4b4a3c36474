//! Logging and tracing setup.
//!
//! The engine logs through `tracing` with structured fields (`address`,
//! `action`, `attempt`, `delay_ms`); every executor action runs inside an
//! `action` span. These helpers install a `tracing-subscriber` formatter that
//! writes to **stderr**, leaving stdout free for rendered plans and JSON
//! output.
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_engine::{init_logging, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads RUST_LOG, defaults to info
//!     init_logging();
//!
//!     let plan = engine.plan(&config).await?;
//!     println!("{}", plan.render());
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `hemmer_engine=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Show retries and state writes
//! RUST_LOG=hemmer_engine=debug ./my-tool apply
//!
//! # Only the executor
//! RUST_LOG=warn,hemmer_engine::executor=debug ./my-tool apply
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the default logging subscriber.
///
/// This sets up a `tracing` subscriber that:
/// - Writes to **stderr**
/// - Respects the `RUST_LOG` environment variable for filtering
/// - Defaults to `info` level if `RUST_LOG` is not set
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level.
///
/// Like [`init_logging`], but `default_level` is used when `RUST_LOG` is not
/// set.
///
/// # Example
///
/// ```ignore
/// use hemmer_engine::init_logging_with_default;
///
/// // Show every retry while debugging a flaky provider
/// init_logging_with_default("hemmer_engine=debug");
/// ```
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning false if already initialized.
///
/// Unlike [`init_logging`], this function does not panic if a subscriber
/// has already been set, which makes it safe to call from tests.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}
