//! Tracing initialization
//!
//! Logs always go to stderr: stdout carries protocol traffic when the
//! gateway is exposed over stdio.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with `info` as the default level for `crate_name`.
///
/// Set `LOG_FORMAT=json` for structured JSON output.
pub fn init_tracing(crate_name: &str) -> anyhow::Result<()> {
    init_tracing_with_level(crate_name, "info")
}

/// Initialize tracing with an explicit default level for `crate_name`.
///
/// `RUST_LOG` directives still take part in filtering; the crate directive
/// is added on top of them.
pub fn init_tracing_with_level(crate_name: &str, level: &str) -> anyhow::Result<()> {
    let directive = format!("{}={}", crate_name, level);
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}
