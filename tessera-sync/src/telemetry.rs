//! Tracing subscriber setup for binaries.
//!
//! Library code only emits events; whoever owns `main` decides where they
//! go by calling [`init_tracing`] once at startup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "tessera=info,tessera_core=info,tessera_storage=info,tessera_sync=info";

/// Install a fmt subscriber filtered by `RUST_LOG`. Output is JSON when
/// `TESSERA_LOG_JSON=1`.
pub fn init_tracing() -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = json_requested(std::env::var("TESSERA_LOG_JSON").ok().as_deref());

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::debug!(json, "tracing initialized");
    Ok(())
}

fn json_requested(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true"))
}
