use crate::{errors::Error, Result};

/// Initialize tracing for the service.
///
/// Logs go to stderr: stdout may be the reply channel of the event source.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    // Default: info for our crates. Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,bbot=info,bbot_core=info,bbot_stdio=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::External(format!("logging init failed: {e}")))
}
