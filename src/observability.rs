//! Logging setup and optional span instrumentation.

pub use flowmaster_observability_macros::obs;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// `EnvFilter` directives; falls back to `RUST_LOG`, then `info`.
    pub log_filter: Option<String>,
}

pub fn init(options: ObservabilityOptions) {
    let filter = match options.log_filter {
        Some(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            eprintln!("invalid log filter {directives:?}: {err}");
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }
}
