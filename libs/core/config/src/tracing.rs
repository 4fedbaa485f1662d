use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() so startup errors render with location info.
/// Safe to call multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Default filter when `RUST_LOG` is unset.
fn default_filter(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info"
    } else {
        "debug"
    }
}

/// Initialize tracing with environment-aware output and span trace capture.
///
/// - **Production** (`APP_ENV=production`): flattened JSON events for log
///   aggregation, no module targets.
/// - **Development** (default): pretty, human-readable output.
///
/// Both install `tracing_error::ErrorLayer` so eyre reports carry span traces.
/// `RUST_LOG` overrides the default filter (e.g. `ingest_pipeline=trace`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(environment)));

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => info!(environment = ?environment, "Tracing initialized"),
        // Already initialized (common in tests)
        Err(_) => debug!("Tracing already initialized, skipping re-initialization"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_per_environment() {
        assert_eq!(default_filter(&Environment::Production), "info");
        assert_eq!(default_filter(&Environment::Development), "debug");
    }

    #[test]
    fn test_init_tracing_multiple_calls() {
        init_tracing(&Environment::Development);
        init_tracing(&Environment::Production);
        init_tracing(&Environment::Development);
    }

    #[test]
    fn test_init_tracing_with_rust_log_env() {
        temp_env::with_var("RUST_LOG", Some("ingest_pipeline=trace"), || {
            init_tracing(&Environment::Development);
        });
    }
}
