use thiserror::Error;
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing_log::{log_tracer::SetLoggerError, LogTracer};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    EnvFilter, FmtSubscriber,
};

const DEV_ENV_NAME: &str = "dev";
const PROD_ENV_NAME: &str = "prod";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),
}

/// Initializes tracing for the application.
///
/// In the `prod` environment (selected via `APP_ENVIRONMENT`) log events are
/// emitted as JSON lines on stdout; in `dev` they are pretty-printed for
/// terminal use. The log level defaults to `info` and can be overridden with
/// `RUST_LOG`.
pub fn init_tracing() -> Result<(), TracingError> {
    // Capture logs emitted through the `log` crate by libraries and forward
    // them to the `tracing` subscriber.
    LogTracer::init()?;

    let is_prod =
        std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEV_ENV_NAME.into()) == PROD_ENV_NAME;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    if is_prod {
        configure_prod_tracing(filter)?;
    } else {
        configure_dev_tracing(filter)?;
    }

    Ok(())
}

fn configure_prod_tracing(filter: EnvFilter) -> Result<(), TracingError> {
    let format = fmt::format()
        .with_level(true)
        // ANSI colors are only for terminal output
        .with_ansi(false)
        .with_target(false);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .json()
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;
    Ok(())
}

fn configure_dev_tracing(filter: EnvFilter) -> Result<(), TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(false);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;
    Ok(())
}
