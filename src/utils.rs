use indicatif::{ProgressStyle, style::TemplateError};

/// Style of the overall progress bar of a local run.
pub(crate) fn get_style_run() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Style of the spinner shown for each running task.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

/// Installs a global `tracing` subscriber printing to stderr, with progress
/// bars rendered by `tracing-indicatif`.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more than
/// once is harmless, later calls leave the first subscriber in place.
#[cfg(feature = "logging")]
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let indicatif = IndicatifLayer::new();

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    Ok(())
}
