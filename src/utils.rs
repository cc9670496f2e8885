use indicatif::ProgressStyle;

/// Installs a global subscriber that logs to stderr without tearing the
/// progress bars, filtered by `RUST_LOG` (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let indicatif = IndicatifLayer::new().with_progress_style(get_style_task());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}

pub(crate) fn get_style_run() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub(crate) fn get_style_task() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {span_name} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
