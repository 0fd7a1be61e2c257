use indicatif::ProgressStyle;

/// Style of the root progress bar spanning the whole run.
pub(crate) fn get_style_run() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Style of a single running task, a spinner with no progress.
pub(crate) fn get_style_task() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Installs the global tracing subscriber: a formatting layer filtered by
/// `RUST_LOG` (defaulting to `info`), with progress bars drawn by
/// `tracing-indicatif` so that log lines and bars don't trample each other.
///
/// Calling this more than once is harmless; only the first call installs
/// anything.
///
/// ```bash
/// RUST_LOG=tenmon=debug cargo run --example andes
/// ```
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use std::sync::OnceLock;

    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .map_err(|e| e.to_string())?;

        let indicatif = IndicatifLayer::new();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
            .with(indicatif)
            .try_init()
            .map_err(|e| e.to_string())
    })
    .clone()
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}
