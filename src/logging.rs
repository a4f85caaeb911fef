/// Tracing setup: a compact stdout layer plus a daily-rotated text log file,
/// both filtered through `RUST_LOG` (default "info").

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber. Fails if one is already installed.
///
/// Log files land in `log_dir` as `frontier.log.<date>`; the non-blocking
/// writer guard is leaked so logging stays alive for the whole process.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let file_appender = tracing_appender::rolling::daily(log_path, "frontier.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Box::leak(Box::new(guard));

    tracing::info!(dir = %log_path.display(), "logging initialized");
    Ok(())
}

/// Convenience wrapper placing logs under `<data_dir>/logs`.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(
    data_dir: P,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(data_dir.as_ref().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_directory_created() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("data").join("logs");
        // init_logging installs a global subscriber and can only run once per
        // process, so only the directory handling is exercised here
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
