use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::{self, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIR_ENV: &str = "RAIDBOARD_LOG_DIR";
const LOG_PREFIX: &str = "raidboard";
const LOG_SUFFIX: &str = "log";
const MAX_RETAINED_LOGS: usize = 14;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: stdout plus a daily-rotated file under
/// `log_dir` (or `RAIDBOARD_LOG_DIR` when set).
pub fn init(log_dir: &Path) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let log_dir = resolve_log_dir(log_dir)?;
    let appender = daily_appender(&log_dir)?;
    let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            let _ = FILE_GUARD.set(guard);
            install_panic_hook();
        }
        Err(_) => {
            // Subscriber already installed elsewhere; drop guard so the worker thread exits.
            drop(guard);
        }
    }

    Ok(())
}

fn daily_appender(log_dir: &Path) -> Result<RollingFileAppender> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(MAX_RETAINED_LOGS)
        .build(log_dir)
        .with_context(|| format!("failed to open log directory {}", log_dir.display()))
}

fn resolve_log_dir(configured: &Path) -> Result<PathBuf> {
    let path = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => configured.to_path_buf(),
    };
    if path.is_absolute() {
        return Ok(path);
    }
    let base = std::env::current_dir().context("failed to resolve current working directory")?;
    Ok(base.join(path))
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appender_writes_prefixed_file() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("logs");
        let mut appender = daily_appender(&dir).unwrap();

        appender.write_all(b"first line\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(LOG_PREFIX));
        assert!(names[0].ends_with(LOG_SUFFIX));
    }
}
