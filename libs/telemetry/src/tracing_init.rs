use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSettings;

static INIT: OnceLock<()> = OnceLock::new();

/// Keeps the background file writer alive; drop it last on shutdown so
/// buffered lines are flushed.
#[must_use]
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

pub fn install(settings: &LogSettings) -> Result<TelemetryGuard> {
    if INIT.get().is_some() {
        return Ok(TelemetryGuard { _file: None });
    }

    let env_filter = env_filter(settings)?;

    let stdout = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let mut layers = vec![stdout];

    let mut file_guard = None;
    if let Some(path) = &settings.file {
        let (dir, name) = split_log_path(path)?;
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        let file_layer = if settings.json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(writer)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed()
        };
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .ok();

    INIT.set(()).ok();
    Ok(TelemetryGuard { _file: file_guard })
}

fn env_filter(settings: &LogSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .with_context(|| format!("invalid log level `{}`", settings.level)),
    }
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("log file `{}` has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_defaults_to_current_dir() {
        let (dir, name) = split_log_path(Path::new("service.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "service.log");
        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn bad_levels_are_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let settings = LogSettings {
            level: "imp_rpc=loud".into(),
            ..LogSettings::default()
        };
        assert!(env_filter(&settings).is_err());
        assert!(env_filter(&LogSettings::default()).is_ok());
    }
}
