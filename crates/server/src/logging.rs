//! Daemon log setup: one JSON (or pretty) log file per day under the data
//! dir, filtered by `FLEETDOCK_LOG_FILTER`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const LOG_PREFIX: &str = "fleetdock";
const LOG_SUFFIX: &str = "log";
/// Daily files kept before the appender deletes the oldest.
const KEEP_DAYS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging knobs read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub filter: String,
    pub format: LogFormat,
    pub run_id: String,
}

impl LogOptions {
    /// `FLEETDOCK_LOG_FILTER` > `RUST_LOG` > `info`; JSON unless
    /// `FLEETDOCK_LOG_FORMAT=pretty`; `FLEETDOCK_RUN_ID` or a pid-based id.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = var("FLEETDOCK_LOG_FILTER")
            .or_else(|| var("RUST_LOG"))
            .filter(|f| EnvFilter::try_new(f).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = match var("FLEETDOCK_LOG_FORMAT") {
            Some(f) if f.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        let run_id = var("FLEETDOCK_RUN_ID").unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            format!("pid-{}-{}", std::process::id(), now)
        });
        Self {
            filter,
            format,
            run_id,
        }
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

/// Install the global subscriber writing `<log_dir>/fleetdock.<date>.log`.
pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let options = LogOptions::from_lookup(|key| std::env::var(key).ok());

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(KEEP_DAYS)
        .build(log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let registry = tracing_subscriber::registry().with(EnvFilter::new(&options.filter));
    match options.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %options.run_id,
        log_dir = %log_dir.display(),
        format = ?options.format,
        filter = %options.filter,
    );

    Ok(LoggingHandle {
        run_id: options.run_id,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_json_info_with_pid_run_id() {
        let options = LogOptions::from_lookup(lookup(&[]));
        assert_eq!(options.filter, "info");
        assert_eq!(options.format, LogFormat::Json);
        assert!(options.run_id.starts_with(&format!("pid-{}-", std::process::id())));
    }

    #[test]
    fn own_filter_wins_over_rust_log() {
        let options = LogOptions::from_lookup(lookup(&[
            ("FLEETDOCK_LOG_FILTER", "fleetdock=debug"),
            ("RUST_LOG", "warn"),
            ("FLEETDOCK_LOG_FORMAT", "PRETTY"),
            ("FLEETDOCK_RUN_ID", "run-7"),
        ]));
        assert_eq!(options.filter, "fleetdock=debug");
        assert_eq!(options.format, LogFormat::Pretty);
        assert_eq!(options.run_id, "run-7");
    }

    #[test]
    fn unparsable_filter_falls_back() {
        let options = LogOptions::from_lookup(lookup(&[("RUST_LOG", "fleetdock=loud")]));
        assert_eq!(options.filter, "info");
    }
}
