use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs the global subscriber. `RUST_LOG` wins over `filter` when set.
///
/// With a `log_path` the output goes to a daily-rolling file next to that path; the returned
/// guard flushes it and must live as long as the process.
pub fn init_tracing(filter: &str, log_path: Option<&str>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            let path = Path::new(path);
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "cabot-dashboard.log".into());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            Registry::default().with(env_filter).with(fmt_layer).init();
            Some(guard)
        }
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
            Registry::default().with(env_filter).with(fmt_layer).init();
            None
        }
    }
}
