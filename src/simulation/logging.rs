use std::io;

use tracing::dispatcher::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::{fmt, registry};

use crate::simulation::config::{Config, Logging};
use crate::simulation::io::resolve_path;

// This is a helper struct to store the logger guards. When they are dropped, logging can be reset.
#[allow(dead_code)]
pub struct LogGuards {
    log_guard: Option<WorkerGuard>,
    default: DefaultGuard,
}

pub fn init_std_out_logging_thread_local() -> DefaultGuard {
    let collector = registry().with(
        fmt::Layer::new()
            .with_writer(io::stdout)
            .with_filter(LevelFilter::INFO),
    );
    tracing::subscriber::set_default(collector)
}

/// Installs the subscriber of one worker thread. Each worker writes its own json log file if
/// file logging is switched on. Only worker 0 logs to the console.
pub fn init_logging(config: &Config, worker: u32) -> LogGuards {
    let dir = resolve_path(config.context(), &config.output.output_dir);

    let (log_layer, log_guard) = if Logging::Info == config.output.logging {
        let log_file_name = format!("log_worker_{worker}.txt");
        let log_file_appender = rolling::never(&dir, log_file_name);
        let (log_file, log_guard) = non_blocking(log_file_appender);
        let layer = fmt::Layer::new()
            .with_writer(log_file)
            .json()
            .with_ansi(false)
            .with_filter(LevelFilter::INFO);
        (Some(layer), Some(log_guard))
    } else {
        (None, None)
    };

    let console_layer = (worker == 0).then(|| {
        fmt::layer()
            .with_writer(io::stdout)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(LevelFilter::INFO)
    });

    // Add `Optional`s. If None, then the corresponding layer is not added.
    let collector = registry().with(log_layer).with(console_layer);
    let default = tracing::subscriber::set_default(collector);

    LogGuards { log_guard, default }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tracing::info;

    use crate::simulation::config::{Config, Logging};
    use crate::simulation::logging::init_logging;

    #[test]
    #[serial]
    fn writes_worker_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.output_dir = dir.path().to_path_buf();
        config.output.logging = Logging::Info;

        let guards = init_logging(&config, 3);
        info!("hello from worker 3");
        drop(guards);

        let content = std::fs::read_to_string(dir.path().join("log_worker_3.txt")).unwrap();
        assert!(content.contains("hello from worker 3"));
    }
}
