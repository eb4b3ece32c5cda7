use std::path::Path;
use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Logs go to stderr so the annotated payload is the only thing printed on stdout. With a log
/// folder the same events are also written to a daily rolling file, the returned guard must be
/// held until the process exits so buffered lines are flushed.
pub async fn configure_logging(level: LevelFilter, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(stderr_log.with_filter(level))
            .init();
        return Ok(None);
    };

    tokio::fs::create_dir_all(log_dir).await
        .with_context(|| format!("creating log folder {log_dir:?}"))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "nw-reconfig.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(level);

    tracing_subscriber::registry()
        .with(
            stderr_log
                .with_filter(level)
                .and_then(file_log),
        )
        .init();
    Ok(Some(guard))
}
