use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 프로세스가 끝날 때까지 들고 있어야 하는 로그 가드.
/// 드롭되면 버퍼에 남은 파일 로그가 유실된다.
pub struct LogGuards {
    _file_guard: WorkerGuard,
}

/// stdout + 일 단위 회전 파일 로그 초기화.
///
/// 필터는 `RUST_LOG`를 따르며 없으면 `ledger=info,warn`.
/// 이미 전역 subscriber가 설치되어 있으면 조용히 무시한다.
/// 로그 디렉토리를 만들 수 없으면 아무것도 설치하지 않고 에러를 돌려준다.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<LogGuards> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "ledger.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledger=info,warn"));
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledger=debug,warn"));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(stdout_filter);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(file_filter);

    let _ = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unusable_log_dir_is_an_error() {
        // 일반 파일 아래에는 디렉토리를 만들 수 없다
        let blocker = std::env::temp_dir().join(format!("ledger-log-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = init_tracing(&blocker.join("logs"));
        std::fs::remove_file(&blocker).unwrap();

        assert!(result.is_err());
    }
}
