use std::env;
use std::path::PathBuf;

use crate::record::RecordError;

/// 원장 저장소 및 로깅 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// SeaORM 접속 URL (예: "sqlite://ledger.db?mode=rwc", "sqlite::memory:")
    pub database_url: String,
    /// 커넥션 풀 최대 크기
    pub max_connections: u32,
    /// sqlx 쿼리 로그 출력 여부
    pub sqlx_logging: bool,
    /// 로그 파일 디렉토리
    pub log_dir: PathBuf,
}

impl LedgerConfig {
    /// 환경 변수(.env 포함)에서 설정을 읽는다.
    ///
    /// - `LEDGER_DATABASE_URL`: 접속 URL을 직접 지정 (없으면 `DB_PATH` 사용)
    /// - `DB_PATH`: SQLite 파일 경로 (기본값: "ledger.db")
    /// - `LEDGER_DB_MAX_CONNECTIONS`: 풀 크기 (기본값: 5)
    /// - `LEDGER_SQLX_LOGGING`: "1"/"true"면 쿼리 로그 출력
    /// - `LEDGER_LOG_DIR`: 로그 디렉토리 (기본값: "logs")
    pub fn from_env() -> Result<Self, RecordError> {
        dotenv::dotenv().ok();

        let database_url = match env::var("LEDGER_DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => {
                let db_path = env::var("DB_PATH").unwrap_or_else(|_| "ledger.db".to_string());
                sqlite_url_for_path(&db_path)?
            }
        };

        let max_connections = match env::var("LEDGER_DB_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse::<u32>().map_err(|e| {
                RecordError::Other(format!("Invalid LEDGER_DB_MAX_CONNECTIONS '{}': {}", raw, e))
            })?,
            Err(_) => 5,
        };

        let sqlx_logging = env::var("LEDGER_SQLX_LOGGING")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_dir = env::var("LEDGER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("logs"));

        Ok(Self {
            database_url,
            max_connections,
            sqlx_logging,
            log_dir,
        })
    }

    /// 프로세스 메모리에만 존재하는 저장소 (테스트용)
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            sqlx_logging: false,
            log_dir: PathBuf::from("logs"),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// 메모리 DB는 커넥션마다 별도 DB가 생기므로 풀을 1개로 고정한다.
    pub fn effective_max_connections(&self) -> u32 {
        if self.is_in_memory() {
            1
        } else {
            self.max_connections.max(1)
        }
    }
}

/// 파일 경로를 SQLite URL로 변환. 상대 경로는 현재 디렉토리 기준이며 상위 디렉토리를 만든다.
fn sqlite_url_for_path(db_path: &str) -> Result<String, RecordError> {
    let mut path = PathBuf::from(db_path);
    if !path.is_absolute() {
        if let Ok(current_dir) = env::current_dir() {
            path = current_dir.join(db_path);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RecordError::Other(format!("Failed to create DB directory: {}", e)))?;
    }

    Ok(format!("sqlite://{}?mode=rwc", path.to_string_lossy()))
}
