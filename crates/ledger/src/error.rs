use interface::ValidationError;

use crate::lots::LotError;
use crate::metrics::MetricsError;
use crate::record::RecordError;

/// 원장 파사드 에러.
///
/// 중복 멱등성 키와 데이터 없음은 에러가 아니다 (기존 ID / 빈 결과로 처리).
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// 스키마 검증 실패. 아무것도 저장되지 않았다.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// 내부 불변식 위반. 재시도하지 말고 조사해야 한다.
    #[error("ledger invariant violated: {0}")]
    Computation(String),

    /// 저장소 I/O 실패
    #[error("storage error: {0}")]
    Storage(RecordError),
}

impl LedgerError {
    /// 재시도해도 되는 에러인지 (저장소 일시 장애만 해당)
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage(RecordError::Database(_)))
    }
}

impl From<RecordError> for LedgerError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Corrupt(msg) => LedgerError::Computation(msg),
            other => LedgerError::Storage(other),
        }
    }
}

impl From<LotError> for LedgerError {
    fn from(err: LotError) -> Self {
        LedgerError::Computation(err.to_string())
    }
}

impl From<MetricsError> for LedgerError {
    fn from(err: MetricsError) -> Self {
        LedgerError::Computation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_rows_are_fatal() {
        let err: LedgerError = RecordError::Corrupt("bad qty".to_string()).into();
        assert!(matches!(err, LedgerError::Computation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_database_errors_are_retryable() {
        let err: LedgerError = RecordError::Database(sea_orm::DbErr::Custom("locked".into())).into();
        assert!(err.is_retryable());

        let err: LedgerError = ValidationError::MissingField("symbol").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_metric_overflow_is_a_computation_error() {
        let err: LedgerError = MetricsError::Overflow("fees").into();
        assert!(matches!(err, LedgerError::Computation(ref msg) if msg.contains("fees")));
        assert!(!err.is_retryable());
    }
}
