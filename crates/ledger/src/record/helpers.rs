use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use interface::{Metadata, ValidationError};
use rust_decimal::Decimal;

use super::RecordError;

/// 저장용 시간 문자열. 폭이 고정되어 있어 문자열 정렬이 시간 정렬과 같다.
/// 나노초까지 그대로 남겨서 읽어 온 값이 원래 값과 같다.
/// 예: "2024-01-01T00:00:00.000000000Z"
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// 저장된 시간 문자열 복원. 실패하면 저장 데이터가 손상된 것이다.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RecordError::Corrupt(format!("Failed to parse {} '{}': {}", field, raw, e)))
}

/// 저장된 Decimal 문자열 복원
pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, RecordError> {
    Decimal::from_str(raw)
        .map_err(|e| RecordError::Corrupt(format!("Failed to parse {} '{}': {}", field, raw, e)))
}

/// 사용자 입력(CLI 등) Decimal 파싱
pub fn parse_decimal_input(field: &'static str, raw: &str) -> Result<Decimal, ValidationError> {
    Decimal::from_str(raw.trim()).map_err(|_| ValidationError::InvalidDecimal {
        field,
        value: raw.to_string(),
    })
}

/// f64를 쓰는 상위 엔진(모의 거래 등)의 값을 Decimal로 변환. NaN/무한대는 거부한다.
pub fn decimal_from_f64(field: &'static str, value: f64) -> Result<Decimal, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::InvalidDecimal {
            field,
            value: value.to_string(),
        });
    }
    Decimal::try_from(value)
        .map(|d| d.normalize())
        .map_err(|_| ValidationError::InvalidDecimal {
            field,
            value: value.to_string(),
        })
}

pub fn encode_metadata(metadata: &Metadata) -> Result<String, RecordError> {
    Ok(serde_json::to_string(metadata)?)
}

pub fn decode_metadata(raw: &str) -> Result<Metadata, RecordError> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| RecordError::Corrupt(format!("Failed to parse metadata: {}", e)))
}
