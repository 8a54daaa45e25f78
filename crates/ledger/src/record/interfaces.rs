use std::convert::TryFrom;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interface::{EventType, Fill, LedgerEvent, NewEvent, NewFill, Side};
use serde::{Deserialize, Serialize};

use super::entities::{event_record, fill_record};
use super::helpers::{decode_metadata, parse_decimal, parse_timestamp};

/// 조회 정렬 순서. 동시간 기록은 항상 ID(삽입 순서)로 정렬된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// 오래된 것부터 (집계용)
    #[default]
    OldestFirst,
    /// 최신 것부터 (목록 조회용)
    NewestFirst,
}

/// 저장소 조회 조건. `owner_id`를 제외한 모든 조건은 선택 사항이다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub owner_id: String,
    pub bot_id: Option<String>,
    /// 이 시간 이후 (포함)
    pub since: Option<DateTime<Utc>>,
    /// 이 시간 이전 (포함)
    pub until: Option<DateTime<Utc>>,
    /// 체결에만 적용
    pub exchange: Option<String>,
    /// 체결에만 적용
    pub symbol: Option<String>,
    /// 체결에만 적용
    pub is_paper: Option<bool>,
    pub order: SortOrder,
    pub limit: Option<u64>,
}

impl RecordQuery {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }
}

/// 체결 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillInsert {
    /// 새로 저장됨
    Inserted(i64),
    /// 같은 (owner_id, client_order_id)가 이미 있어 기존 ID를 돌려줌
    Existing(i64),
}

impl FillInsert {
    pub fn id(self) -> i64 {
        match self {
            FillInsert::Inserted(id) | FillInsert::Existing(id) => id,
        }
    }

    pub fn is_duplicate(self) -> bool {
        matches!(self, FillInsert::Existing(_))
    }
}

/// 원장 저장소 인터페이스.
/// 추가와 조회만 있고 수정/삭제 메서드는 의도적으로 없다.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// 체결 저장. `client_order_id`가 이미 있으면 원자적으로 기존 ID를 반환한다.
    async fn insert_fill(&self, fill: &NewFill) -> Result<FillInsert, RecordError>;

    /// 체결 여러 개를 하나의 트랜잭션으로 저장 (전부 성공하거나 전부 실패)
    async fn insert_fills(&self, fills: &[NewFill]) -> Result<Vec<FillInsert>, RecordError>;

    /// 자본 변동 이벤트 저장
    async fn insert_event(&self, event: &NewEvent) -> Result<i64, RecordError>;

    /// 소유자 범위 안에서 ID로 체결 조회
    async fn find_fill(&self, owner_id: &str, id: i64) -> Result<Option<Fill>, RecordError>;

    /// 조건에 맞는 체결 조회 (시간, ID 순)
    async fn find_fills(&self, query: &RecordQuery) -> Result<Vec<Fill>, RecordError>;

    /// 조건에 맞는 이벤트 조회 (시간, ID 순). exchange/symbol/is_paper 조건은 무시된다.
    async fn find_events(&self, query: &RecordQuery) -> Result<Vec<LedgerEvent>, RecordError>;
}

/// SeaORM fill_record::Model을 Fill로 변환
impl TryFrom<fill_record::Model> for Fill {
    type Error = RecordError;

    fn try_from(model: fill_record::Model) -> Result<Self, Self::Error> {
        let side = Side::from_str(&model.side)
            .map_err(|e| RecordError::Corrupt(format!("fill {}: {}", model.id, e)))?;

        Ok(Fill {
            id: model.id,
            owner_id: model.owner_id,
            bot_id: model.bot_id,
            exchange: model.exchange,
            symbol: model.symbol,
            side,
            qty: parse_decimal("qty", &model.qty)?,
            price: parse_decimal("price", &model.price)?,
            fee: parse_decimal("fee", &model.fee)?,
            fee_currency: model.fee_currency,
            timestamp: parse_timestamp("timestamp", &model.timestamp)?,
            order_id: model.order_id,
            client_order_id: model.client_order_id,
            exchange_trade_id: model.exchange_trade_id,
            is_paper: model.is_paper,
            metadata: decode_metadata(&model.metadata)?,
            created_at: parse_timestamp("created_at", &model.created_at)?,
        })
    }
}

/// SeaORM event_record::Model을 LedgerEvent로 변환
impl TryFrom<event_record::Model> for LedgerEvent {
    type Error = RecordError;

    fn try_from(model: event_record::Model) -> Result<Self, Self::Error> {
        let event_type = EventType::from_str(&model.event_type)
            .map_err(|e| RecordError::Corrupt(format!("event {}: {}", model.id, e)))?;

        Ok(LedgerEvent {
            id: model.id,
            owner_id: model.owner_id,
            bot_id: model.bot_id,
            event_type,
            amount: parse_decimal("amount", &model.amount)?,
            currency: model.currency,
            timestamp: parse_timestamp("timestamp", &model.timestamp)?,
            description: model.description,
            metadata: decode_metadata(&model.metadata)?,
            created_at: parse_timestamp("created_at", &model.created_at)?,
        })
    }
}

/// 기록 저장소 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 저장된 행을 복원할 수 없음 (추가 전용 불변식이 깨짐)
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Other error: {0}")]
    Other(String),
}
