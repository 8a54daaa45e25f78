use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 기록에 붙는 자유 형식 메타데이터 (키 순서가 고정되어 직렬화 결과가 항상 같음)
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// 체결 방향 (매수/매도)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// 포지션 방향 부호 (매수 +1, 매도 -1)
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(ValidationError::UnknownSide(s.to_string())),
        }
    }
}

/// 거래 외 자본 변동 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 입금/출금
    Funding,
    /// 계좌 간 이체
    Transfer,
    /// 봇 자본 배분
    Allocation,
    /// 수동 조정
    Adjustment,
    /// 서킷 브레이커 발동 기록
    CircuitBreaker,
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Funding => write!(f, "funding"),
            EventType::Transfer => write!(f, "transfer"),
            EventType::Allocation => write!(f, "allocation"),
            EventType::Adjustment => write!(f, "adjustment"),
            EventType::CircuitBreaker => write!(f, "circuit_breaker"),
        }
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "funding" => Ok(EventType::Funding),
            "transfer" => Ok(EventType::Transfer),
            "allocation" => Ok(EventType::Allocation),
            "adjustment" => Ok(EventType::Adjustment),
            "circuit_breaker" => Ok(EventType::CircuitBreaker),
            _ => Err(ValidationError::UnknownEventType(s.to_string())),
        }
    }
}

/// 수익 시계열 집계 단위 (모두 UTC 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// 매일 00:00
    Daily,
    /// 매주 월요일 00:00
    Weekly,
    /// 매월 1일 00:00
    Monthly,
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::Daily => write!(f, "daily"),
            Period::Weekly => write!(f, "weekly"),
            Period::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            _ => Err(ValidationError::UnknownPeriod(s.to_string())),
        }
    }
}

/// 아직 저장되지 않은 체결 기록 (상위 실행 엔진이 생성)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFill {
    pub owner_id: String,
    pub bot_id: Option<String>,
    /// 거래소 이름 (예: "binance", "bybit")
    pub exchange: String,
    /// 심볼 (예: "BTC/USDT")
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    /// 체결 UTC 시간
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<String>,
    /// 호출자가 넘기는 멱등성 키
    pub client_order_id: Option<String>,
    pub exchange_trade_id: Option<String>,
    pub is_paper: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewFill {
    /// 필수 필드만 채운 체결. 수수료는 0, 모의 거래로 시작한다.
    pub fn new(
        owner_id: impl Into<String>,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            bot_id: None,
            exchange: exchange.into(),
            symbol: symbol.into(),
            side,
            qty,
            price,
            fee: Decimal::ZERO,
            fee_currency: "USDT".to_string(),
            timestamp,
            order_id: None,
            client_order_id: None,
            exchange_trade_id: None,
            is_paper: true,
            metadata: Metadata::new(),
        }
    }

    pub fn with_bot(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = Some(bot_id.into());
        self
    }

    pub fn with_fee(mut self, fee: Decimal, currency: impl Into<String>) -> Self {
        self.fee = fee;
        self.fee_currency = currency.into();
        self
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_order_id.into());
        self
    }

    pub fn with_exchange_trade_id(mut self, trade_id: impl Into<String>) -> Self {
        self.exchange_trade_id = Some(trade_id.into());
        self
    }

    pub fn live(mut self) -> Self {
        self.is_paper = false;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 저장 전 스키마 검증. 하나라도 실패하면 기록 전체를 거부한다.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("owner_id", &self.owner_id)?;
        require_text("exchange", &self.exchange)?;
        require_text("symbol", &self.symbol)?;
        require_text("fee_currency", &self.fee_currency)?;
        require_positive("qty", self.qty)?;
        require_positive("price", self.price)?;
        if self.qty.checked_mul(self.price).is_none() {
            return Err(ValidationError::NotionalOverflow {
                qty: self.qty,
                price: self.price,
            });
        }
        if self.fee < Decimal::ZERO {
            return Err(ValidationError::NegativeFee(self.fee));
        }
        if let Some(bot_id) = &self.bot_id {
            require_text("bot_id", bot_id)?;
        }
        if let Some(client_order_id) = &self.client_order_id {
            require_text("client_order_id", client_order_id)?;
        }
        Ok(())
    }
}

/// 아직 저장되지 않은 자본 변동 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub owner_id: String,
    pub bot_id: Option<String>,
    pub event_type: EventType,
    /// 부호 있는 금액 (양수 입금, 음수 출금)
    pub amount: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(
        owner_id: impl Into<String>,
        event_type: EventType,
        amount: Decimal,
        currency: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            bot_id: None,
            event_type,
            amount,
            currency: currency.into(),
            timestamp,
            description: String::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_bot(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = Some(bot_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("owner_id", &self.owner_id)?;
        require_text("currency", &self.currency)?;
        if let Some(bot_id) = &self.bot_id {
            require_text("bot_id", bot_id)?;
        }
        Ok(())
    }
}

/// 저장소에 저장된 체결 기록. 한 번 저장되면 변경되지 않는다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// 저장소가 발급한 ID (삽입 순서와 같음)
    pub id: i64,
    pub owner_id: String,
    pub bot_id: Option<String>,
    pub exchange: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub exchange_trade_id: Option<String>,
    pub is_paper: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Fill {
    /// 체결 대금 (수량 * 가격). Decimal 범위를 넘으면 None
    pub fn notional(&self) -> Option<Decimal> {
        self.qty.checked_mul(self.price)
    }
}

/// 저장소에 저장된 자본 변동 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: i64,
    pub owner_id: String,
    pub bot_id: Option<String>,
    pub event_type: EventType,
    pub amount: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// 기록 검증 에러
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },
    #[error("fee must not be negative, got {0}")]
    NegativeFee(Decimal),
    #[error("notional of {qty} x {price} is out of decimal range")]
    NotionalOverflow { qty: Decimal, price: Decimal },
    #[error("{field} is not a finite decimal: {value}")]
    InvalidDecimal { field: &'static str, value: String },
    #[error("invalid side: {0}")]
    UnknownSide(String),
    #[error("invalid event type: {0}")]
    UnknownEventType(String),
    #[error("invalid period: {0}")]
    UnknownPeriod(String),
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

fn require_positive(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositive { field, value });
    }
    Ok(())
}
