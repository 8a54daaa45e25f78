/// 체결 기록 엔티티 모듈
pub mod fill_record {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "fills")]
    pub struct Model {
        /// 삽입 순서대로 증가하는 체결 ID
        #[sea_orm(primary_key, auto_increment = true)]
        pub id: i64,

        #[sea_orm(column_type = "Text")]
        pub owner_id: String,

        #[sea_orm(column_type = "Text", nullable)]
        pub bot_id: Option<String>,

        /// 거래소 이름
        #[sea_orm(column_type = "Text")]
        pub exchange: String,

        #[sea_orm(column_type = "Text")]
        pub symbol: String,

        /// 거래 방향 (buy, sell)
        #[sea_orm(column_type = "Text")]
        pub side: String,

        /// 체결 수량 (Decimal 문자열)
        #[sea_orm(column_type = "Text")]
        pub qty: String,

        /// 체결 가격 (Decimal 문자열)
        #[sea_orm(column_type = "Text")]
        pub price: String,

        /// 수수료 (Decimal 문자열)
        #[sea_orm(column_type = "Text")]
        pub fee: String,

        #[sea_orm(column_type = "Text")]
        pub fee_currency: String,

        /// 체결 UTC 시간 (고정 폭 RFC 3339)
        #[sea_orm(column_type = "Text")]
        pub timestamp: String,

        #[sea_orm(column_type = "Text", nullable)]
        pub order_id: Option<String>,

        /// 멱등성 키 (owner_id와 함께 유니크)
        #[sea_orm(column_type = "Text", nullable)]
        pub client_order_id: Option<String>,

        #[sea_orm(column_type = "Text", nullable)]
        pub exchange_trade_id: Option<String>,

        /// 모의 거래 여부
        #[sea_orm(column_type = "Boolean")]
        pub is_paper: bool,

        /// 추가 메타데이터 (JSON)
        #[sea_orm(column_type = "Text")]
        pub metadata: String,

        /// 저장 UTC 시간
        #[sea_orm(column_type = "Text")]
        pub created_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 자본 변동 이벤트 엔티티 모듈
pub mod event_record {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "ledger_events")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = true)]
        pub id: i64,

        #[sea_orm(column_type = "Text")]
        pub owner_id: String,

        #[sea_orm(column_type = "Text", nullable)]
        pub bot_id: Option<String>,

        /// 이벤트 유형 (funding, transfer, allocation, adjustment, circuit_breaker)
        #[sea_orm(column_type = "Text")]
        pub event_type: String,

        /// 부호 있는 금액 (Decimal 문자열)
        #[sea_orm(column_type = "Text")]
        pub amount: String,

        #[sea_orm(column_type = "Text")]
        pub currency: String,

        #[sea_orm(column_type = "Text")]
        pub timestamp: String,

        #[sea_orm(column_type = "Text")]
        pub description: String,

        #[sea_orm(column_type = "Text")]
        pub metadata: String,

        #[sea_orm(column_type = "Text")]
        pub created_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
