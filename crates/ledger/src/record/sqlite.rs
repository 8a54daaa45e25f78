use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interface::{Fill, LedgerEvent, NewEvent, NewFill};
use sea_orm::sea_query::{Index, IndexCreateStatement, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, Select, Set, TransactionTrait,
};
use tracing::{debug, info};

use super::entities::{event_record, fill_record};
use super::helpers::{encode_metadata, format_timestamp};
use super::{FillInsert, LedgerRepository, RecordError, RecordQuery, SortOrder};
use crate::config::LedgerConfig;

/// SQLite 기반 원장 저장소 (체결 + 자본 변동 이벤트)
pub struct SqliteLedgerRepository {
    db: DatabaseConnection,
}

impl SqliteLedgerRepository {
    /// 저장소 연결 및 테이블/인덱스 생성 (이미 있으면 건너뜀)
    pub async fn connect(config: &LedgerConfig) -> Result<Self, RecordError> {
        info!("Connecting to ledger database: {}", config.database_url);

        let mut options = ConnectOptions::new(config.database_url.clone());
        options
            .max_connections(config.effective_max_connections())
            .sqlx_logging(config.sqlx_logging);
        if config.is_in_memory() {
            options.min_connections(1);
        }

        let db = Database::connect(options).await?;
        let repo = Self { db };
        repo.init_schema().await?;

        Ok(repo)
    }

    /// 커넥션 풀 정리. 저장소 수명은 호출자가 관리한다.
    pub async fn close(self) -> Result<(), RecordError> {
        self.db.close().await?;
        info!("Ledger database closed");
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), RecordError> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let mut create_fills = schema.create_table_from_entity(fill_record::Entity);
        create_fills.if_not_exists();
        self.db.execute(backend.build(&create_fills)).await?;

        let mut create_events = schema.create_table_from_entity(event_record::Entity);
        create_events.if_not_exists();
        self.db.execute(backend.build(&create_events)).await?;

        // 멱등성 보장에 필요하므로 실패하면 연결 자체를 실패시킨다
        let client_order_idx = Index::create()
            .name("ux_fills_owner_client_order")
            .table(fill_record::Entity)
            .col(fill_record::Column::OwnerId)
            .col(fill_record::Column::ClientOrderId)
            .unique()
            .if_not_exists()
            .to_owned();
        self.db.execute(backend.build(&client_order_idx)).await?;

        let lookup_indexes = [
            Index::create()
                .name("idx_fills_owner_timestamp")
                .table(fill_record::Entity)
                .col(fill_record::Column::OwnerId)
                .col(fill_record::Column::Timestamp)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_fills_owner_bot_timestamp")
                .table(fill_record::Entity)
                .col(fill_record::Column::OwnerId)
                .col(fill_record::Column::BotId)
                .col(fill_record::Column::Timestamp)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_events_owner_timestamp")
                .table(event_record::Entity)
                .col(event_record::Column::OwnerId)
                .col(event_record::Column::Timestamp)
                .if_not_exists()
                .to_owned(),
        ];
        for index in lookup_indexes.iter() {
            self.create_lookup_index(index).await;
        }

        info!("Ledger tables initialized");
        Ok(())
    }

    /// 조회용 인덱스는 성능 문제일 뿐이라 실패해도 계속 진행
    async fn create_lookup_index(&self, index: &IndexCreateStatement) {
        let backend = self.db.get_database_backend();
        if let Err(e) = self.db.execute(backend.build(index)).await {
            tracing::warn!("Ledger index creation skipped: {}", e);
        }
    }
}

fn fill_active_model(
    fill: &NewFill,
    created_at: &DateTime<Utc>,
) -> Result<fill_record::ActiveModel, RecordError> {
    Ok(fill_record::ActiveModel {
        owner_id: Set(fill.owner_id.clone()),
        bot_id: Set(fill.bot_id.clone()),
        exchange: Set(fill.exchange.clone()),
        symbol: Set(fill.symbol.clone()),
        side: Set(fill.side.to_string()),
        qty: Set(fill.qty.normalize().to_string()),
        price: Set(fill.price.normalize().to_string()),
        fee: Set(fill.fee.normalize().to_string()),
        fee_currency: Set(fill.fee_currency.clone()),
        timestamp: Set(format_timestamp(&fill.timestamp)),
        order_id: Set(fill.order_id.clone()),
        client_order_id: Set(fill.client_order_id.clone()),
        exchange_trade_id: Set(fill.exchange_trade_id.clone()),
        is_paper: Set(fill.is_paper),
        metadata: Set(encode_metadata(&fill.metadata)?),
        created_at: Set(format_timestamp(created_at)),
        ..Default::default()
    })
}

/// insert-if-absent. (owner_id, client_order_id) 유니크 인덱스 충돌 시 아무것도 쓰지 않고 기존 ID 조회.
async fn insert_fill_on<C: ConnectionTrait>(
    conn: &C,
    fill: &NewFill,
) -> Result<FillInsert, RecordError> {
    let model = fill_active_model(fill, &Utc::now())?;

    let result = fill_record::Entity::insert(model)
        .on_conflict(
            OnConflict::columns([
                fill_record::Column::OwnerId,
                fill_record::Column::ClientOrderId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec(conn)
        .await;

    match result {
        Ok(inserted) => {
            debug!(
                "Fill {} appended (owner={}, {} {} {} @ {})",
                inserted.last_insert_id, fill.owner_id, fill.side, fill.qty, fill.symbol, fill.price
            );
            Ok(FillInsert::Inserted(inserted.last_insert_id))
        }
        Err(DbErr::RecordNotInserted) => {
            let client_order_id = fill.client_order_id.as_deref().ok_or_else(|| {
                RecordError::Other("Fill was not inserted without an idempotency key".to_string())
            })?;
            let existing = fill_record::Entity::find()
                .filter(fill_record::Column::OwnerId.eq(fill.owner_id.as_str()))
                .filter(fill_record::Column::ClientOrderId.eq(client_order_id))
                .one(conn)
                .await?
                .ok_or_else(|| {
                    RecordError::Other(format!(
                        "Conflicting fill for client_order_id '{}' not found",
                        client_order_id
                    ))
                })?;
            debug!(
                "Duplicate client_order_id '{}' for owner {}, returning fill {}",
                client_order_id, fill.owner_id, existing.id
            );
            Ok(FillInsert::Existing(existing.id))
        }
        Err(e) => Err(RecordError::Database(e)),
    }
}

fn fill_select(query: &RecordQuery) -> Select<fill_record::Entity> {
    let mut select = fill_record::Entity::find()
        .filter(fill_record::Column::OwnerId.eq(query.owner_id.as_str()));

    if let Some(bot_id) = &query.bot_id {
        select = select.filter(fill_record::Column::BotId.eq(bot_id.as_str()));
    }
    if let Some(exchange) = &query.exchange {
        select = select.filter(fill_record::Column::Exchange.eq(exchange.as_str()));
    }
    if let Some(symbol) = &query.symbol {
        select = select.filter(fill_record::Column::Symbol.eq(symbol.as_str()));
    }
    if let Some(is_paper) = query.is_paper {
        select = select.filter(fill_record::Column::IsPaper.eq(is_paper));
    }
    if let Some(since) = &query.since {
        select = select.filter(fill_record::Column::Timestamp.gte(format_timestamp(since)));
    }
    if let Some(until) = &query.until {
        select = select.filter(fill_record::Column::Timestamp.lte(format_timestamp(until)));
    }

    select = match query.order {
        SortOrder::OldestFirst => select
            .order_by_asc(fill_record::Column::Timestamp)
            .order_by_asc(fill_record::Column::Id),
        SortOrder::NewestFirst => select
            .order_by_desc(fill_record::Column::Timestamp)
            .order_by_desc(fill_record::Column::Id),
    };

    if let Some(limit) = query.limit {
        select = select.limit(limit);
    }
    select
}

fn event_select(query: &RecordQuery) -> Select<event_record::Entity> {
    let mut select = event_record::Entity::find()
        .filter(event_record::Column::OwnerId.eq(query.owner_id.as_str()));

    if let Some(bot_id) = &query.bot_id {
        select = select.filter(event_record::Column::BotId.eq(bot_id.as_str()));
    }
    if let Some(since) = &query.since {
        select = select.filter(event_record::Column::Timestamp.gte(format_timestamp(since)));
    }
    if let Some(until) = &query.until {
        select = select.filter(event_record::Column::Timestamp.lte(format_timestamp(until)));
    }

    select = match query.order {
        SortOrder::OldestFirst => select
            .order_by_asc(event_record::Column::Timestamp)
            .order_by_asc(event_record::Column::Id),
        SortOrder::NewestFirst => select
            .order_by_desc(event_record::Column::Timestamp)
            .order_by_desc(event_record::Column::Id),
    };

    if let Some(limit) = query.limit {
        select = select.limit(limit);
    }
    select
}

#[async_trait]
impl LedgerRepository for SqliteLedgerRepository {
    async fn insert_fill(&self, fill: &NewFill) -> Result<FillInsert, RecordError> {
        insert_fill_on(&self.db, fill).await
    }

    async fn insert_fills(&self, fills: &[NewFill]) -> Result<Vec<FillInsert>, RecordError> {
        if fills.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin().await?;
        let mut results = Vec::with_capacity(fills.len());
        for fill in fills {
            // 에러 시 txn이 드롭되며 롤백된다
            results.push(insert_fill_on(&txn, fill).await?);
        }
        txn.commit().await?;

        Ok(results)
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<i64, RecordError> {
        let now = Utc::now();
        let model = event_record::ActiveModel {
            owner_id: Set(event.owner_id.clone()),
            bot_id: Set(event.bot_id.clone()),
            event_type: Set(event.event_type.to_string()),
            amount: Set(event.amount.normalize().to_string()),
            currency: Set(event.currency.clone()),
            timestamp: Set(format_timestamp(&event.timestamp)),
            description: Set(event.description.clone()),
            metadata: Set(encode_metadata(&event.metadata)?),
            created_at: Set(format_timestamp(&now)),
            ..Default::default()
        };

        let inserted = event_record::Entity::insert(model).exec(&self.db).await?;
        debug!(
            "Event {} appended (owner={}, {} {} {})",
            inserted.last_insert_id, event.owner_id, event.event_type, event.amount, event.currency
        );

        Ok(inserted.last_insert_id)
    }

    async fn find_fill(&self, owner_id: &str, id: i64) -> Result<Option<Fill>, RecordError> {
        let model = fill_record::Entity::find_by_id(id)
            .filter(fill_record::Column::OwnerId.eq(owner_id))
            .one(&self.db)
            .await?;

        match model {
            Some(m) => Ok(Some(Fill::try_from(m)?)),
            None => Ok(None),
        }
    }

    async fn find_fills(&self, query: &RecordQuery) -> Result<Vec<Fill>, RecordError> {
        let models = fill_select(query).all(&self.db).await?;
        models.into_iter().map(Fill::try_from).collect()
    }

    async fn find_events(&self, query: &RecordQuery) -> Result<Vec<LedgerEvent>, RecordError> {
        let models = event_select(query).all(&self.db).await?;
        models.into_iter().map(LedgerEvent::try_from).collect()
    }
}
