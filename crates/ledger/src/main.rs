use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::eyre;
use interface::{EventType, NewEvent, NewFill, Period, Side, ValidationError};
use rust_decimal::Decimal;
use serde::Serialize;
use structopt::StructOpt;
use tracing::info;

use ledger::record::{parse_decimal_input, SqliteLedgerRepository};
use ledger::{Ledger, LedgerConfig, LedgerQuery, MarkPrices};

#[derive(Debug, StructOpt)]
#[structopt(name = "ledger", about = "거래 원장 관리 도구")]
enum Command {
    /// 저장소 테이블/인덱스 생성
    Init,
    /// 체결 추가 (client-order-id가 같으면 기존 ID 반환)
    AppendFill(FillArgs),
    /// 자본 변동 이벤트 추가
    AppendEvent(EventArgs),
    /// 체결 목록 (최신순)
    Fills(QueryArgs),
    /// until 시점 자산
    Equity(QueryArgs),
    /// 실현 손익 리포트
    Pnl(QueryArgs),
    /// 청산/미청산 로트와 평가 손익
    Lots {
        #[structopt(flatten)]
        query: QueryArgs,
        /// 평가 가격 (예: binance:BTC/USDT=51000), 여러 번 지정 가능
        #[structopt(long = "mark", parse(try_from_str = parse_mark))]
        marks: Vec<(String, String, Decimal)>,
    },
    /// 낙폭
    Drawdown(QueryArgs),
    /// 거래 통계
    Stats(QueryArgs),
    /// 기간별 수익 시계열
    Series {
        #[structopt(flatten)]
        query: QueryArgs,
        /// daily | weekly | monthly
        #[structopt(long, default_value = "daily")]
        period: Period,
    },
}

#[derive(Debug, StructOpt)]
struct QueryArgs {
    #[structopt(long)]
    owner: String,
    #[structopt(long)]
    bot: Option<String>,
    /// RFC 3339 (예: 2024-01-01T00:00:00Z)
    #[structopt(long)]
    since: Option<DateTime<Utc>>,
    #[structopt(long)]
    until: Option<DateTime<Utc>>,
    #[structopt(long)]
    exchange: Option<String>,
    #[structopt(long)]
    symbol: Option<String>,
    /// true면 모의 거래만, false면 실거래만
    #[structopt(long)]
    paper: Option<bool>,
    #[structopt(long)]
    limit: Option<u64>,
}

impl From<QueryArgs> for LedgerQuery {
    fn from(args: QueryArgs) -> Self {
        LedgerQuery {
            owner_id: args.owner,
            bot_id: args.bot,
            since: args.since,
            until: args.until,
            exchange: args.exchange,
            symbol: args.symbol,
            is_paper: args.paper,
            limit: args.limit,
        }
    }
}

#[derive(Debug, StructOpt)]
struct FillArgs {
    #[structopt(long)]
    owner: String,
    #[structopt(long)]
    bot: Option<String>,
    #[structopt(long)]
    exchange: String,
    #[structopt(long)]
    symbol: String,
    /// buy | sell
    #[structopt(long)]
    side: Side,
    #[structopt(long, parse(try_from_str = decimal_arg))]
    qty: Decimal,
    #[structopt(long, parse(try_from_str = decimal_arg))]
    price: Decimal,
    #[structopt(long, default_value = "0", parse(try_from_str = decimal_arg))]
    fee: Decimal,
    #[structopt(long, default_value = "USDT")]
    fee_currency: String,
    /// 없으면 현재 시간
    #[structopt(long)]
    timestamp: Option<DateTime<Utc>>,
    #[structopt(long)]
    order_id: Option<String>,
    #[structopt(long)]
    client_order_id: Option<String>,
    #[structopt(long)]
    exchange_trade_id: Option<String>,
    /// 실거래 체결로 기록
    #[structopt(long)]
    live: bool,
}

impl From<FillArgs> for NewFill {
    fn from(args: FillArgs) -> Self {
        let mut fill = NewFill::new(
            args.owner,
            args.exchange,
            args.symbol,
            args.side,
            args.qty,
            args.price,
            args.timestamp.unwrap_or_else(Utc::now),
        )
        .with_fee(args.fee, args.fee_currency);
        fill.bot_id = args.bot;
        fill.order_id = args.order_id;
        fill.client_order_id = args.client_order_id;
        fill.exchange_trade_id = args.exchange_trade_id;
        fill.is_paper = !args.live;
        fill
    }
}

#[derive(Debug, StructOpt)]
struct EventArgs {
    #[structopt(long)]
    owner: String,
    #[structopt(long)]
    bot: Option<String>,
    /// funding | transfer | allocation | adjustment | circuit_breaker
    #[structopt(long)]
    event_type: EventType,
    /// 출금은 음수
    #[structopt(long, allow_hyphen_values = true, parse(try_from_str = decimal_arg))]
    amount: Decimal,
    #[structopt(long, default_value = "USDT")]
    currency: String,
    #[structopt(long)]
    timestamp: Option<DateTime<Utc>>,
    #[structopt(long, default_value = "")]
    description: String,
}

impl From<EventArgs> for NewEvent {
    fn from(args: EventArgs) -> Self {
        let mut event = NewEvent::new(
            args.owner,
            args.event_type,
            args.amount,
            args.currency,
            args.timestamp.unwrap_or_else(Utc::now),
        )
        .with_description(args.description);
        event.bot_id = args.bot;
        event
    }
}

fn decimal_arg(s: &str) -> Result<Decimal, ValidationError> {
    parse_decimal_input("argument", s)
}

/// "exchange:symbol=price" 형식
fn parse_mark(s: &str) -> Result<(String, String, Decimal), String> {
    let (instrument, price) = s
        .split_once('=')
        .ok_or_else(|| format!("mark '{}' must look like exchange:symbol=price", s))?;
    let (exchange, symbol) = instrument
        .split_once(':')
        .ok_or_else(|| format!("mark '{}' must look like exchange:symbol=price", s))?;
    let price = parse_decimal_input("mark", price).map_err(|e| e.to_string())?;
    Ok((exchange.trim().to_string(), symbol.trim().to_string(), price))
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // init error reporting
    color_eyre::install()?;

    let config = LedgerConfig::from_env()
        .map_err(|e| eyre::eyre!("원장 설정 로드 실패: {}", e))?;

    // init logging
    let _guards = ledger::logger::init_tracing(&config.log_dir)
        .map_err(|e| eyre::eyre!("로그 디렉토리 {} 생성 실패: {}", config.log_dir.display(), e))?;

    let cmd = Command::from_args();

    let repo = SqliteLedgerRepository::connect(&config)
        .await
        .map_err(|e| eyre::eyre!("원장 저장소 초기화 실패: {}", e))?;
    let repo = Arc::new(repo);
    let ledger = Ledger::new(repo.clone());

    let result = run(&ledger, cmd).await;

    // 저장소 수명은 여기서 끝난다
    drop(ledger);
    match Arc::try_unwrap(repo) {
        Ok(repo) => repo.close().await?,
        Err(_) => tracing::warn!("Ledger repository still shared, skipping close"),
    }

    result
}

async fn run(ledger: &Ledger, cmd: Command) -> eyre::Result<()> {
    match cmd {
        Command::Init => {
            info!("Ledger storage is ready");
        }
        Command::AppendFill(args) => {
            let id = ledger.append_fill(args.into()).await?;
            print_json(&serde_json::json!({ "fill_id": id }))?;
        }
        Command::AppendEvent(args) => {
            let id = ledger.append_event(args.into()).await?;
            print_json(&serde_json::json!({ "event_id": id }))?;
        }
        Command::Fills(args) => {
            print_json(&ledger.get_fills(&LedgerQuery::from(args)).await?)?;
        }
        Command::Equity(args) => {
            let query: LedgerQuery = args.into();
            let equity = ledger.compute_equity(&query).await?;
            let fees = ledger.compute_fees_paid(&query).await?;
            print_json(&serde_json::json!({
                "owner_id": query.owner_id,
                "as_of": query.until,
                "equity": equity,
                "fees_paid": fees,
            }))?;
        }
        Command::Pnl(args) => {
            print_json(&ledger.realized_pnl_report(&LedgerQuery::from(args)).await?)?;
        }
        Command::Lots { query, marks } => {
            let query: LedgerQuery = query.into();
            let marks = marks
                .into_iter()
                .fold(MarkPrices::new(), |acc, (exchange, symbol, price)| {
                    acc.with(exchange, symbol, price)
                });
            let matched = ledger.matched_lots(&query).await?;
            let open = ledger.open_lots(&query).await?;
            let unrealized = ledger.compute_unrealized_pnl(&query, &marks).await?;
            print_json(&serde_json::json!({
                "matched": matched,
                "open": open,
                "unrealized": unrealized,
            }))?;
        }
        Command::Drawdown(args) => {
            print_json(&ledger.compute_drawdown(&LedgerQuery::from(args)).await?)?;
        }
        Command::Stats(args) => {
            print_json(&ledger.get_stats(&LedgerQuery::from(args)).await?)?;
        }
        Command::Series { query, period } => {
            print_json(&ledger.profit_series(&LedgerQuery::from(query), period).await?)?;
        }
    }

    Ok(())
}
