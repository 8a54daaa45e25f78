//! 체결 + 이벤트 스트림을 접어서 계산하는 지표들.
//!
//! 모든 함수는 순수 함수이며 저장된 상태를 바꾸지 않는다.
//! 같은 입력이면 항상 같은 결과를 낸다.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use interface::{Fill, LedgerEvent, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::lots::{match_fills, InstrumentKey, LotBook, LotError, MatchedLot, OpenLot};

/// 지표 계산 실패. 검증을 통과한 기록에서는 합계가 Decimal 범위를 넘을 때만 생긴다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error(transparent)]
    Lot(#[from] LotError),
    #[error("decimal overflow while computing {0}")]
    Overflow(&'static str),
}

pub(crate) fn checked_add(what: &'static str, acc: Decimal, value: Decimal) -> Result<Decimal, MetricsError> {
    acc.checked_add(value).ok_or(MetricsError::Overflow(what))
}

pub(crate) fn checked_sum<I>(what: &'static str, values: I) -> Result<Decimal, MetricsError>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| checked_add(what, acc, value))
}

pub(crate) fn notional_of(fill: &Fill) -> Result<Decimal, MetricsError> {
    fill.notional().ok_or(MetricsError::Overflow("notional"))
}

/// 닫힌 시간 구간 [since, until]. 비어 있는 쪽은 무제한.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| *ts >= since) && self.until.map_or(true, |until| *ts <= until)
    }
}

/// 실현 손익 요약
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnlReport {
    /// 수수료 차감 전
    pub gross: Decimal,
    /// 매칭된 로트에 배분된 수수료
    pub fees: Decimal,
    /// gross - fees
    pub net: Decimal,
    pub closed_lots: usize,
}

/// 구간 안에서 청산된 로트의 실현 손익
pub fn realized_report(
    matched: &[MatchedLot],
    window: &TimeWindow,
) -> Result<RealizedPnlReport, MetricsError> {
    matched
        .iter()
        .filter(|lot| window.contains(&lot.closed_at))
        .try_fold(RealizedPnlReport::default(), |mut report, lot| {
            report.gross = checked_add("realized gross", report.gross, lot.gross_pnl)?;
            report.fees = checked_add("realized fees", report.fees, lot.fees)?;
            report.net = checked_add("realized net", report.net, lot.net_pnl)?;
            report.closed_lots += 1;
            Ok(report)
        })
}

/// 구간 안 체결의 수수료 합 (항상 0 이상)
pub fn fees_paid(fills: &[Fill], window: &TimeWindow) -> Result<Decimal, MetricsError> {
    checked_sum(
        "fees",
        fills
            .iter()
            .filter(|fill| window.contains(&fill.timestamp))
            .map(|fill| fill.fee),
    )
}

/// as_of 시점 자산 = 이벤트 금액 합 + 청산 로트 총손익 - 체결 수수료 합
pub fn equity(
    events: &[LedgerEvent],
    fills: &[Fill],
    as_of: Option<DateTime<Utc>>,
) -> Result<Decimal, MetricsError> {
    let window = TimeWindow::new(None, as_of);

    let capital = checked_sum(
        "capital",
        events
            .iter()
            .filter(|event| window.contains(&event.timestamp))
            .map(|event| event.amount),
    )?;

    let in_range: Vec<Fill> = fills
        .iter()
        .filter(|fill| window.contains(&fill.timestamp))
        .cloned()
        .collect();
    let matching = match_fills(&in_range)?;
    let gross = checked_sum("realized gross", matching.matched.iter().map(|lot| lot.gross_pnl))?;
    let fees = fees_paid(&in_range, &TimeWindow::unbounded())?;

    checked_add("equity", capital, gross)?
        .checked_sub(fees)
        .ok_or(MetricsError::Overflow("equity"))
}

/// 자산 곡선의 한 점
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

enum Entry<'a> {
    Event(&'a LedgerEvent),
    Fill(&'a Fill),
}

impl Entry<'_> {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Entry::Event(event) => event.timestamp,
            Entry::Fill(fill) => fill.timestamp,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, u8, i64) {
        match self {
            Entry::Event(event) => (event.timestamp, 0, event.id),
            Entry::Fill(fill) => (fill.timestamp, 1, fill.id),
        }
    }
}

/// 모든 이벤트/체결 시각마다 자산을 평가한 곡선 (시간 오름차순).
/// 같은 시각의 기록은 한 점으로 합쳐지며, 각 점은 그 시각의 `equity(as_of)`와 같다.
pub fn equity_curve(
    events: &[LedgerEvent],
    fills: &[Fill],
) -> Result<Vec<EquityPoint>, MetricsError> {
    let mut entries: Vec<Entry<'_>> = events
        .iter()
        .map(Entry::Event)
        .chain(fills.iter().map(Entry::Fill))
        .collect();
    entries.sort_by_key(|entry| entry.sort_key());

    let mut book = LotBook::new();
    let mut running = Decimal::ZERO;
    let mut curve: Vec<EquityPoint> = Vec::new();

    for entry in &entries {
        match entry {
            Entry::Event(event) => running = checked_add("equity", running, event.amount)?,
            Entry::Fill(fill) => {
                let closed = book.apply(fill)?;
                let gross = checked_sum("realized gross", closed.iter().map(|lot| lot.gross_pnl))?;
                running = checked_add("equity", running, gross)?
                    .checked_sub(fill.fee)
                    .ok_or(MetricsError::Overflow("equity"))?;
            }
        }

        let ts = entry.timestamp();
        match curve.last_mut() {
            Some(point) if point.timestamp == ts => point.equity = running,
            _ => curve.push(EquityPoint {
                timestamp: ts,
                equity: running,
            }),
        }
    }

    Ok(curve)
}

/// 낙폭 (0~1 비율)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drawdown {
    /// 마지막 점의 고점 대비 하락률
    pub current_pct: Decimal,
    /// 구간 안 최대 하락률
    pub max_pct: Decimal,
}

/// 자산 곡선에서 낙폭 계산. `since` 이후 점들만 보며 고점도 그 안에서 잡는다.
/// 고점이 0 이하면 그 점의 낙폭은 0, 음수 자산으로 떨어지면 1로 자른다.
pub fn drawdown(curve: &[EquityPoint], since: Option<DateTime<Utc>>) -> Drawdown {
    let mut peak: Option<Decimal> = None;
    let mut result = Drawdown::default();

    for point in curve
        .iter()
        .filter(|point| since.map_or(true, |since| point.timestamp >= since))
    {
        let high = match peak {
            Some(high) if high >= point.equity => high,
            _ => point.equity,
        };
        peak = Some(high);

        let pct = drawdown_pct(high, point.equity);
        result.current_pct = pct;
        result.max_pct = result.max_pct.max(pct);
    }

    result
}

fn drawdown_pct(peak: Decimal, equity: Decimal) -> Decimal {
    if peak <= Decimal::ZERO || equity >= peak {
        return Decimal::ZERO;
    }
    // 차이가 범위를 넘을 정도면 이미 100% 낙폭이다
    peak.checked_sub(equity)
        .and_then(|fall| fall.checked_div(peak))
        .map_or(Decimal::ONE, |pct| pct.min(Decimal::ONE))
}

/// 거래 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_fills: usize,
    pub buy_fills: usize,
    pub sell_fills: usize,
    /// 체결 대금 합 (수량 * 가격)
    pub total_volume: Decimal,
    pub total_fees: Decimal,
    /// 구간 안 청산 로트의 순손익
    pub realized_pnl: Decimal,
    pub closed_lots: usize,
    pub winning_lots: usize,
    pub losing_lots: usize,
    /// 청산 로트가 없으면 None (0이 아님)
    pub win_rate: Option<Decimal>,
    pub average_win: Option<Decimal>,
    pub average_loss: Option<Decimal>,
    pub largest_win: Option<Decimal>,
    pub largest_loss: Option<Decimal>,
    /// 이익 합 / |손실 합|. 손실 로트가 없으면 None
    pub profit_factor: Option<Decimal>,
}

/// `fills`는 구간 안 체결, `matched`는 전체 이력 매칭 결과 (구간 필터는 여기서 적용)
pub fn stats(
    fills: &[Fill],
    matched: &[MatchedLot],
    window: &TimeWindow,
) -> Result<LedgerStats, MetricsError> {
    let mut stats = LedgerStats::default();

    for fill in fills.iter().filter(|fill| window.contains(&fill.timestamp)) {
        stats.total_fills += 1;
        match fill.side {
            Side::Buy => stats.buy_fills += 1,
            Side::Sell => stats.sell_fills += 1,
        }
        stats.total_volume = checked_add("volume", stats.total_volume, notional_of(fill)?)?;
        stats.total_fees = checked_add("fees", stats.total_fees, fill.fee)?;
    }

    let closed: Vec<&MatchedLot> = matched
        .iter()
        .filter(|lot| window.contains(&lot.closed_at))
        .collect();

    let wins: Vec<Decimal> = closed.iter().filter(|l| l.is_win()).map(|l| l.net_pnl).collect();
    let losses: Vec<Decimal> = closed.iter().filter(|l| l.is_loss()).map(|l| l.net_pnl).collect();

    stats.closed_lots = closed.len();
    stats.winning_lots = wins.len();
    stats.losing_lots = losses.len();
    stats.realized_pnl = checked_sum("realized net", closed.iter().map(|lot| lot.net_pnl))?;

    if !closed.is_empty() {
        stats.win_rate = Some(Decimal::from(wins.len()) / Decimal::from(closed.len()));
    }

    let win_sum = checked_sum("wins", wins.iter().copied())?;
    let loss_sum = checked_sum("losses", losses.iter().copied())?;

    if !wins.is_empty() {
        stats.average_win = Some(win_sum / Decimal::from(wins.len()));
        stats.largest_win = wins.iter().copied().max();
    }
    if !losses.is_empty() {
        stats.average_loss = Some(loss_sum / Decimal::from(losses.len()));
        stats.largest_loss = losses.iter().copied().min();
        stats.profit_factor = win_sum.checked_div(loss_sum.abs());
    }

    Ok(stats)
}

/// 외부에서 받은 평가 가격 ((거래소, 심볼) 단위)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkPrices {
    prices: BTreeMap<(String, String), Decimal>,
}

impl MarkPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exchange: impl Into<String>, symbol: impl Into<String>, price: Decimal) {
        self.prices.insert((exchange.into(), symbol.into()), price);
    }

    pub fn with(mut self, exchange: impl Into<String>, symbol: impl Into<String>, price: Decimal) -> Self {
        self.insert(exchange, symbol, price);
        self
    }

    pub fn get(&self, exchange: &str, symbol: &str) -> Option<Decimal> {
        self.prices
            .get(&(exchange.to_string(), symbol.to_string()))
            .copied()
    }
}

/// 상품별 평가 손익
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMark {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub qty: Decimal,
    /// 열린 로트들의 수량 가중 평균 진입가
    pub average_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnrealizedPnl {
    pub total: Decimal,
    pub positions: Vec<PositionMark>,
    /// 평가 가격이 없어 계산에서 빠진 상품
    pub unpriced: Vec<InstrumentKey>,
}

/// 열린 로트를 평가 가격으로 시가 평가
pub fn unrealized(open: &[OpenLot], marks: &MarkPrices) -> Result<UnrealizedPnl, MetricsError> {
    let mut grouped: BTreeMap<InstrumentKey, Vec<&OpenLot>> = BTreeMap::new();
    for lot in open {
        grouped.entry(lot.instrument.clone()).or_default().push(lot);
    }

    let mut result = UnrealizedPnl::default();
    for (instrument, lots) in grouped {
        let Some(mark_price) = marks.get(&instrument.exchange, &instrument.symbol) else {
            result.unpriced.push(instrument);
            continue;
        };

        let side = lots[0].side;
        let qty = checked_sum("open qty", lots.iter().map(|lot| lot.qty))?;
        let mut cost = Decimal::ZERO;
        let mut pnl = Decimal::ZERO;
        for lot in &lots {
            let lot_cost = lot
                .qty
                .checked_mul(lot.price)
                .ok_or(MetricsError::Overflow("open cost"))?;
            let lot_pnl = mark_price
                .checked_sub(lot.price)
                .and_then(|diff| diff.checked_mul(lot.qty))
                .map(|value| value * lot.side.sign())
                .ok_or(MetricsError::Overflow("unrealized pnl"))?;
            cost = checked_add("open cost", cost, lot_cost)?;
            pnl = checked_add("unrealized pnl", pnl, lot_pnl)?;
        }

        result.total = checked_add("unrealized pnl", result.total, pnl)?;
        result.positions.push(PositionMark {
            instrument,
            side,
            qty,
            average_price: cost
                .checked_div(qty)
                .ok_or(MetricsError::Overflow("average price"))?,
            mark_price,
            unrealized_pnl: pnl,
        });
    }

    Ok(result)
}
