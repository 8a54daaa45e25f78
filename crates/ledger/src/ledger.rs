use std::sync::Arc;

use chrono::{DateTime, Utc};
use interface::{Fill, LedgerEvent, NewEvent, NewFill, Period};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buckets::{profit_series, ProfitBucket, SeriesRange};
use crate::error::LedgerError;
use crate::lots::{match_fills, LotMatching, MatchedLot, OpenLot};
use crate::metrics::{
    drawdown, equity, equity_curve, fees_paid, realized_report, stats, unrealized, Drawdown,
    EquityPoint, LedgerStats, MarkPrices, RealizedPnlReport, TimeWindow, UnrealizedPnl,
};
use crate::record::{LedgerRepository, RecordQuery, SortOrder};

/// 조회 조건. owner는 필수이고 나머지는 선택이다.
///
/// `exchange`, `symbol`, `is_paper`는 체결에만 걸리고 이벤트에는 적용되지 않는다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub owner_id: String,
    pub bot_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub is_paper: Option<bool>,
    /// 목록 조회에만 적용 (집계는 무시)
    pub limit: Option<u64>,
}

impl LedgerQuery {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    pub fn bot(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = Some(bot_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn paper(mut self, is_paper: bool) -> Self {
        self.is_paper = Some(is_paper);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.since, self.until)
    }

    /// 목록 조회용 (최신순, limit 적용)
    fn listing(&self) -> RecordQuery {
        RecordQuery {
            order: SortOrder::NewestFirst,
            limit: self.limit,
            ..self.history(self.since, self.until)
        }
    }

    /// 집계용 (오래된순, limit 없음)
    fn history(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> RecordQuery {
        RecordQuery {
            owner_id: self.owner_id.clone(),
            bot_id: self.bot_id.clone(),
            since,
            until,
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            is_paper: self.is_paper,
            order: SortOrder::OldestFirst,
            limit: None,
        }
    }
}

/// 원장 파사드. 외부에서 원장에 접근하는 유일한 진입점이다.
///
/// 저장소는 호출자가 만들어 주입하고 수명도 호출자가 관리한다.
/// 모든 집계는 호출마다 추가 전용 기록에서 다시 계산하며 캐시하지 않는다.
#[derive(Clone)]
pub struct Ledger {
    repo: Arc<dyn LedgerRepository>,
}

impl Ledger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    /// 체결 추가. 같은 (owner, client_order_id)가 이미 있으면 기존 ID를 반환한다.
    pub async fn append_fill(&self, fill: NewFill) -> Result<i64, LedgerError> {
        fill.validate()?;
        let result = self.repo.insert_fill(&fill).await?;
        if result.is_duplicate() {
            debug!(
                "append_fill replayed for owner {} (fill {})",
                fill.owner_id,
                result.id()
            );
        }
        Ok(result.id())
    }

    /// 체결 여러 개를 한 번에 추가. 하나라도 검증에 실패하면 아무것도 저장하지 않는다.
    pub async fn append_fills(&self, fills: Vec<NewFill>) -> Result<Vec<i64>, LedgerError> {
        for fill in &fills {
            fill.validate()?;
        }
        let results = self.repo.insert_fills(&fills).await?;
        debug!(
            "append_fills stored {} fills ({} replayed)",
            results.len(),
            results.iter().filter(|r| r.is_duplicate()).count()
        );
        Ok(results.into_iter().map(|r| r.id()).collect())
    }

    pub async fn append_event(&self, event: NewEvent) -> Result<i64, LedgerError> {
        event.validate()?;
        Ok(self.repo.insert_event(&event).await?)
    }

    pub async fn get_fill(&self, owner_id: &str, id: i64) -> Result<Option<Fill>, LedgerError> {
        Ok(self.repo.find_fill(owner_id, id).await?)
    }

    /// 원본 체결 목록 (최신순)
    pub async fn get_fills(&self, query: &LedgerQuery) -> Result<Vec<Fill>, LedgerError> {
        Ok(self.repo.find_fills(&query.listing()).await?)
    }

    /// 원본 이벤트 목록 (최신순)
    pub async fn get_events(&self, query: &LedgerQuery) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self.repo.find_events(&query.listing()).await?)
    }

    /// `until` 시점(없으면 현재까지 전부)의 자산. `since`는 무시한다.
    pub async fn compute_equity(&self, query: &LedgerQuery) -> Result<Decimal, LedgerError> {
        let events = self.events_until(query).await?;
        let fills = self.fills_until(query, query.until).await?;
        let value = equity(&events, &fills, query.until)?;

        debug!("compute_equity owner={} -> {}", query.owner_id, value);
        Ok(value)
    }

    pub async fn compute_fees_paid(&self, query: &LedgerQuery) -> Result<Decimal, LedgerError> {
        let fills = self
            .repo
            .find_fills(&query.history(query.since, query.until))
            .await?;
        Ok(fees_paid(&fills, &TimeWindow::unbounded())?)
    }

    /// 구간 안에서 청산된 로트의 순손익 합
    pub async fn compute_realized_pnl(&self, query: &LedgerQuery) -> Result<Decimal, LedgerError> {
        Ok(self.realized_pnl_report(query).await?.net)
    }

    pub async fn realized_pnl_report(
        &self,
        query: &LedgerQuery,
    ) -> Result<RealizedPnlReport, LedgerError> {
        let matching = self.matching(query).await?;
        let report = realized_report(&matching.matched, &query.window())?;

        debug!(
            "realized_pnl owner={} lots={} net={}",
            query.owner_id, report.closed_lots, report.net
        );
        Ok(report)
    }

    /// 구간 안에서 청산된 로트 (최신 청산순, limit 적용)
    pub async fn matched_lots(&self, query: &LedgerQuery) -> Result<Vec<MatchedLot>, LedgerError> {
        let window = query.window();
        let matching = self.matching(query).await?;

        let lots = matching
            .matched
            .into_iter()
            .rev()
            .filter(|lot| window.contains(&lot.closed_at));
        Ok(match query.limit {
            Some(limit) => lots.take(limit as usize).collect(),
            None => lots.collect(),
        })
    }

    /// `until` 시점에 아직 열린 로트
    pub async fn open_lots(&self, query: &LedgerQuery) -> Result<Vec<OpenLot>, LedgerError> {
        Ok(self.matching(query).await?.open)
    }

    /// 호출자가 준 평가 가격으로 열린 로트를 평가한다. 가격 조회는 하지 않는다.
    pub async fn compute_unrealized_pnl(
        &self,
        query: &LedgerQuery,
        marks: &MarkPrices,
    ) -> Result<UnrealizedPnl, LedgerError> {
        let open = self.open_lots(query).await?;
        Ok(unrealized(&open, marks)?)
    }

    /// 자산 곡선. 값은 전체 이력으로 계산하고 `since` 이후 점만 돌려준다.
    pub async fn equity_curve(&self, query: &LedgerQuery) -> Result<Vec<EquityPoint>, LedgerError> {
        let window = query.window();
        let curve = self.full_curve(query).await?;
        Ok(curve
            .into_iter()
            .filter(|point| window.contains(&point.timestamp))
            .collect())
    }

    pub async fn compute_drawdown(&self, query: &LedgerQuery) -> Result<Drawdown, LedgerError> {
        let curve = self.full_curve(query).await?;
        let result = drawdown(&curve, query.since);

        debug!(
            "compute_drawdown owner={} current={} max={}",
            query.owner_id, result.current_pct, result.max_pct
        );
        Ok(result)
    }

    pub async fn get_stats(&self, query: &LedgerQuery) -> Result<LedgerStats, LedgerError> {
        let fills = self.fills_until(query, query.until).await?;
        let matching = self.match_history(&fills)?;
        Ok(stats(&fills, &matching.matched, &query.window())?)
    }

    /// 달력 버킷별 수익. `since`가 없으면 첫 체결과 첫 이벤트 중 이른 쪽부터,
    /// `until`이 없으면 현재까지. 기록이 하나도 없고 `since`도 없으면 빈 시계열이다.
    pub async fn profit_series(
        &self,
        query: &LedgerQuery,
        period: Period,
    ) -> Result<Vec<ProfitBucket>, LedgerError> {
        let until = query.until.unwrap_or_else(Utc::now);
        let since = match query.since {
            Some(since) => since,
            None => {
                let first_fill = self.first_fill_at(query, until).await?;
                let first_event = self.first_event_at(query, until).await?;
                match first_fill.into_iter().chain(first_event).min() {
                    Some(first) => first,
                    None => return Ok(Vec::new()),
                }
            }
        };

        let range = SeriesRange::covering(since, until, period);
        self.profit_series_in(query, &range).await
    }

    /// 주어진 버킷 구간으로 수익 시계열 계산. `query`의 시간 조건은 무시한다.
    pub async fn profit_series_in(
        &self,
        query: &LedgerQuery,
        range: &SeriesRange,
    ) -> Result<Vec<ProfitBucket>, LedgerError> {
        let fills = self.fills_until(query, range.window().until).await?;
        let matching = self.match_history(&fills)?;
        let series = profit_series(&fills, &matching.matched, range)?;

        debug!(
            "profit_series owner={} period={} buckets={}",
            query.owner_id,
            range.period,
            series.len()
        );
        Ok(series)
    }

    async fn fills_until(
        &self,
        query: &LedgerQuery,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Fill>, LedgerError> {
        Ok(self.repo.find_fills(&query.history(None, until)).await?)
    }

    async fn events_until(&self, query: &LedgerQuery) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self
            .repo
            .find_events(&query.history(None, query.until))
            .await?)
    }

    async fn first_fill_at(
        &self,
        query: &LedgerQuery,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let first = RecordQuery {
            limit: Some(1),
            ..query.history(None, Some(until))
        };
        let fills = self.repo.find_fills(&first).await?;
        Ok(fills.first().map(|fill| fill.timestamp))
    }

    async fn first_event_at(
        &self,
        query: &LedgerQuery,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let first = RecordQuery {
            limit: Some(1),
            ..query.history(None, Some(until))
        };
        let events = self.repo.find_events(&first).await?;
        Ok(events.first().map(|event| event.timestamp))
    }

    /// 로트 매칭은 구간 시작과 관계없이 `until`까지의 전체 이력을 쓴다
    async fn matching(&self, query: &LedgerQuery) -> Result<LotMatching, LedgerError> {
        let fills = self.fills_until(query, query.until).await?;
        self.match_history(&fills)
    }

    fn match_history(&self, fills: &[Fill]) -> Result<LotMatching, LedgerError> {
        Ok(match_fills(fills)?)
    }

    async fn full_curve(&self, query: &LedgerQuery) -> Result<Vec<EquityPoint>, LedgerError> {
        let events = self.events_until(query).await?;
        let fills = self.fills_until(query, query.until).await?;
        Ok(equity_curve(&events, &fills)?)
    }
}

/// `SeriesRange::last`로 만든 구간과 같은 범위를 덮는 조회 조건
pub fn query_for_range(owner_id: impl Into<String>, range: &SeriesRange) -> LedgerQuery {
    LedgerQuery::new(owner_id)
        .since(range.start)
        .until(range.window().until.unwrap_or(range.end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_listing_query_is_newest_first_and_limited() {
        let query = LedgerQuery::new("user-1").bot("bot-a").limit(10);
        let record = query.listing();

        assert_eq!(record.owner_id, "user-1");
        assert_eq!(record.bot_id.as_deref(), Some("bot-a"));
        assert_eq!(record.order, SortOrder::NewestFirst);
        assert_eq!(record.limit, Some(10));
    }

    #[test]
    fn test_history_query_ignores_limit() {
        let until = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let query = LedgerQuery::new("user-1")
            .exchange("binance")
            .paper(false)
            .until(until)
            .limit(3);
        let record = query.history(None, query.until);

        assert_eq!(record.order, SortOrder::OldestFirst);
        assert_eq!(record.limit, None);
        assert_eq!(record.since, None);
        assert_eq!(record.until, Some(until));
        assert_eq!(record.exchange.as_deref(), Some("binance"));
        assert_eq!(record.is_paper, Some(false));
    }

    #[test]
    fn test_query_for_range_covers_last_bucket() {
        let now = Utc.with_ymd_and_hms(2024, 6, 5, 15, 0, 0).unwrap();
        let range = SeriesRange::last(Period::Daily, 7, now);
        let query = query_for_range("user-1", &range);

        assert_eq!(query.since, Some(range.start));
        let until = query.until.unwrap();
        assert!(range.contains(&until));
        assert!(until > now);
        assert_eq!(until, range.end - Duration::nanoseconds(1));
    }
}
