//! 달력 기준(UTC) 수익 시계열.
//!
//! 버킷 경계: 일 00:00, 주 월요일 00:00, 월 1일 00:00.
//! 체결은 저장된 시각 하나로만 버킷이 정해지며, 빈 버킷도 0으로 채워 내보낸다.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, TimeZone, Utc};
use interface::{Fill, Period};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::lots::MatchedLot;
use crate::metrics::{checked_add, notional_of, MetricsError, TimeWindow};

/// ts가 속한 버킷의 시작 시각
pub fn bucket_start(ts: DateTime<Utc>, period: Period) -> DateTime<Utc> {
    let date = ts.date_naive();
    let back = match period {
        Period::Daily => 0,
        Period::Weekly => date.weekday().num_days_from_monday(),
        Period::Monthly => date.day0(),
    };
    // 달력 하한 근처에서는 표현 가능한 첫 날로 붙인다
    midnight(
        date.checked_sub_days(Days::new(u64::from(back)))
            .unwrap_or(NaiveDate::MIN),
    )
}

/// 다음 버킷의 시작 시각 (`start`는 버킷 경계여야 한다).
/// 달력 상한을 넘으면 표현 가능한 마지막 시각에서 멈춘다.
pub fn next_bucket_start(start: DateTime<Utc>, period: Period) -> DateTime<Utc> {
    let step = match period {
        Period::Daily => Duration::days(1),
        Period::Weekly => Duration::weeks(1),
        Period::Monthly => Duration::days(days_in_month(start.year(), start.month())),
    };
    start
        .checked_add_signed(step)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN))
}

fn days_in_month(year: i32, month: u32) -> i64 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 31,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// 버킷으로 덮인 구간 [start, end). 항상 버킷 경계에 맞춰져 있다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRange {
    pub period: Period,
    /// 첫 버킷 시작
    pub start: DateTime<Utc>,
    /// 마지막 버킷 끝 (미포함)
    pub end: DateTime<Utc>,
}

impl SeriesRange {
    /// since가 속한 버킷부터 until이 속한 버킷까지
    pub fn covering(since: DateTime<Utc>, until: DateTime<Utc>, period: Period) -> Self {
        let start = bucket_start(since, period);
        let end = if until < since {
            start
        } else {
            next_bucket_start(bucket_start(until, period), period)
        };
        Self { period, start, end }
    }

    /// `now`가 속한 버킷으로 끝나는 최근 `count`개 버킷
    pub fn last(period: Period, count: usize, now: DateTime<Utc>) -> Self {
        let current = bucket_start(now, period);
        if count == 0 {
            return Self {
                period,
                start: current,
                end: current,
            };
        }

        // 달력 하한을 넘는 count는 표현 가능한 첫 버킷에서 자른다
        let back = count - 1;
        let start = match period {
            Period::Daily => i64::try_from(back)
                .ok()
                .and_then(Duration::try_days)
                .and_then(|span| current.checked_sub_signed(span)),
            Period::Weekly => i64::try_from(back)
                .ok()
                .and_then(Duration::try_weeks)
                .and_then(|span| current.checked_sub_signed(span)),
            Period::Monthly => u32::try_from(back)
                .ok()
                .and_then(|months| current.date_naive().checked_sub_months(Months::new(months)))
                .map(midnight),
        }
        .unwrap_or_else(|| bucket_start(DateTime::<Utc>::MIN_UTC, period));

        Self {
            period,
            start,
            end: next_bucket_start(current, period),
        }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }

    /// 저장소 조회용 닫힌 구간 (저장 정밀도가 나노초라 end 직전 1ns까지)
    pub fn window(&self) -> TimeWindow {
        let until = self
            .end
            .checked_sub_signed(Duration::nanoseconds(1))
            .unwrap_or(self.end);
        TimeWindow::new(Some(self.start), Some(until))
    }

    /// 버킷 시작 시각들 (오름차순)
    pub fn bucket_starts(&self) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            starts.push(cursor);
            let next = next_bucket_start(cursor, self.period);
            if next <= cursor {
                break;
            }
            cursor = next;
        }
        starts
    }
}

/// 시계열의 한 버킷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitBucket {
    pub bucket_start: DateTime<Utc>,
    /// 버킷 안 체결 수
    pub trades: usize,
    /// 버킷 안 체결 수수료 합
    pub fees: Decimal,
    /// 버킷 안 체결 대금 합
    pub volume: Decimal,
    /// 버킷 안에서 청산된 로트의 총손익 (수수료 차감 전)
    pub realized_pnl: Decimal,
    /// realized_pnl - fees
    pub net_profit: Decimal,
}

impl ProfitBucket {
    fn empty(bucket_start: DateTime<Utc>) -> Self {
        Self {
            bucket_start,
            trades: 0,
            fees: Decimal::ZERO,
            volume: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            net_profit: Decimal::ZERO,
        }
    }
}

/// 구간 안 모든 버킷을 시작 시각 오름차순으로 만든다.
/// `matched`는 청산 시각 기준으로 버킷에 들어가므로 구간 이전 이력까지 매칭한 결과를 넘겨도 된다.
pub fn profit_series(
    fills: &[Fill],
    matched: &[MatchedLot],
    range: &SeriesRange,
) -> Result<Vec<ProfitBucket>, MetricsError> {
    let mut buckets: BTreeMap<DateTime<Utc>, ProfitBucket> = range
        .bucket_starts()
        .into_iter()
        .map(|start| (start, ProfitBucket::empty(start)))
        .collect();

    for fill in fills.iter().filter(|fill| range.contains(&fill.timestamp)) {
        if let Some(bucket) = buckets.get_mut(&bucket_start(fill.timestamp, range.period)) {
            bucket.trades += 1;
            bucket.fees = checked_add("fees", bucket.fees, fill.fee)?;
            bucket.volume = checked_add("volume", bucket.volume, notional_of(fill)?)?;
        }
    }

    for lot in matched.iter().filter(|lot| range.contains(&lot.closed_at)) {
        if let Some(bucket) = buckets.get_mut(&bucket_start(lot.closed_at, range.period)) {
            bucket.realized_pnl = checked_add("realized pnl", bucket.realized_pnl, lot.gross_pnl)?;
        }
    }

    buckets
        .into_values()
        .map(|mut bucket| {
            bucket.net_profit = bucket
                .realized_pnl
                .checked_sub(bucket.fees)
                .ok_or(MetricsError::Overflow("net profit"))?;
            Ok(bucket)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lots::match_fills;
    use interface::{Metadata, Side};
    use rust_decimal_macros::dec;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn fill(id: i64, ts: DateTime<Utc>, side: Side, price: Decimal, fee: Decimal) -> Fill {
        Fill {
            id,
            owner_id: "user-1".to_string(),
            bot_id: None,
            exchange: "binance".to_string(),
            symbol: "ETH/USDT".to_string(),
            side,
            qty: dec!(1),
            price,
            fee,
            fee_currency: "USDT".to_string(),
            timestamp: ts,
            order_id: None,
            client_order_id: None,
            exchange_trade_id: None,
            is_paper: true,
            metadata: Metadata::new(),
            created_at: ts,
        }
    }

    #[test]
    fn test_bucket_start_alignment() {
        // 2024-06-05는 수요일
        let ts = at(2024, 6, 5, 15);
        assert_eq!(bucket_start(ts, Period::Daily), at(2024, 6, 5, 0));
        assert_eq!(bucket_start(ts, Period::Weekly), at(2024, 6, 3, 0));
        assert_eq!(bucket_start(ts, Period::Monthly), at(2024, 6, 1, 0));

        // 일요일은 앞선 월요일 주에 속한다
        assert_eq!(bucket_start(at(2024, 6, 9, 23), Period::Weekly), at(2024, 6, 3, 0));
        // 월요일 00:00은 그 주의 시작
        assert_eq!(bucket_start(at(2024, 6, 10, 0), Period::Weekly), at(2024, 6, 10, 0));
    }

    #[test]
    fn test_next_month_handles_year_end_and_leap_february() {
        assert_eq!(
            next_bucket_start(at(2023, 12, 1, 0), Period::Monthly),
            at(2024, 1, 1, 0)
        );
        assert_eq!(
            next_bucket_start(at(2024, 2, 1, 0), Period::Monthly),
            at(2024, 3, 1, 0)
        );
        assert_eq!(
            next_bucket_start(at(2023, 2, 1, 0), Period::Monthly),
            at(2023, 3, 1, 0)
        );
    }

    #[test]
    fn test_last_seven_days_has_seven_buckets() {
        let range = SeriesRange::last(Period::Daily, 7, at(2024, 6, 5, 15));
        let starts = range.bucket_starts();

        assert_eq!(starts.len(), 7);
        assert_eq!(starts[0], at(2024, 5, 30, 0));
        assert_eq!(starts[6], at(2024, 6, 5, 0));
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_last_months_cross_year_boundary() {
        let range = SeriesRange::last(Period::Monthly, 3, at(2024, 1, 20, 0));
        assert_eq!(
            range.bucket_starts(),
            vec![at(2023, 11, 1, 0), at(2023, 12, 1, 0), at(2024, 1, 1, 0)]
        );
        assert_eq!(range.end, at(2024, 2, 1, 0));
    }

    #[test]
    fn test_last_with_huge_count_clamps_to_calendar_start() {
        let now = at(2024, 6, 5, 15);
        for period in [Period::Daily, Period::Weekly, Period::Monthly] {
            let range = SeriesRange::last(period, usize::MAX, now);
            assert_eq!(range.end, next_bucket_start(bucket_start(now, period), period));
            assert_eq!(range.start, bucket_start(DateTime::<Utc>::MIN_UTC, period));
            assert!(range.contains(&now));
        }

        // 한도 안쪽의 큰 값은 그대로 계산된다
        let range = SeriesRange::last(Period::Monthly, 25, now);
        assert_eq!(range.start, at(2022, 6, 1, 0));
    }

    #[test]
    fn test_covering_range_is_inclusive_of_until_bucket() {
        let range = SeriesRange::covering(at(2024, 6, 3, 10), at(2024, 6, 17, 0), Period::Weekly);
        assert_eq!(range.bucket_starts().len(), 3);
        assert!(range.contains(&at(2024, 6, 23, 23)));
        assert!(!range.contains(&at(2024, 6, 24, 0)));

        let window = range.window();
        assert_eq!(window.since, Some(at(2024, 6, 3, 0)));
        assert!(window.contains(&(at(2024, 6, 24, 0) - Duration::nanoseconds(1))));
        assert!(!window.contains(&at(2024, 6, 24, 0)));

        let empty = SeriesRange::covering(at(2024, 6, 5, 0), at(2024, 6, 1, 0), Period::Daily);
        assert!(empty.bucket_starts().is_empty());
    }

    #[test]
    fn test_series_is_gap_free_and_attributes_pnl_to_close_bucket() {
        let fills = vec![
            // 구간 시작 전에 진입
            fill(1, at(2024, 5, 28, 12), Side::Buy, dec!(100), dec!(0.1)),
            fill(2, at(2024, 6, 1, 9), Side::Sell, dec!(120), dec!(0.2)),
            fill(3, at(2024, 6, 1, 10), Side::Buy, dec!(110), dec!(0.1)),
            fill(4, at(2024, 6, 4, 10), Side::Sell, dec!(105), dec!(0.1)),
        ];
        let matching = match_fills(&fills).unwrap();
        let range = SeriesRange::last(Period::Daily, 7, at(2024, 6, 5, 15));

        let series = profit_series(&fills, &matching.matched, &range).unwrap();

        assert_eq!(series.len(), 7);
        assert!(series.windows(2).all(|w| w[0].bucket_start < w[1].bucket_start));

        let june_first = &series[2];
        assert_eq!(june_first.bucket_start, at(2024, 6, 1, 0));
        assert_eq!(june_first.trades, 2);
        assert_eq!(june_first.fees, dec!(0.3));
        assert_eq!(june_first.volume, dec!(230));
        assert_eq!(june_first.realized_pnl, dec!(20));
        assert_eq!(june_first.net_profit, dec!(19.7));

        let june_fourth = &series[5];
        assert_eq!(june_fourth.realized_pnl, dec!(-5));
        assert_eq!(june_fourth.net_profit, dec!(-5.1));

        let empty_days = series.iter().filter(|b| b.trades == 0).count();
        assert_eq!(empty_days, 5);
        assert!(series
            .iter()
            .filter(|b| b.trades == 0)
            .all(|b| b.net_profit.is_zero() && b.volume.is_zero()));

        // 구간 밖 체결(5/28)의 수수료는 빠진다
        let total_fees: Decimal = series.iter().map(|b| b.fees).sum();
        assert_eq!(total_fees, dec!(0.4));
    }

    #[test]
    fn test_series_overflow_is_an_error() {
        let fills = vec![
            fill(1, at(2024, 6, 1, 9), Side::Buy, dec!(100), Decimal::MAX),
            fill(2, at(2024, 6, 1, 10), Side::Buy, dec!(100), Decimal::MAX),
        ];
        let range = SeriesRange::last(Period::Daily, 1, at(2024, 6, 1, 12));

        assert_eq!(
            profit_series(&fills, &[], &range),
            Err(MetricsError::Overflow("fees"))
        );
    }
}
