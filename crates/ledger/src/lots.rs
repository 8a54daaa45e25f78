//! FIFO 로트 매칭 엔진.
//!
//! 같은 상품의 체결을 시간 순으로 받아 먼저 열린 로트부터 닫는다.
//! 반대 방향 체결이 열린 로트보다 크면 남은 수량이 반대 방향 새 로트가 된다 (포지션 반전).
//! 수수료는 수량 비율로 나누어 양쪽 다리에서 실현 손익에서 뺀다.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use interface::{Fill, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 로트 매칭 단위. 거래소나 실거래/모의 거래가 다르면 서로 상계되지 않는다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub symbol: String,
    pub is_paper: bool,
}

impl InstrumentKey {
    pub fn of(fill: &Fill) -> Self {
        Self {
            exchange: fill.exchange.clone(),
            symbol: fill.symbol.clone(),
            is_paper: fill.is_paper,
        }
    }
}

/// 아직 닫히지 않은 로트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenLot {
    pub instrument: InstrumentKey,
    /// 로트를 연 체결 ID
    pub fill_id: i64,
    pub bot_id: Option<String>,
    /// 매수면 롱, 매도면 숏
    pub side: Side,
    /// 남은 수량
    pub qty: Decimal,
    pub price: Decimal,
    /// 남은 수량에 배분된 수수료
    pub fee: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// 매칭된 (진입, 청산) 로트 쌍
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedLot {
    pub instrument: InstrumentKey,
    /// 진입 로트 방향
    pub side: Side,
    pub qty: Decimal,
    pub open_fill_id: i64,
    pub close_fill_id: i64,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// qty * (청산가 - 진입가) * 방향 부호
    pub gross_pnl: Decimal,
    /// 양쪽 다리에서 배분된 수수료 합
    pub fees: Decimal,
    /// gross_pnl - fees
    pub net_pnl: Decimal,
}

impl MatchedLot {
    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.net_pnl < Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LotError {
    #[error("fill {fill_id}: {field} must be positive, got {value}")]
    NonPositive {
        fill_id: i64,
        field: &'static str,
        value: Decimal,
    },
    #[error("fill {fill_id}: fee must not be negative, got {fee}")]
    NegativeFee { fill_id: i64, fee: Decimal },
    #[error("fill {fill_id}: decimal overflow while matching lots")]
    Overflow { fill_id: i64 },
}

/// 상품별 열린 로트 큐. 한 큐 안의 로트는 항상 같은 방향이다.
#[derive(Debug, Clone, Default)]
pub struct LotBook {
    books: BTreeMap<InstrumentKey, VecDeque<OpenLot>>,
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 체결 하나를 반영하고 이번에 닫힌 로트들을 돌려준다.
    /// 체결은 (시간, ID) 오름차순으로 넣어야 한다.
    pub fn apply(&mut self, fill: &Fill) -> Result<Vec<MatchedLot>, LotError> {
        check_fill(fill)?;

        let key = InstrumentKey::of(fill);
        let queue = self.books.entry(key.clone()).or_default();

        let mut matched = Vec::new();
        let mut remaining_qty = fill.qty;
        let mut remaining_fee = fill.fee;

        while remaining_qty > Decimal::ZERO {
            let Some(front) = queue.front_mut() else {
                break;
            };
            if front.side == fill.side {
                break;
            }

            let qty = remaining_qty.min(front.qty);
            let open_fee = take_pro_rata(&mut front.fee, &mut front.qty, qty, fill.id)?;
            let close_fee = take_pro_rata(&mut remaining_fee, &mut remaining_qty, qty, fill.id)?;

            let gross_pnl = (fill.price - front.price)
                .checked_mul(qty)
                .map(|pnl| pnl * front.side.sign())
                .ok_or(LotError::Overflow { fill_id: fill.id })?;
            let fees = open_fee
                .checked_add(close_fee)
                .ok_or(LotError::Overflow { fill_id: fill.id })?;
            let net_pnl = gross_pnl
                .checked_sub(fees)
                .ok_or(LotError::Overflow { fill_id: fill.id })?;

            matched.push(MatchedLot {
                instrument: key.clone(),
                side: front.side,
                qty,
                open_fill_id: front.fill_id,
                close_fill_id: fill.id,
                open_price: front.price,
                close_price: fill.price,
                opened_at: front.opened_at,
                closed_at: fill.timestamp,
                gross_pnl,
                fees,
                net_pnl,
            });

            if front.qty.is_zero() {
                queue.pop_front();
            }
        }

        if remaining_qty > Decimal::ZERO {
            queue.push_back(OpenLot {
                instrument: key.clone(),
                fill_id: fill.id,
                bot_id: fill.bot_id.clone(),
                side: fill.side,
                qty: remaining_qty,
                price: fill.price,
                fee: remaining_fee,
                opened_at: fill.timestamp,
            });
        }

        if queue.is_empty() {
            self.books.remove(&key);
        }

        Ok(matched)
    }

    /// 열린 로트 전체 (상품 순, 상품 안에서는 FIFO 순)
    pub fn open_lots(&self) -> impl Iterator<Item = &OpenLot> {
        self.books.values().flat_map(|queue| queue.iter())
    }

    /// 상품의 부호 있는 순 포지션 (롱 양수, 숏 음수)
    pub fn position(&self, key: &InstrumentKey) -> Decimal {
        self.books
            .get(key)
            .map(|queue| queue.iter().map(|lot| lot.qty * lot.side.sign()).sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_flat(&self) -> bool {
        self.books.is_empty()
    }
}

/// 매칭 전체 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LotMatching {
    /// 청산 순서대로
    pub matched: Vec<MatchedLot>,
    pub open: Vec<OpenLot>,
}

/// 체결 목록 전체를 매칭한다. 입력 순서와 관계없이 (시간, ID) 순으로 처리한다.
pub fn match_fills(fills: &[Fill]) -> Result<LotMatching, LotError> {
    let mut ordered: Vec<&Fill> = fills.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let mut book = LotBook::new();
    let mut matched = Vec::new();
    for fill in ordered {
        matched.extend(book.apply(fill)?);
    }

    Ok(LotMatching {
        matched,
        open: book.open_lots().cloned().collect(),
    })
}

fn check_fill(fill: &Fill) -> Result<(), LotError> {
    if fill.qty <= Decimal::ZERO {
        return Err(LotError::NonPositive {
            fill_id: fill.id,
            field: "qty",
            value: fill.qty,
        });
    }
    if fill.price <= Decimal::ZERO {
        return Err(LotError::NonPositive {
            fill_id: fill.id,
            field: "price",
            value: fill.price,
        });
    }
    if fill.fee < Decimal::ZERO {
        return Err(LotError::NegativeFee {
            fill_id: fill.id,
            fee: fill.fee,
        });
    }
    Ok(())
}

/// 남은 수량 `qty` 중 `take`만큼 떼어내며 수수료도 같은 비율로 떼어낸다.
/// 전량이면 남은 수수료 전부를 가져가 자투리가 남지 않는다.
fn take_pro_rata(
    fee: &mut Decimal,
    qty: &mut Decimal,
    take: Decimal,
    fill_id: i64,
) -> Result<Decimal, LotError> {
    let portion = if take >= *qty {
        *fee
    } else {
        fee.checked_mul(take)
            .and_then(|scaled| scaled.checked_div(*qty))
            .ok_or(LotError::Overflow { fill_id })?
    };
    *fee -= portion;
    *qty -= take.min(*qty);
    Ok(portion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use interface::Metadata;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn fill(id: i64, side: Side, qty: Decimal, price: Decimal, fee: Decimal) -> Fill {
        Fill {
            id,
            owner_id: "user-1".to_string(),
            bot_id: None,
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            qty,
            price,
            fee,
            fee_currency: "USDT".to_string(),
            timestamp: t0() + Duration::minutes(id),
            order_id: None,
            client_order_id: None,
            exchange_trade_id: None,
            is_paper: true,
            metadata: Metadata::new(),
            created_at: t0(),
        }
    }

    #[test]
    fn test_fifo_closes_oldest_lot_first() {
        let fills = vec![
            fill(1, Side::Buy, dec!(10), dec!(100), dec!(0)),
            fill(2, Side::Buy, dec!(5), dec!(110), dec!(0)),
            fill(3, Side::Sell, dec!(12), dec!(120), dec!(0)),
        ];

        let result = match_fills(&fills).unwrap();

        assert_eq!(result.matched.len(), 2);
        assert_eq!(result.matched[0].open_fill_id, 1);
        assert_eq!(result.matched[0].qty, dec!(10));
        assert_eq!(result.matched[0].gross_pnl, dec!(200));
        assert_eq!(result.matched[1].open_fill_id, 2);
        assert_eq!(result.matched[1].qty, dec!(2));
        assert_eq!(result.matched[1].gross_pnl, dec!(20));

        let total: Decimal = result.matched.iter().map(|m| m.net_pnl).sum();
        assert_eq!(total, dec!(220));

        assert_eq!(result.open.len(), 1);
        assert_eq!(result.open[0].fill_id, 2);
        assert_eq!(result.open[0].side, Side::Buy);
        assert_eq!(result.open[0].qty, dec!(3));
    }

    #[test]
    fn test_fees_are_pro_rated_across_both_legs() {
        let fills = vec![
            fill(1, Side::Buy, dec!(10), dec!(100), dec!(1)),
            fill(2, Side::Buy, dec!(5), dec!(110), dec!(0.5)),
            fill(3, Side::Sell, dec!(12), dec!(120), dec!(1.2)),
        ];

        let result = match_fills(&fills).unwrap();

        // 1번 로트: 진입 수수료 전부 1 + 청산 수수료 10/12 = 1.0
        assert_eq!(result.matched[0].fees, dec!(2));
        // 2번 로트: 진입 수수료 2/5 = 0.2 + 청산 수수료 나머지 0.2
        assert_eq!(result.matched[1].fees, dec!(0.4));

        let net: Decimal = result.matched.iter().map(|m| m.net_pnl).sum();
        assert_eq!(net, dec!(217.6));

        assert_eq!(result.open[0].fee, dec!(0.3));
    }

    #[test]
    fn test_simple_round_trip() {
        let fills = vec![
            fill(1, Side::Buy, dec!(1), dec!(50000), dec!(0.5)),
            fill(2, Side::Sell, dec!(1), dec!(51000), dec!(0.5)),
        ];

        let result = match_fills(&fills).unwrap();

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].gross_pnl, dec!(1000));
        assert_eq!(result.matched[0].net_pnl, dec!(999));
        assert!(result.open.is_empty());
    }

    #[test]
    fn test_reversal_opens_opposite_lot() {
        let fills = vec![
            fill(1, Side::Buy, dec!(5), dec!(100), dec!(0)),
            fill(2, Side::Sell, dec!(8), dec!(110), dec!(0)),
        ];

        let result = match_fills(&fills).unwrap();

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].gross_pnl, dec!(50));
        assert_eq!(result.open.len(), 1);
        assert_eq!(result.open[0].side, Side::Sell);
        assert_eq!(result.open[0].qty, dec!(3));
        assert_eq!(result.open[0].price, dec!(110));
        assert_eq!(result.open[0].fill_id, 2);
    }

    #[test]
    fn test_reversal_carries_remaining_fee() {
        let fills = vec![
            fill(1, Side::Buy, dec!(5), dec!(100), dec!(0)),
            fill(2, Side::Sell, dec!(8), dec!(110), dec!(0.8)),
        ];

        let result = match_fills(&fills).unwrap();

        assert_eq!(result.matched[0].fees, dec!(0.5));
        assert_eq!(result.open[0].fee, dec!(0.3));
    }

    #[test]
    fn test_closing_fill_without_open_lots_starts_short() {
        let fills = vec![
            fill(1, Side::Sell, dec!(2), dec!(100), dec!(0)),
            fill(2, Side::Buy, dec!(2), dec!(90), dec!(0)),
        ];

        let result = match_fills(&fills).unwrap();

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].side, Side::Sell);
        // 숏은 가격이 내려가면 이익
        assert_eq!(result.matched[0].gross_pnl, dec!(20));
        assert!(result.open.is_empty());
    }

    #[test]
    fn test_instruments_do_not_offset_each_other() {
        let mut other_venue = fill(2, Side::Sell, dec!(1), dec!(110), dec!(0));
        other_venue.exchange = "bybit".to_string();
        let mut live = fill(3, Side::Sell, dec!(1), dec!(110), dec!(0));
        live.is_paper = false;

        let fills = vec![fill(1, Side::Buy, dec!(1), dec!(100), dec!(0)), other_venue, live];

        let result = match_fills(&fills).unwrap();

        assert!(result.matched.is_empty());
        assert_eq!(result.open.len(), 3);
    }

    #[test]
    fn test_equal_timestamps_fall_back_to_insertion_order() {
        let first = fill(1, Side::Buy, dec!(1), dec!(100), dec!(0));
        let mut second = fill(2, Side::Buy, dec!(1), dec!(200), dec!(0));
        second.timestamp = first.timestamp;
        let close = fill(3, Side::Sell, dec!(1), dec!(150), dec!(0));

        // 입력 순서를 뒤집어도 ID가 작은 로트가 먼저 닫힌다
        let result = match_fills(&[close, second, first]).unwrap();

        assert_eq!(result.matched[0].open_fill_id, 1);
        assert_eq!(result.matched[0].gross_pnl, dec!(50));
        assert_eq!(result.open[0].fill_id, 2);
    }

    #[test]
    fn test_lot_book_position_tracking() {
        let mut book = LotBook::new();
        let buy = fill(1, Side::Buy, dec!(4), dec!(100), dec!(0));
        let key = InstrumentKey::of(&buy);

        book.apply(&buy).unwrap();
        assert_eq!(book.position(&key), dec!(4));

        book.apply(&fill(2, Side::Sell, dec!(6), dec!(101), dec!(0)))
            .unwrap();
        assert_eq!(book.position(&key), dec!(-2));

        book.apply(&fill(3, Side::Buy, dec!(2), dec!(99), dec!(0)))
            .unwrap();
        assert!(book.is_flat());
    }

    #[test]
    fn test_malformed_fill_is_rejected() {
        let bad = fill(7, Side::Buy, dec!(0), dec!(100), dec!(0));
        assert_eq!(
            match_fills(&[bad]),
            Err(LotError::NonPositive {
                fill_id: 7,
                field: "qty",
                value: dec!(0)
            })
        );

        let bad_fee = fill(8, Side::Buy, dec!(1), dec!(100), dec!(-1));
        assert!(matches!(
            match_fills(&[bad_fee]),
            Err(LotError::NegativeFee { fill_id: 8, .. })
        ));
    }
}
