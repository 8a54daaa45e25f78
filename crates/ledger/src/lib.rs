pub mod buckets;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logger;
pub mod lots;
pub mod metrics;
pub mod record;

pub use buckets::{ProfitBucket, SeriesRange};
pub use config::LedgerConfig;
pub use error::LedgerError;
pub use ledger::{query_for_range, Ledger, LedgerQuery};
pub use lots::{InstrumentKey, MatchedLot, OpenLot};
pub use metrics::{
    Drawdown, EquityPoint, LedgerStats, MarkPrices, MetricsError, RealizedPnlReport, TimeWindow,
    UnrealizedPnl,
};
