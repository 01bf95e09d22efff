pub mod attribution;
pub mod config;
pub mod domain;
pub mod errors;
pub mod forecast;
pub mod funnel;
pub mod history;
pub mod normalizer;
pub mod prioritization;
pub mod report;
pub mod stats;

pub use attribution::{
    AttributionConfig, AttributionReport, BdrPerformance, Dimension, LossReasonRow,
    LostDealReview, RepPerformance, RevenueKpis, WinLossAnalyzer, WinRateRow, WinRateTable,
    UNSPECIFIED_REASON,
};
pub use config::{
    parse_dimension_list, AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat,
};
pub use domain::deal::{Deal, DealId, DealStatus, OwnerId, TeamId};
pub use domain::stage::{PipelineDefinition, StageEvent, StageId, StageInterval};
pub use errors::{
    ConfigurationError, InsufficientDataWarning, RecordKind, ValidationError, ValidationErrorKind,
};
pub use forecast::{
    ForecastConfig, ForecastEngine, ForecastPeriod, ForecastReport, QuotaAttainment,
    StageProbability, UnlikelyReason,
};
pub use funnel::{
    Bottlenecks, DwellStats, FunnelAggregator, FunnelConfig, FunnelReport, StageConversion,
};
pub use history::{DealHistory, StageHistoryBuilder};
pub use normalizer::{
    DealNormalizer, IdentityDirectory, RawRecord, SnapshotWindow, WindowBasis, MAX_AMOUNT_UNITS,
};
pub use prioritization::{
    AwaitingCloseDeal, PrioritizationEngine, PrioritizationReport, RankedDeal, ScoringConfig,
};
pub use report::{PipelineAnalyzer, ResultBundle, Snapshot};
