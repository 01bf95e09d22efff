use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::stage::StageId;

pub const UNASSIGNED: &str = "unassigned";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DealId(pub String);

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn unassigned() -> Self {
        Self(UNASSIGNED.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);

impl TeamId {
    pub fn unassigned() -> Self {
        Self(UNASSIGNED.to_string())
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Open,
    Won,
    Lost,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|ch| !ch.is_whitespace() && *ch != '_' && *ch != '-')
            .collect();
        match normalized.as_str() {
            "open" => Some(Self::Open),
            "won" | "closedwon" => Some(Self::Won),
            "lost" | "closedlost" => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

/// One sales opportunity as of the snapshot.
///
/// `closed_at` is set exactly when `status` is terminal and `amount` is never
/// negative; the normalizer refuses records that would break either rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub name: Option<String>,
    pub owner: OwnerId,
    pub team: TeamId,
    /// Business development rep who sourced the deal, when recorded.
    #[serde(default)]
    pub bdr: Option<OwnerId>,
    pub amount: Decimal,
    pub stage: StageId,
    pub status: DealStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub expected_close_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub stage_entered_at: Option<DateTime<Utc>>,
    pub loss_reason: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Deal {
    pub fn is_open(&self) -> bool {
        self.status == DealStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Expected close for open deals, actual close otherwise.
    pub fn effective_close_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            DealStatus::Open => self.expected_close_at,
            DealStatus::Won | DealStatus::Lost => self.closed_at.or(self.expected_close_at),
        }
    }

    pub fn sales_cycle_days(&self) -> Option<f64> {
        self.closed_at.map(|closed_at| days_between(self.created_at, closed_at))
    }
}

pub fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 86_400.0
}
