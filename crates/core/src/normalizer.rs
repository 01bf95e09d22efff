//! Raw CRM records to canonical deals and stage events.
//!
//! Every record is validated on its own. A bad record becomes a
//! [`ValidationError`] in the skipped list and the run continues with the
//! rest. Fields the core does not interpret ride along as opaque metadata.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::domain::deal::{Deal, DealId, DealStatus, OwnerId, TeamId};
use crate::domain::stage::{PipelineDefinition, StageEvent, StageId};
use crate::errors::{RecordKind, ValidationError, ValidationErrorKind};

pub type RawRecord = Map<String, Value>;

const ID_FIELDS: &[&str] = &["id", "deal_id", "record id", "hs_object_id"];
const NAME_FIELDS: &[&str] = &["name", "deal name", "dealname", "contract: company name"];
const AMOUNT_FIELDS: &[&str] = &["amount"];
const STAGE_FIELDS: &[&str] = &["stage", "deal stage", "dealstage"];
const STATUS_FIELDS: &[&str] = &["status", "deal status"];
const OWNER_FIELDS: &[&str] = &["owner_id", "owner", "deal owner", "hubspot_owner_id"];
const TEAM_FIELDS: &[&str] = &["team_id", "team"];
const BDR_FIELDS: &[&str] = &["bdr", "bdr_id", "sdr"];
const CREATED_FIELDS: &[&str] = &["created_at", "create date", "createdate"];
const CLOSED_FIELDS: &[&str] = &["closed_at", "close date", "closedate"];
const EXPECTED_CLOSE_FIELDS: &[&str] = &["expected_close_at", "expected closing date"];
const MODIFIED_FIELDS: &[&str] =
    &["last_modified_at", "last modified date", "hs_lastmodifieddate"];
const STAGE_ENTERED_FIELDS: &[&str] = &["stage_entered_at", "current stage entered"];
const LOSS_REASON_FIELDS: &[&str] = &[
    "loss_reason",
    "hs_lost_reason",
    "close lost reason",
    "close_lost_reason",
    "dropped reason (remark)",
    "dropped reason",
];

const DEAL_FIELD_GROUPS: &[&[&str]] = &[
    ID_FIELDS,
    NAME_FIELDS,
    AMOUNT_FIELDS,
    STAGE_FIELDS,
    STATUS_FIELDS,
    OWNER_FIELDS,
    TEAM_FIELDS,
    BDR_FIELDS,
    CREATED_FIELDS,
    CLOSED_FIELDS,
    EXPECTED_CLOSE_FIELDS,
    MODIFIED_FIELDS,
    STAGE_ENTERED_FIELDS,
    LOSS_REASON_FIELDS,
];

const EVENT_DEAL_FIELDS: &[&str] = &["deal_id", "dealid", "deal id"];
const EVENT_STAGE_FIELDS: &[&str] = &["stage", "to_stage"];
const EVENT_TIME_FIELDS: &[&str] = &["entered_at", "timestamp", "changed_at", "occurred_at"];
const EVENT_PREVIOUS_FIELDS: &[&str] = &["previous_stage", "from_stage"];
const EVENT_SEQUENCE_FIELDS: &[&str] = &["sequence", "seq", "sequence_number"];

/// Largest accepted deal amount, in currency units.
pub const MAX_AMOUNT_UNITS: i64 = 1_000_000_000_000_000;

/// Owner aliases and rep-to-team assignments supplied by configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDirectory {
    /// Raw owner value (email, CRM user id, display name) to canonical rep id.
    #[serde(default)]
    pub owners: BTreeMap<String, String>,
    /// Canonical rep id to team id.
    #[serde(default)]
    pub teams: BTreeMap<String, String>,
}

impl IdentityDirectory {
    pub fn resolve_owner(&self, raw: Option<&str>) -> OwnerId {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => {
                OwnerId(self.owners.get(value).cloned().unwrap_or_else(|| value.to_string()))
            }
            None => OwnerId::unassigned(),
        }
    }

    pub fn resolve_team(&self, raw: Option<&str>, owner: &OwnerId) -> TeamId {
        if let Some(value) = raw.map(str::trim).filter(|value| !value.is_empty()) {
            return TeamId(value.to_string());
        }

        self.teams
            .get(&owner.0)
            .map(|team| TeamId(team.clone()))
            .unwrap_or_else(TeamId::unassigned)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedDeals {
    pub deals: Vec<Deal>,
    pub skipped: Vec<ValidationError>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedEvents {
    pub events: Vec<StageEvent>,
    pub skipped: Vec<ValidationError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowBasis {
    Created,
    EffectiveClose,
    LastModified,
}

impl WindowBasis {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "created" => Some(Self::Created),
            "effective_close" | "close" => Some(Self::EffectiveClose),
            "last_modified" | "modified" => Some(Self::LastModified),
            _ => None,
        }
    }
}

/// Inclusive date-range filter over the deal population. Deals without a
/// value for the chosen basis fall outside every window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    pub basis: WindowBasis,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SnapshotWindow {
    pub fn contains(&self, deal: &Deal) -> bool {
        let anchor = match self.basis {
            WindowBasis::Created => Some(deal.created_at),
            WindowBasis::EffectiveClose => deal.effective_close_at(),
            WindowBasis::LastModified => deal.last_modified_at,
        };
        anchor.map(|at| at >= self.start && at <= self.end).unwrap_or(false)
    }
}

pub struct DealNormalizer<'a> {
    pipeline: &'a PipelineDefinition,
    identity: &'a IdentityDirectory,
}

impl<'a> DealNormalizer<'a> {
    pub fn new(pipeline: &'a PipelineDefinition, identity: &'a IdentityDirectory) -> Self {
        Self { pipeline, identity }
    }

    pub fn normalize_deals(&self, records: &[RawRecord]) -> NormalizedDeals {
        let mut output = NormalizedDeals::default();
        let mut seen = HashSet::new();

        for (index, record) in records.iter().enumerate() {
            let result = self.normalize_deal(index, record).and_then(|deal| {
                if seen.insert(deal.id.clone()) {
                    Ok(deal)
                } else {
                    Err(ValidationError::new(
                        RecordKind::Deal,
                        index,
                        Some(deal.id.0.clone()),
                        ValidationErrorKind::DuplicateDeal { deal_id: deal.id.0 },
                    ))
                }
            });

            match result {
                Ok(deal) => output.deals.push(deal),
                Err(error) => {
                    warn!(
                        event_name = "normalizer.deal.skipped",
                        record_index = index,
                        record_id = error.record_id.as_deref().unwrap_or("unknown"),
                        reason = %error.kind,
                        "skipping invalid deal record"
                    );
                    output.skipped.push(error);
                }
            }
        }

        debug!(
            event_name = "normalizer.deals.completed",
            accepted = output.deals.len(),
            skipped = output.skipped.len(),
            "deal normalization finished"
        );
        output
    }

    /// `known_deals` holds the ids that survived deal normalization; events
    /// for anything else are reported, not attached.
    pub fn normalize_events(
        &self,
        records: &[RawRecord],
        known_deals: &HashSet<DealId>,
    ) -> NormalizedEvents {
        let mut output = NormalizedEvents::default();

        for (index, record) in records.iter().enumerate() {
            match self.normalize_event(index, record, known_deals) {
                Ok(event) => output.events.push(event),
                Err(error) => {
                    warn!(
                        event_name = "normalizer.event.skipped",
                        record_index = index,
                        record_id = error.record_id.as_deref().unwrap_or("unknown"),
                        reason = %error.kind,
                        "skipping invalid stage event record"
                    );
                    output.skipped.push(error);
                }
            }
        }

        debug!(
            event_name = "normalizer.events.completed",
            accepted = output.events.len(),
            skipped = output.skipped.len(),
            "stage event normalization finished"
        );
        output
    }

    fn normalize_deal(&self, index: usize, record: &RawRecord) -> Result<Deal, ValidationError> {
        let fields = FieldIndex::new(record);
        let fail = |record_id: Option<&str>, kind| {
            ValidationError::new(RecordKind::Deal, index, record_id.map(str::to_string), kind)
        };

        let id = fields
            .text(ID_FIELDS)
            .ok_or_else(|| fail(None, missing("id")))?;
        let record_id = Some(id.as_str());

        let amount_value =
            fields.value(AMOUNT_FIELDS).ok_or_else(|| fail(record_id, missing("amount")))?;
        let amount = parse_amount(amount_value)
            .filter(|amount| !amount.is_sign_negative() || amount.is_zero())
            .ok_or_else(|| fail(record_id, invalid("amount", amount_value)))?;
        let max_amount = Decimal::from(MAX_AMOUNT_UNITS);
        if amount > max_amount {
            return Err(fail(
                record_id,
                ValidationErrorKind::AmountOutOfRange {
                    value: amount.to_string(),
                    max: max_amount.to_string(),
                },
            ));
        }

        let raw_stage =
            fields.text(STAGE_FIELDS).ok_or_else(|| fail(record_id, missing("stage")))?;
        let stage = self.pipeline.resolve(&raw_stage).cloned().ok_or_else(|| {
            fail(record_id, ValidationErrorKind::UnknownStage { stage: raw_stage.clone() })
        })?;

        let status_value =
            fields.value(STATUS_FIELDS).ok_or_else(|| fail(record_id, missing("status")))?;
        let status = value_text(status_value)
            .and_then(|raw| DealStatus::parse(&raw))
            .ok_or_else(|| fail(record_id, invalid("status", status_value)))?;

        let created_value =
            fields.value(CREATED_FIELDS).ok_or_else(|| fail(record_id, missing("created_at")))?;
        let created_at = parse_timestamp(created_value)
            .ok_or_else(|| fail(record_id, invalid("created_at", created_value)))?;

        // Won means a won stage both ways. A lost deal may sit at any
        // non-won stage, which then names its stage of loss.
        let stage_won = self.pipeline.is_won(&stage);
        let stage_conflict = stage_won != (status == DealStatus::Won)
            || (self.pipeline.is_lost(&stage) && status != DealStatus::Lost);
        if stage_conflict {
            return Err(fail(
                record_id,
                ValidationErrorKind::StatusStageConflict {
                    status: status.as_str().to_string(),
                    stage: stage.0.clone(),
                },
            ));
        }

        let closed_at = match fields.value(CLOSED_FIELDS) {
            Some(value) => Some(
                parse_timestamp(value).ok_or_else(|| fail(record_id, invalid("closed_at", value)))?,
            ),
            None => None,
        };
        let mut expected_close_at = fields.value(EXPECTED_CLOSE_FIELDS).and_then(parse_timestamp);

        let closed_at = if status.is_terminal() {
            let closed_at = closed_at.ok_or_else(|| fail(record_id, missing("closed_at")))?;
            if closed_at < created_at {
                return Err(fail(
                    record_id,
                    ValidationErrorKind::InvalidField {
                        field: "closed_at".to_string(),
                        value: closed_at.to_rfc3339(),
                    },
                ));
            }
            Some(closed_at)
        } else {
            // An open deal's close date is a forecast, not a fact.
            expected_close_at = expected_close_at.or(closed_at);
            None
        };

        let owner = self.identity.resolve_owner(fields.text(OWNER_FIELDS).as_deref());
        let team = self.identity.resolve_team(fields.text(TEAM_FIELDS).as_deref(), &owner);
        let bdr = fields.text(BDR_FIELDS).map(|raw| self.identity.resolve_owner(Some(&raw)));
        let loss_reason = match status {
            DealStatus::Lost => fields.text(LOSS_REASON_FIELDS),
            DealStatus::Open | DealStatus::Won => None,
        };

        Ok(Deal {
            id: DealId(id.clone()),
            name: fields.text(NAME_FIELDS),
            owner,
            team,
            bdr,
            amount,
            stage,
            status,
            created_at,
            closed_at,
            expected_close_at,
            last_modified_at: fields.value(MODIFIED_FIELDS).and_then(parse_timestamp),
            stage_entered_at: fields.value(STAGE_ENTERED_FIELDS).and_then(parse_timestamp),
            loss_reason,
            metadata: fields.unrecognized(DEAL_FIELD_GROUPS),
        })
    }

    fn normalize_event(
        &self,
        index: usize,
        record: &RawRecord,
        known_deals: &HashSet<DealId>,
    ) -> Result<StageEvent, ValidationError> {
        let fields = FieldIndex::new(record);
        let fail = |record_id: Option<&str>, kind| {
            ValidationError::new(RecordKind::StageEvent, index, record_id.map(str::to_string), kind)
        };

        let deal_id = fields
            .text(EVENT_DEAL_FIELDS)
            .ok_or_else(|| fail(None, missing("deal_id")))?;
        let record_id = Some(deal_id.as_str());

        let deal_id = DealId(deal_id.clone());
        if !known_deals.contains(&deal_id) {
            return Err(fail(
                record_id,
                ValidationErrorKind::UnknownDeal { deal_id: deal_id.0.clone() },
            ));
        }

        let raw_stage =
            fields.text(EVENT_STAGE_FIELDS).ok_or_else(|| fail(record_id, missing("stage")))?;
        let stage = self.pipeline.resolve(&raw_stage).cloned().ok_or_else(|| {
            fail(record_id, ValidationErrorKind::UnknownStage { stage: raw_stage.clone() })
        })?;

        let time_value =
            fields.value(EVENT_TIME_FIELDS).ok_or_else(|| fail(record_id, missing("entered_at")))?;
        let entered_at = parse_timestamp(time_value)
            .ok_or_else(|| fail(record_id, invalid("entered_at", time_value)))?;

        let previous_stage = match fields.text(EVENT_PREVIOUS_FIELDS) {
            Some(raw) => Some(self.pipeline.resolve(&raw).cloned().ok_or_else(|| {
                fail(record_id, ValidationErrorKind::UnknownStage { stage: raw.clone() })
            })?),
            None => None,
        };

        let sequence = match fields.value(EVENT_SEQUENCE_FIELDS) {
            Some(value) => Some(
                value_text(value)
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .ok_or_else(|| fail(record_id, invalid("sequence", value)))?,
            ),
            None => None,
        };

        Ok(StageEvent { deal_id, stage, entered_at, previous_stage, sequence })
    }
}

/// Lowercased, trimmed view over a raw record's keys.
struct FieldIndex<'r> {
    record: &'r RawRecord,
    keys: HashMap<String, &'r str>,
}

impl<'r> FieldIndex<'r> {
    fn new(record: &'r RawRecord) -> Self {
        let keys =
            record.keys().map(|key| (key.trim().to_ascii_lowercase(), key.as_str())).collect();
        Self { record, keys }
    }

    /// First alias carrying a non-null, non-blank value.
    fn value(&self, aliases: &[&str]) -> Option<&'r Value> {
        aliases.iter().find_map(|alias| {
            let key = self.keys.get(*alias)?;
            let value = self.record.get(*key)?;
            match value {
                Value::Null => None,
                Value::String(text) if text.trim().is_empty() => None,
                other => Some(other),
            }
        })
    }

    fn text(&self, aliases: &[&str]) -> Option<String> {
        self.value(aliases).and_then(value_text)
    }

    fn unrecognized(&self, groups: &[&[&str]]) -> BTreeMap<String, Value> {
        self.record
            .iter()
            .filter(|(key, _)| {
                let normalized = key.trim().to_ascii_lowercase();
                !groups.iter().any(|aliases| aliases.contains(&normalized.as_str()))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn missing(field: &str) -> ValidationErrorKind {
    ValidationErrorKind::MissingField { field: field.to_string() }
}

fn invalid(field: &str, value: &Value) -> ValidationErrorKind {
    let value = value_text(value).unwrap_or_else(|| value.to_string());
    ValidationErrorKind::InvalidField { field: field.to_string(), value }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn parse_amount(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().trim_start_matches('$').replace([',', ' '], ""),
        _ => return None,
    };

    Decimal::from_str(&raw).ok().or_else(|| Decimal::from_scientific(&raw).ok())
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number.as_i64().and_then(from_epoch_millis),
        Value::String(text) => parse_timestamp_text(text.trim()),
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }

    text.parse::<i64>().ok().and_then(from_epoch_millis)
}

fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
