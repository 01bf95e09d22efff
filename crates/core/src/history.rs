//! Stage occupancy timelines rebuilt from stage-change events.
//!
//! Events arrive unordered and incomplete as a matter of course. Sorting is by
//! timestamp, then sequence number, then canonical pipeline order. At one
//! instant, events carrying a sequence number sort before events without one.
//! The resulting intervals are contiguous: each interval exits exactly when
//! the next one enters.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deal::{Deal, DealId};
use crate::domain::stage::{PipelineDefinition, StageEvent, StageId, StageInterval};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealHistory {
    pub deal_id: DealId,
    pub intervals: Vec<StageInterval>,
}

impl DealHistory {
    /// The open interval the deal currently occupies, if any.
    pub fn current(&self) -> Option<&StageInterval> {
        self.intervals.last().filter(|interval| interval.is_open())
    }

    /// Whether the deal ever occupied `stage`. Any won stage counts as
    /// reaching a won milestone.
    pub fn reached(&self, pipeline: &PipelineDefinition, stage: &StageId) -> bool {
        self.intervals.iter().any(|interval| pipeline.matches_milestone(stage, &interval.stage))
    }

    pub fn first_entry(
        &self,
        pipeline: &PipelineDefinition,
        stage: &StageId,
    ) -> Option<DateTime<Utc>> {
        self.intervals
            .iter()
            .filter(|interval| pipeline.matches_milestone(stage, &interval.stage))
            .map(|interval| interval.entered_at)
            .min()
    }

    /// True when the deal occupied `to` at or after first entering `from`.
    pub fn reached_after(
        &self,
        pipeline: &PipelineDefinition,
        from: &StageId,
        to: &StageId,
    ) -> bool {
        let Some(first_from) = self.first_entry(pipeline, from) else {
            return false;
        };
        self.intervals.iter().any(|interval| {
            pipeline.matches_milestone(to, &interval.stage) && interval.entered_at >= first_from
        })
    }

    /// Whether the deal occupied `milestone` or any later stage of the
    /// progress path.
    pub fn passed(&self, pipeline: &PipelineDefinition, milestone: &StageId) -> bool {
        let Some(target) = pipeline.progress_position(milestone) else {
            return self.reached(pipeline, milestone);
        };
        self.intervals.iter().any(|interval| {
            pipeline.progress_position(&interval.stage).is_some_and(|position| position >= target)
        })
    }

    /// Last non-terminal stage occupied before the deal closed.
    pub fn closing_stage<'p>(&'p self, pipeline: &PipelineDefinition) -> Option<&'p StageId> {
        self.intervals
            .iter()
            .rev()
            .map(|interval| &interval.stage)
            .find(|stage| !pipeline.is_terminal(stage))
    }

    pub fn last_stage_change(&self) -> Option<DateTime<Utc>> {
        self.intervals.last().map(|interval| interval.entered_at)
    }
}

pub struct StageHistoryBuilder<'a> {
    pipeline: &'a PipelineDefinition,
}

impl<'a> StageHistoryBuilder<'a> {
    pub fn new(pipeline: &'a PipelineDefinition) -> Self {
        Self { pipeline }
    }

    pub fn build(&self, deal: &Deal, events: &[StageEvent]) -> DealHistory {
        let mut ordered: Vec<&StageEvent> =
            events.iter().filter(|event| event.deal_id == deal.id).collect();
        ordered.sort_by(|left, right| self.compare_events(left, right));

        let terminal_close = if deal.is_closed() { deal.closed_at } else { None };
        let mut intervals: Vec<StageInterval> = Vec::with_capacity(ordered.len() + 2);

        let Some(first) = ordered.first() else {
            let exited_at = terminal_close.map(|closed_at| closed_at.max(deal.created_at));
            intervals.push(StageInterval {
                stage: deal.stage.clone(),
                entered_at: deal.created_at,
                exited_at,
                synthetic: true,
            });
            return DealHistory { deal_id: deal.id.clone(), intervals };
        };

        let mut backdate_first = false;
        if first.entered_at > deal.created_at {
            let stage =
                first.previous_stage.clone().unwrap_or_else(|| self.pipeline.first_stage().clone());
            if stage == first.stage {
                backdate_first = true;
            } else {
                intervals.push(StageInterval {
                    stage,
                    entered_at: deal.created_at,
                    exited_at: Some(first.entered_at),
                    synthetic: true,
                });
            }
        }

        for (index, event) in ordered.iter().enumerate() {
            if let Some(open) = intervals.last() {
                if open.stage == event.stage {
                    // Repeated event for the stage already occupied.
                    continue;
                }
            }
            if let Some(previous) = intervals.last_mut() {
                previous.exited_at = Some(event.entered_at);
            }

            let entered_at =
                if index == 0 && backdate_first { deal.created_at } else { event.entered_at };
            intervals.push(StageInterval {
                stage: event.stage.clone(),
                entered_at,
                exited_at: None,
                synthetic: false,
            });
        }

        self.reconcile_current_stage(deal, &mut intervals);

        if let (Some(closed_at), Some(last)) = (terminal_close, intervals.last_mut()) {
            last.exited_at = Some(closed_at.max(last.entered_at));
        }

        DealHistory { deal_id: deal.id.clone(), intervals }
    }

    /// Builds every deal's history, grouping events by deal first. Output
    /// order follows `deals`.
    pub fn build_all(&self, deals: &[Deal], events: &[StageEvent]) -> Vec<DealHistory> {
        let grouped = group_events_by_deal(events);
        deals
            .iter()
            .map(|deal| {
                let deal_events = grouped.get(&deal.id).map(Vec::as_slice).unwrap_or(&[]);
                self.build(deal, deal_events)
            })
            .collect()
    }

    fn compare_events(&self, left: &StageEvent, right: &StageEvent) -> Ordering {
        left.entered_at
            .cmp(&right.entered_at)
            .then_with(|| match (left.sequence, right.sequence) {
                (Some(left_seq), Some(right_seq)) => left_seq.cmp(&right_seq),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| {
                self.pipeline.order_key(&left.stage).cmp(&self.pipeline.order_key(&right.stage))
            })
    }

    /// The record's current stage is authoritative. When the event log ends
    /// somewhere else, append the current stage after the last event.
    fn reconcile_current_stage(&self, deal: &Deal, intervals: &mut Vec<StageInterval>) {
        let Some(last) = intervals.last_mut() else {
            return;
        };
        if last.stage == deal.stage {
            return;
        }

        let candidate = if deal.is_closed() {
            deal.closed_at.unwrap_or(last.entered_at)
        } else {
            deal.stage_entered_at.unwrap_or(last.entered_at)
        };
        let entered_at = candidate.max(last.entered_at);
        last.exited_at = Some(entered_at);

        intervals.push(StageInterval {
            stage: deal.stage.clone(),
            entered_at,
            exited_at: None,
            synthetic: true,
        });
    }
}

pub fn group_events_by_deal(events: &[StageEvent]) -> HashMap<DealId, Vec<StageEvent>> {
    let mut grouped: HashMap<DealId, Vec<StageEvent>> = HashMap::new();
    for event in events {
        grouped.entry(event.deal_id.clone()).or_default().push(event.clone());
    }
    grouped
}
