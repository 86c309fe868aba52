//! Deterministic replay of an orchestration over its recorded history
//!
//! Replay is a pure function of the history: it re-runs the orchestration
//! callbacks, matches every `ScheduleActivity` decision against the recorded
//! `ActivityScheduled` events, and returns only the events that are new in
//! this activation. Nothing here touches the store.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::AnyOrchestration;
use crate::orchestration::{
    ActivityOutcome, ActivityTask, FanOutPolicy, HistoryEvent, OrchestrationAction,
    OrchestrationContext, OrchestrationError, OrchestrationErrorKind, SequencedEvent,
};

/// Result of one replay pass
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// The orchestration is waiting on activities
    Suspended {
        /// Events to append, starting right after the last recorded sequence
        new_events: Vec<HistoryEvent>,

        /// Activities of the awaited batch that have no outcome yet, both
        /// newly scheduled and previously recorded
        pending: Vec<ActivityTask>,
    },

    /// The orchestration reached a terminal decision
    ///
    /// `new_events` ends with `OrchestrationCompleted` or `OrchestrationFailed`.
    Finished { new_events: Vec<HistoryEvent> },
}

impl Turn {
    pub fn new_events(&self) -> &[HistoryEvent] {
        match self {
            Self::Suspended { new_events, .. } | Self::Finished { new_events } => new_events,
        }
    }

    fn failed(error: OrchestrationError) -> Self {
        Self::Finished {
            new_events: vec![HistoryEvent::OrchestrationFailed { error }],
        }
    }
}

struct RecordedSchedule<'a> {
    sequence: u64,
    name: &'a str,
    input: &'a Value,
}

struct RecordedOutcome {
    /// Log position of the outcome event (decides fail-fast cut-off)
    position: u64,
    outcome: ActivityOutcome,
}

/// Replay `orchestration` over `history` and compute the next turn
///
/// `history` must be the full, ordered history of a non-terminal instance.
pub fn replay(
    orchestration: &mut dyn AnyOrchestration,
    instance_id: Uuid,
    history: &[SequencedEvent],
) -> Turn {
    match Replayer::new(instance_id, history).and_then(|r| r.run(orchestration)) {
        Ok(turn) => turn,
        Err(error) => {
            warn!(%instance_id, %error, "replay failed");
            Turn::failed(error)
        }
    }
}

struct Replayer<'a> {
    instance_id: Uuid,
    schedules: Vec<RecordedSchedule<'a>>,
    outcomes: HashMap<u64, RecordedOutcome>,
    cursor: usize,
    next_sequence: u64,
    new_events: Vec<HistoryEvent>,
}

impl<'a> Replayer<'a> {
    fn new(instance_id: Uuid, history: &'a [SequencedEvent]) -> Result<Self, OrchestrationError> {
        let mut schedules = Vec::new();
        let mut outcomes = HashMap::new();

        for recorded in history {
            match &recorded.event {
                HistoryEvent::ActivityScheduled {
                    name,
                    input,
                    sequence,
                } => {
                    schedules.push(RecordedSchedule {
                        sequence: *sequence,
                        name,
                        input,
                    });
                }
                HistoryEvent::ActivityCompleted { sequence, result } => {
                    record_outcome(
                        &mut outcomes,
                        &schedules,
                        *sequence,
                        recorded.sequence,
                        ActivityOutcome::Completed(result.clone()),
                    )?;
                }
                HistoryEvent::ActivityFailed { sequence, error } => {
                    record_outcome(
                        &mut outcomes,
                        &schedules,
                        *sequence,
                        recorded.sequence,
                        ActivityOutcome::Failed(error.clone()),
                    )?;
                }
                _ => {}
            }
        }

        let last_sequence = history.last().map(|e| e.sequence).unwrap_or(0);

        Ok(Self {
            instance_id,
            schedules,
            outcomes,
            cursor: 0,
            next_sequence: last_sequence + 1,
            new_events: Vec::new(),
        })
    }

    fn replaying(&self) -> bool {
        self.cursor < self.schedules.len()
    }

    fn context(&self) -> OrchestrationContext {
        OrchestrationContext::new(self.instance_id, self.replaying())
    }

    fn run(mut self, orchestration: &mut dyn AnyOrchestration) -> Result<Turn, OrchestrationError> {
        let fan_out = orchestration.fan_out();

        let ctx = self.context();
        let mut actions = guarded(|| orchestration.on_start(&ctx))?;

        loop {
            // A terminal decision ends the turn; schedules returned next to it are ignored
            if let Some(terminal) = actions.iter().find_map(terminal_event) {
                let unmatched = self.schedules.len() - self.cursor;
                if unmatched > 0 {
                    return Err(nondeterminism(format!(
                        "orchestration finished with {unmatched} recorded activities never re-scheduled"
                    )));
                }
                self.new_events.push(terminal);
                return Ok(Turn::Finished {
                    new_events: self.new_events,
                });
            }

            let batch = self.schedule(actions)?;
            if batch.is_empty() {
                return Err(OrchestrationError::with_kind(
                    OrchestrationErrorKind::Stalled,
                    "orchestration returned no actions while not finished",
                ));
            }

            match self.resolve(&batch, fan_out) {
                Some(outcomes) => {
                    let ctx = self.context();
                    actions = guarded(|| orchestration.on_activities_resolved(&ctx, outcomes))?;
                }
                None => {
                    if self.replaying() {
                        return Err(nondeterminism(format!(
                            "recorded activity at sequence {} follows an unresolved batch",
                            self.schedules[self.cursor].sequence
                        )));
                    }

                    let pending = batch
                        .into_iter()
                        .filter(|(sequence, _, _)| !self.outcomes.contains_key(sequence))
                        .map(|(sequence, name, input)| ActivityTask {
                            instance_id: self.instance_id,
                            sequence,
                            name,
                            input,
                        })
                        .collect();

                    return Ok(Turn::Suspended {
                        new_events: self.new_events,
                        pending,
                    });
                }
            }
        }
    }

    /// Match schedule decisions against history, recording the new ones
    fn schedule(
        &mut self,
        actions: Vec<OrchestrationAction>,
    ) -> Result<Vec<(u64, String, Value)>, OrchestrationError> {
        let mut batch = Vec::new();

        for action in actions {
            let OrchestrationAction::ScheduleActivity { name, input } = action else {
                continue;
            };

            if let Some(recorded) = self.schedules.get(self.cursor) {
                if recorded.name != name || *recorded.input != input {
                    return Err(nondeterminism(format!(
                        "sequence {} recorded activity '{}' with input {}, replay scheduled '{}' with input {}",
                        recorded.sequence, recorded.name, recorded.input, name, input
                    )));
                }
                batch.push((recorded.sequence, name, input));
                self.cursor += 1;
            } else {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                debug!(instance_id = %self.instance_id, sequence, activity = %name, "scheduling activity");
                self.new_events.push(HistoryEvent::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                    sequence,
                });
                batch.push((sequence, name, input));
            }
        }

        Ok(batch)
    }

    /// Outcomes for the batch in scheduling order, or `None` if it is still open
    fn resolve(
        &self,
        batch: &[(u64, String, Value)],
        fan_out: FanOutPolicy,
    ) -> Option<Vec<ActivityOutcome>> {
        let recorded: Vec<Option<&RecordedOutcome>> = batch
            .iter()
            .map(|(sequence, _, _)| self.outcomes.get(sequence))
            .collect();

        let first_failure = match fan_out {
            FanOutPolicy::FailFast => recorded
                .iter()
                .flatten()
                .filter(|r| matches!(r.outcome, ActivityOutcome::Failed(_)))
                .map(|r| r.position)
                .min(),
            FanOutPolicy::AllSettled => None,
        };

        // Outcomes recorded after the resolving failure stay abandoned, even
        // once they are present in the log
        let Some(first_failure) = first_failure else {
            if !recorded.iter().all(Option::is_some) {
                return None;
            }
            return Some(
                recorded
                    .into_iter()
                    .flatten()
                    .map(|r| r.outcome.clone())
                    .collect(),
            );
        };

        Some(
            recorded
                .into_iter()
                .map(|r| match r {
                    Some(r) if r.position <= first_failure => r.outcome.clone(),
                    _ => ActivityOutcome::Abandoned,
                })
                .collect(),
        )
    }
}

fn record_outcome(
    outcomes: &mut HashMap<u64, RecordedOutcome>,
    schedules: &[RecordedSchedule<'_>],
    scheduled_at: u64,
    position: u64,
    outcome: ActivityOutcome,
) -> Result<(), OrchestrationError> {
    if !schedules.iter().any(|s| s.sequence == scheduled_at) {
        return Err(nondeterminism(format!(
            "outcome at sequence {position} has no matching schedule at {scheduled_at}"
        )));
    }
    if outcomes.contains_key(&scheduled_at) {
        return Err(nondeterminism(format!(
            "duplicate outcome for activity scheduled at {scheduled_at}"
        )));
    }
    outcomes.insert(scheduled_at, RecordedOutcome { position, outcome });
    Ok(())
}

fn terminal_event(action: &OrchestrationAction) -> Option<HistoryEvent> {
    match action {
        OrchestrationAction::CompleteOrchestration { output } => {
            Some(HistoryEvent::OrchestrationCompleted {
                output: output.clone(),
            })
        }
        OrchestrationAction::FailOrchestration { error } => Some(HistoryEvent::OrchestrationFailed {
            error: error.clone(),
        }),
        OrchestrationAction::ScheduleActivity { .. } => None,
    }
}

fn nondeterminism(message: String) -> OrchestrationError {
    OrchestrationError::with_kind(OrchestrationErrorKind::Nondeterminism, message)
}

/// Run a callback, turning a panic into an application failure
fn guarded<F>(callback: F) -> Result<Vec<OrchestrationAction>, OrchestrationError>
where
    F: FnOnce() -> Vec<OrchestrationAction>,
{
    catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "orchestration panicked".to_string()
        };
        OrchestrationError::new(format!("orchestration panicked: {message}"))
    })
}
