//! Round and turn sequencing.
//!
//! [`RoundScheduler::run`] drives rounds `1..=N` and, within each round, the panel in order.
//! Before each turn it checks the run flags (stop ends the run, pause suspends it until
//! resumed) and drains the interjection queue into that turn's context. Turns run one at a
//! time; a failed turn leaves a system note and a [`RetryTicket`] and the round moves on.
//!
//! Feedback rounds ([`RoundScheduler::run_feedback_round`]) reuse the same turn path without
//! round metadata.
//!
//! # Events Emitted
//!
//! `RunStarted`, then per round `RoundStarted` and per turn `TurnStarted`, the `TurnRelay`
//! stream, `MessageAppended` for each logged message and `TurnFailed` on failure, finally
//! `RunCompleted`.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::focusgroup::event::{DiscussionEvent, EventHandler};
use crate::focusgroup::model::{
    DiscussionMessage, RetryTicket, RoundInfo, Session, SessionStatus, TurnContext,
};
use crate::focusgroup::relay::RelayEvent;
use crate::focusgroup::session_store::SessionHandle;
use crate::focusgroup::turn::{TurnError, TurnExecutor, TurnInput, TurnOutput};

/// How one scheduled turn ended, from the log's point of view.
#[derive(Debug)]
pub enum TurnResolution {
    Appended(TurnOutput),
    Failed(RetryTicket),
    /// Cancelled, or the session ended before the result could be logged.
    Dropped,
}

/// Totals of one run or feedback round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// True when every scheduled turn was attempted.
    pub completed: bool,
    pub rounds_started: u32,
    pub turns_appended: usize,
    pub turns_failed: usize,
}

impl RunReport {
    fn record(&mut self, resolution: &TurnResolution) {
        match resolution {
            TurnResolution::Appended(_) => self.turns_appended += 1,
            TurnResolution::Failed(_) => self.turns_failed += 1,
            TurnResolution::Dropped => {}
        }
    }
}

pub struct RoundScheduler {
    executor: Arc<TurnExecutor>,
    event_handler: Option<Arc<dyn EventHandler>>,
    inter_turn_delay: Duration,
}

impl RoundScheduler {
    pub fn new(executor: Arc<TurnExecutor>) -> Self {
        Self {
            executor,
            event_handler: None,
            inter_turn_delay: Duration::from_millis(500),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_inter_turn_delay(mut self, delay: Duration) -> Self {
        self.inter_turn_delay = delay;
        self
    }

    async fn emit(&self, event: DiscussionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_discussion_event(&event).await;
        }
    }

    async fn append(&self, handle: &SessionHandle, message: DiscussionMessage) {
        handle.push(message.clone());
        self.emit(DiscussionEvent::MessageAppended {
            session_id: handle.id(),
            message,
        })
        .await;
    }

    /// Run every round of the session. The caller must have started the run on the session's
    /// [`RunControl`](crate::focusgroup::run_state::RunControl).
    pub async fn run(&self, handle: &Arc<SessionHandle>) -> RunReport {
        let control = handle.control();
        let session_id = handle.id();
        let (total_rounds, agent_count) = {
            let mut session = handle.lock();
            session.status = SessionStatus::Running;
            (session.rounds, session.agents.len())
        };
        log::info!(
            "focusgroup::scheduler: session {} starting {} round(s) with {} agent(s)",
            session_id,
            total_rounds,
            agent_count
        );
        self.emit(DiscussionEvent::RunStarted {
            session_id,
            total_rounds,
        })
        .await;

        let mut report = RunReport {
            completed: true,
            ..RunReport::default()
        };

        'rounds: for round in 1..=total_rounds {
            if !control.is_running() {
                report.completed = false;
                break;
            }
            control.set_current_round(round);
            handle.lock().current_round = round;
            report.rounds_started = round;

            self.emit(DiscussionEvent::RoundStarted {
                session_id,
                round,
                total_rounds,
            })
            .await;
            self.append(
                handle,
                DiscussionMessage::system(format!("--- Round {} of {} ---", round, total_rounds)),
            )
            .await;

            for agent_index in 0..agent_count {
                if !control.is_running() {
                    report.completed = false;
                    break 'rounds;
                }
                if control.is_paused() {
                    log::debug!("focusgroup::scheduler: session {} paused", session_id);
                    if !control.wait_until_resumed().await {
                        report.completed = false;
                        break 'rounds;
                    }
                }

                let context = TurnContext {
                    round: Some(RoundInfo {
                        round,
                        total_rounds,
                    }),
                    interjection: control.drain_interjections(),
                };
                let resolution = self.run_turn(handle, agent_index, context).await;
                report.record(&resolution);

                let last_turn = round == total_rounds && agent_index + 1 == agent_count;
                if !last_turn && !self.inter_turn_delay.is_zero() {
                    tokio::time::sleep(self.inter_turn_delay).await;
                }
            }
        }

        self.finish(handle, report.completed, "Discussion complete.", "Discussion stopped.")
            .await;
        report
    }

    /// Ask `respondents` (panel indices, in order) to answer moderator feedback.
    ///
    /// Marks the run as running for the duration so it can be stopped like a normal run;
    /// returns `None` if a run is already in progress.
    ///
    /// Interjections queued while the round runs are drained before every turn and added to
    /// the directive. Notes that arrive during the last turn get a follow-up pass over the
    /// same respondents; if the round is stopped they go back to the queue.
    pub async fn run_feedback_round(
        &self,
        handle: &Arc<SessionHandle>,
        respondents: &[usize],
        feedback: &str,
    ) -> Option<RunReport> {
        let control = handle.control();
        if !control.start() {
            return None;
        }
        log::info!(
            "focusgroup::scheduler: session {} feedback round with {} respondent(s)",
            handle.id(),
            respondents.len()
        );

        // The triggering interjection is normally still queued; take it along with any
        // notes that raced in before the round started.
        let mut directive = control
            .drain_interjections()
            .unwrap_or_else(|| feedback.to_string());
        let mut report = RunReport {
            completed: true,
            ..RunReport::default()
        };
        'passes: loop {
            self.append(
                handle,
                DiscussionMessage::system("--- Responding to moderator feedback ---"),
            )
            .await;
            for (position, &agent_index) in respondents.iter().enumerate() {
                if !control.is_running() {
                    report.completed = false;
                    break 'passes;
                }
                if let Some(extra) = control.drain_interjections() {
                    directive = format!("{}\n\n{}", directive, extra);
                }
                let context = TurnContext {
                    round: None,
                    interjection: Some(directive.clone()),
                };
                let resolution = self.run_turn(handle, agent_index, context).await;
                report.record(&resolution);
                if position + 1 < respondents.len() && !self.inter_turn_delay.is_zero() {
                    tokio::time::sleep(self.inter_turn_delay).await;
                }
            }
            match control.drain_interjections() {
                Some(late) if control.is_running() => {
                    log::info!(
                        "focusgroup::scheduler: session {} follow-up pass for late feedback",
                        handle.id()
                    );
                    directive = late;
                }
                Some(late) => {
                    control.requeue_interjection(late);
                    report.completed = false;
                    break;
                }
                None => break,
            }
        }

        control.finish();
        Some(report)
    }

    /// Execute one turn and log its outcome.
    ///
    /// Used by rounds, feedback rounds and operator retries alike, so a retry re-enters with
    /// exactly the context it was given.
    pub async fn run_turn(
        &self,
        handle: &Arc<SessionHandle>,
        agent_index: usize,
        context: TurnContext,
    ) -> TurnResolution {
        let session_id = handle.id();
        let input = {
            let session = handle.lock();
            TurnInput::from_session(&session, agent_index, context.clone(), self.executor.prompts())
        };
        let Some(input) = input else {
            log::warn!(
                "focusgroup::scheduler: session {} has no agent at index {}",
                session_id,
                agent_index
            );
            return TurnResolution::Dropped;
        };
        let input = input.with_session(handle);
        let agent_name = input.agent.name.clone();

        self.emit(DiscussionEvent::TurnStarted {
            session_id,
            agent_index,
            agent_name: agent_name.clone(),
            round: context.round.map(|r| r.round),
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();
        let executor = &self.executor;
        let control = handle.control();
        let execute = async move {
            let result = executor.execute(input, &tx, control).await;
            drop(tx);
            result
        };
        let forward = async {
            while let Some(relay) = rx.recv().await {
                self.emit(DiscussionEvent::TurnRelay {
                    session_id,
                    agent_index,
                    agent_name: agent_name.clone(),
                    relay,
                })
                .await;
            }
        };
        let (result, ()) = tokio::join!(execute, forward);

        match result {
            Ok(output) => {
                handle.commit_turn(output.turn_id, output.messages());
                if !handle.is_committed(&output.turn_id) {
                    log::info!(
                        "focusgroup::scheduler: session {} ended, dropping turn of {}",
                        session_id,
                        agent_name
                    );
                    return TurnResolution::Dropped;
                }
                for message in output.messages() {
                    self.emit(DiscussionEvent::MessageAppended {
                        session_id,
                        message,
                    })
                    .await;
                }
                TurnResolution::Appended(output)
            }
            Err(TurnError::Cancelled) => TurnResolution::Dropped,
            Err(err) => {
                if handle.has_ended() {
                    return TurnResolution::Dropped;
                }
                let ticket = RetryTicket {
                    id: Uuid::new_v4(),
                    agent_index,
                    agent_name: agent_name.clone(),
                    context,
                    error: err.to_string(),
                };
                handle.lock().pending_retries.push(ticket.clone());
                self.append(
                    handle,
                    DiscussionMessage::system(format!(
                        "Error getting response from {}: {}",
                        agent_name, err
                    )),
                )
                .await;
                self.emit(DiscussionEvent::TurnFailed {
                    session_id,
                    agent_index,
                    agent_name,
                    error: err.to_string(),
                    ticket_id: ticket.id,
                })
                .await;
                TurnResolution::Failed(ticket)
            }
        }
    }

    async fn finish(
        &self,
        handle: &SessionHandle,
        completed: bool,
        completed_note: &str,
        stopped_note: &str,
    ) {
        let session_id = handle.id();
        if completed {
            handle.control().finish();
        }
        if !handle.has_ended() {
            let note = if completed { completed_note } else { stopped_note };
            self.append(handle, DiscussionMessage::system(note)).await;
        }
        handle.lock().status = if completed {
            SessionStatus::Completed
        } else {
            SessionStatus::Stopped
        };
        log::info!(
            "focusgroup::scheduler: session {} {}",
            session_id,
            if completed { "completed" } else { "stopped" }
        );
        self.emit(DiscussionEvent::RunCompleted {
            session_id,
            completed,
        })
        .await;
    }
}

/// Pick who answers moderator feedback: agents among the last `panel size` agent turns first
/// (in panel order), then the rest shuffled, at most `max` in total.
pub fn pick_feedback_respondents<R: Rng + ?Sized>(
    session: &Session,
    max: usize,
    rng: &mut R,
) -> Vec<usize> {
    let panel = session.agents.len();
    let agent_turns: Vec<&str> = session
        .agent_messages()
        .map(|m| m.agent_name.as_str())
        .collect();
    let recent: HashSet<&str> = agent_turns
        .iter()
        .skip(agent_turns.len().saturating_sub(panel))
        .copied()
        .collect();

    let (mut chosen, mut others): (Vec<usize>, Vec<usize>) =
        (0..panel).partition(|&i| recent.contains(session.agents[i].name.as_str()));
    others.shuffle(rng);
    chosen.extend(others);
    chosen.truncate(max.min(panel));
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focusgroup::model::Agent;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn recent_speakers_answer_feedback_first() {
        let agents: Vec<Agent> = ["A", "B", "C", "D"]
            .iter()
            .map(|n| Agent::new(*n, "R"))
            .collect();
        let mut session = Session::new("t", agents.clone());
        for name in ["A", "B", "C", "D", "C", "D"] {
            let agent = agents.iter().find(|a| a.name == name).unwrap();
            session.push(DiscussionMessage::agent(agent, "x", vec![]));
        }
        // Trailing window of four turns is C, D, C, D.
        let picked = pick_feedback_respondents(&session, 5, &mut StdRng::seed_from_u64(7));
        assert_eq!(picked.len(), 4);
        assert_eq!(&picked[..2], &[2, 3]);

        let capped = pick_feedback_respondents(&session, 1, &mut StdRng::seed_from_u64(7));
        assert_eq!(capped, vec![2]);
    }
}
