mod common;

use async_trait::async_trait;
use common::{panel, wait_for, RecordingHandler, ScriptedClient, Step};
use focusgroup::event::{DiscussionEvent, EventHandler};
use focusgroup::model::{DiscussionMessage, Session, SessionStatus};
use focusgroup::relay::RelayEvent;
use focusgroup::scheduler::{RoundScheduler, TurnResolution};
use focusgroup::session_store::SessionHandle;
use focusgroup::turn::TurnExecutor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn scheduler(client: Arc<ScriptedClient>) -> RoundScheduler {
    RoundScheduler::new(Arc::new(TurnExecutor::new(client)))
        .with_inter_turn_delay(Duration::ZERO)
}

fn started(session: Session) -> Arc<SessionHandle> {
    let handle = Arc::new(SessionHandle::new(session));
    assert!(handle.control().start());
    handle
}

fn log_lines(handle: &SessionHandle) -> Vec<String> {
    handle
        .snapshot()
        .messages
        .iter()
        .map(|m| match m {
            DiscussionMessage::System(n) => n.content.clone(),
            DiscussionMessage::User(n) => format!("moderator: {}", n.content),
            DiscussionMessage::Search(n) => format!("search: {}", n.query),
            DiscussionMessage::Agent(m) => format!("{}: {}", m.agent_name, m.content),
        })
        .collect()
}

#[tokio::test]
async fn every_agent_speaks_once_per_round_in_panel_order() {
    let client = Arc::new(ScriptedClient::new("ok"));
    let handler = Arc::new(RecordingHandler::default());
    let handle = started(Session::new("topic", panel(&["Ada", "Bo", "Cy"])).with_rounds(2));

    let report = scheduler(client.clone())
        .with_event_handler(handler.clone())
        .run(&handle)
        .await;

    assert!(report.completed);
    assert_eq!(report.rounds_started, 2);
    assert_eq!(report.turns_appended, 6);
    assert_eq!(report.turns_failed, 0);
    assert_eq!(
        log_lines(&handle),
        vec![
            "--- Round 1 of 2 ---",
            "Ada: ok",
            "Bo: ok",
            "Cy: ok",
            "--- Round 2 of 2 ---",
            "Ada: ok",
            "Bo: ok",
            "Cy: ok",
            "Discussion complete.",
        ]
    );
    assert_eq!(handle.snapshot().status, SessionStatus::Completed);
    assert!(!handle.control().is_running());

    let events = handler.events();
    let done = events
        .iter()
        .filter(|e| matches!(e, DiscussionEvent::TurnRelay { relay: RelayEvent::Done { .. }, .. }))
        .count();
    assert_eq!(done, 6);
    assert!(matches!(events.first(), Some(DiscussionEvent::RunStarted { total_rounds: 2, .. })));
    assert!(matches!(
        events.last(),
        Some(DiscussionEvent::RunCompleted { completed: true, .. })
    ));
}

#[tokio::test]
async fn opening_round_turns_do_not_see_each_other() {
    let client = Arc::new(ScriptedClient::new("later").with_steps(vec![
        Step::Reply("ADA-OPENING".to_string()),
        Step::Reply("BO-OPENING".to_string()),
    ]));
    let handle = started(Session::new("topic", panel(&["Ada", "Bo"])).with_rounds(2));

    scheduler(client.clone()).run(&handle).await;

    let prompts = client.user_prompts();
    assert_eq!(prompts.len(), 4);
    assert!(!prompts[1].contains("ADA-OPENING"));
    assert!(prompts[2].contains("ADA-OPENING"));
    assert!(prompts[2].contains("BO-OPENING"));
}

#[tokio::test]
async fn failed_turn_leaves_a_retry_ticket_and_the_run_continues() {
    let client = Arc::new(ScriptedClient::new("fine").with_steps(vec![
        Step::Reply("first".to_string()),
        Step::Refuse("upstream 503".to_string()),
    ]));
    let handler = Arc::new(RecordingHandler::default());
    let handle = started(Session::new("topic", panel(&["Ada", "Bo", "Cy"])).with_rounds(1));

    let report = scheduler(client)
        .with_event_handler(handler.clone())
        .run(&handle)
        .await;

    assert!(report.completed);
    assert_eq!(report.turns_appended, 2);
    assert_eq!(report.turns_failed, 1);

    let session = handle.snapshot();
    assert_eq!(session.pending_retries.len(), 1);
    let ticket = &session.pending_retries[0];
    assert_eq!(ticket.agent_name, "Bo");
    assert_eq!(ticket.agent_index, 1);
    assert_eq!(ticket.context.round.map(|r| r.round), Some(1));

    let lines = log_lines(&handle);
    assert!(lines
        .iter()
        .any(|l| l.starts_with("Error getting response from Bo:") && l.contains("upstream 503")));
    assert!(lines.contains(&"Cy: fine".to_string()));
    assert!(handler.events().iter().any(|e| matches!(
        e,
        DiscussionEvent::TurnFailed { ticket_id, .. } if *ticket_id == ticket.id
    )));
}

/// Pauses the run right after the first agent message is logged.
#[derive(Default)]
struct PauseAfterFirstTurn {
    handle: Mutex<Option<Arc<SessionHandle>>>,
    fired: Mutex<bool>,
}

#[async_trait]
impl EventHandler for PauseAfterFirstTurn {
    async fn on_discussion_event(&self, event: &DiscussionEvent) {
        if let DiscussionEvent::MessageAppended { message, .. } = event {
            let mut fired = self.fired.lock().unwrap();
            if message.is_agent() && !*fired {
                *fired = true;
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    assert!(handle.control().pause());
                }
            }
        }
    }
}

#[tokio::test]
async fn pause_holds_the_next_turn_and_interjection_is_delivered_once() {
    let client = Arc::new(ScriptedClient::new("noted"));
    let handle = started(Session::new("topic", panel(&["Ada", "Bo", "Cy"])).with_rounds(2));
    let pauser = Arc::new(PauseAfterFirstTurn::default());
    *pauser.handle.lock().unwrap() = Some(handle.clone());

    let scheduler = Arc::new(scheduler(client.clone()).with_event_handler(pauser));
    let run = {
        let scheduler = scheduler.clone();
        let handle = handle.clone();
        tokio::spawn(async move { scheduler.run(&handle).await })
    };

    wait_for(|| handle.control().is_paused()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(client.calls().len(), 1);

    assert!(handle.control().queue_interjection("what about cost?"));
    let report = run.await.unwrap();
    assert!(report.completed);
    assert_eq!(report.turns_appended, 6);

    let directive = "The moderator has just interjected: \"what about cost?\"";
    let prompts = client.user_prompts();
    let delivered: Vec<usize> = prompts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.contains(directive))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(delivered, vec![1]);
    assert_eq!(handle.control().pending_interjections(), 0);
}

#[tokio::test]
async fn stop_cancels_the_in_flight_turn_without_a_retry() {
    let client = Arc::new(ScriptedClient::new("ok").with_steps(vec![Step::Hang]));
    let handle = started(Session::new("topic", panel(&["Ada", "Bo"])).with_rounds(3));

    let run = {
        let scheduler = scheduler(client.clone());
        let handle = handle.clone();
        tokio::spawn(async move { scheduler.run(&handle).await })
    };
    wait_for(|| client.calls().len() == 1).await;
    handle.control().abort();

    let report = run.await.unwrap();
    assert!(!report.completed);
    assert_eq!(report.turns_appended, 0);
    assert_eq!(report.turns_failed, 0);

    let session = handle.snapshot();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(session.pending_retries.is_empty());
    assert_eq!(
        log_lines(&handle),
        vec!["--- Round 1 of 3 ---", "Discussion stopped."]
    );
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test]
async fn feedback_round_answers_in_the_given_order() {
    let client = Arc::new(ScriptedClient::new("heard you"));
    let agents = panel(&["Ada", "Bo", "Cy"]);
    let mut session = Session::new("topic", agents.clone());
    session.push(DiscussionMessage::agent(&agents[0], "earlier point", vec![]));
    let handle = Arc::new(SessionHandle::new(session));

    let report = scheduler(client.clone())
        .run_feedback_round(&handle, &[2, 0], "Be concrete.")
        .await
        .unwrap();

    assert!(report.completed);
    assert_eq!(report.turns_appended, 2);
    let lines = log_lines(&handle);
    assert_eq!(
        lines[1..],
        [
            "--- Responding to moderator feedback ---".to_string(),
            "Cy: heard you".to_string(),
            "Ada: heard you".to_string(),
        ]
    );
    assert!(client
        .user_prompts()
        .iter()
        .all(|p| p.contains("The moderator has just interjected: \"Be concrete.\"")));
    assert!(!handle.control().is_running());
}

fn feedback_scheduler(client: Arc<ScriptedClient>) -> Arc<RoundScheduler> {
    let executor =
        TurnExecutor::new(client).with_stream_timeout(Duration::from_millis(200));
    Arc::new(RoundScheduler::new(Arc::new(executor)).with_inter_turn_delay(Duration::ZERO))
}

#[tokio::test]
async fn notes_queued_during_a_feedback_round_reach_the_next_respondent() {
    let client = Arc::new(ScriptedClient::new("noted").with_steps(vec![Step::Hang]));
    let scheduler = feedback_scheduler(client.clone());
    let handle = Arc::new(SessionHandle::new(Session::new("topic", panel(&["Ada", "Bo"]))));
    handle.control().queue_interjection("FIRST-NOTE");

    let round = {
        let scheduler = scheduler.clone();
        let handle = handle.clone();
        tokio::spawn(async move { scheduler.run_feedback_round(&handle, &[0, 1], "FIRST-NOTE").await })
    };
    wait_for(|| client.calls().len() == 1).await;
    handle.control().queue_interjection("SECOND-NOTE");

    let report = round.await.unwrap().unwrap();
    assert!(report.completed);
    assert_eq!(report.turns_failed, 1);
    assert_eq!(report.turns_appended, 1);

    let prompts = client.user_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("FIRST-NOTE"));
    assert!(!prompts[0].contains("SECOND-NOTE"));
    assert!(prompts[1].contains("FIRST-NOTE"));
    assert!(prompts[1].contains("SECOND-NOTE"));
    assert_eq!(handle.control().pending_interjections(), 0);
}

#[tokio::test]
async fn a_note_arriving_during_the_last_feedback_turn_gets_a_follow_up_pass() {
    let client = Arc::new(ScriptedClient::new("noted").with_steps(vec![Step::Hang]));
    let scheduler = feedback_scheduler(client.clone());
    let handle = Arc::new(SessionHandle::new(Session::new("topic", panel(&["Ada", "Bo"]))));
    handle.control().queue_interjection("FIRST-NOTE");

    let round = {
        let scheduler = scheduler.clone();
        let handle = handle.clone();
        tokio::spawn(async move { scheduler.run_feedback_round(&handle, &[1], "FIRST-NOTE").await })
    };
    wait_for(|| client.calls().len() == 1).await;
    handle.control().queue_interjection("LATE-NOTE");

    let report = round.await.unwrap().unwrap();
    assert!(report.completed);
    assert_eq!(report.turns_appended, 1);

    let prompts = client.user_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("LATE-NOTE"));
    let markers = log_lines(&handle)
        .iter()
        .filter(|l| *l == "--- Responding to moderator feedback ---")
        .count();
    assert_eq!(markers, 2);
    assert!(log_lines(&handle).contains(&"Bo: noted".to_string()));
    assert!(!handle.control().is_running());
}

#[tokio::test]
async fn a_stopped_feedback_round_keeps_undelivered_notes_queued() {
    let client = Arc::new(ScriptedClient::new("noted").with_steps(vec![Step::Hang]));
    let scheduler = feedback_scheduler(client.clone());
    let handle = Arc::new(SessionHandle::new(Session::new("topic", panel(&["Ada"]))));
    handle.control().queue_interjection("FIRST-NOTE");

    let round = {
        let scheduler = scheduler.clone();
        let handle = handle.clone();
        tokio::spawn(async move { scheduler.run_feedback_round(&handle, &[0], "FIRST-NOTE").await })
    };
    wait_for(|| client.calls().len() == 1).await;
    handle.control().queue_interjection("LATE-NOTE");
    handle.control().abort();

    let report = round.await.unwrap().unwrap();
    assert!(!report.completed);
    assert_eq!(client.calls().len(), 1);
    assert_eq!(
        handle.control().drain_interjections().as_deref(),
        Some("LATE-NOTE")
    );
}

#[tokio::test]
async fn feedback_round_refuses_while_a_run_is_active() {
    let client = Arc::new(ScriptedClient::new("ok"));
    let handle = started(Session::new("topic", panel(&["Ada", "Bo"])));

    let report = scheduler(client.clone())
        .run_feedback_round(&handle, &[0], "hello")
        .await;
    assert!(report.is_none());
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn retry_reuses_the_original_context() {
    let client = Arc::new(ScriptedClient::new("second try").with_steps(vec![
        Step::Refuse("boom".to_string()),
    ]));
    let handle = started(Session::new("topic", panel(&["Ada", "Bo"])).with_rounds(1));
    let scheduler = scheduler(client.clone());
    scheduler.run(&handle).await;

    let ticket = handle.snapshot().pending_retries[0].clone();
    let retried = handle.lock().take_retry(&ticket.id).unwrap();
    let resolution = scheduler
        .run_turn(&handle, retried.agent_index, retried.context)
        .await;

    match resolution {
        TurnResolution::Appended(output) => assert_eq!(output.content, "second try"),
        other => panic!("expected the retry to append, got {:?}", other),
    }
    assert!(handle.snapshot().pending_retries.is_empty());
    assert_eq!(log_lines(&handle).last().unwrap(), "Ada: second try");
}
