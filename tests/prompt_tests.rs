use chrono::{TimeZone, Utc};
use focusgroup::history::{self, OMITTED_MARKER};
use focusgroup::model::{Agent, DiscussionMessage, FocusGroupMode, RoundInfo};
use focusgroup::prompt::{PromptBuilder, PromptContext, RoundPhase, RoundPhasePolicy, TurnPrompt};

fn info(round: u32, total_rounds: u32) -> RoundInfo {
    RoundInfo {
        round,
        total_rounds,
    }
}

#[test]
fn phases_follow_the_policy() {
    let policy = RoundPhasePolicy::default();
    assert_eq!(policy.phase(info(1, 3)), RoundPhase::Opening);
    assert_eq!(policy.phase(info(2, 3)), RoundPhase::Engagement);
    assert_eq!(policy.phase(info(3, 3)), RoundPhase::Synthesis);
    // Two-round runs never reach synthesis.
    assert_eq!(policy.phase(info(2, 2)), RoundPhase::Engagement);

    let wide = RoundPhasePolicy {
        opening_rounds: 2,
        synthesis_min_total_rounds: 4,
    };
    assert_eq!(wide.phase(info(2, 4)), RoundPhase::Opening);
    assert_eq!(wide.phase(info(4, 4)), RoundPhase::Synthesis);
    assert!(!wide.hides_peer_turns(None));
}

#[test]
fn system_instructions_carry_persona_mode_and_memory() {
    let agent = Agent::new("Ines", "Nurse")
        .with_background("ICU, 12 years")
        .with_perspective("staffing first")
        .with_accumulated_insights("Knows shift-length research.");
    let peer = Agent::new("Jon", "Administrator").with_perspective("budget");
    let panel = vec![agent.clone(), peer];

    let text = PromptBuilder::default().system_instructions(&PromptContext {
        agent: &agent,
        topic: "Twelve-hour shifts",
        panel: &panel,
        mode: FocusGroupMode::Debate,
        goal: Some("Recommend a rota"),
        search_enabled: true,
        round: Some(info(3, 3)),
        brief: Some("Bring the 2019 fatigue study."),
        accumulated_insights: agent.accumulated_insights.as_deref(),
        timezone: "UTC+2",
        now: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
    });

    assert!(text.starts_with("You are Ines, a Nurse."));
    assert!(text.contains("<user_topic>Twelve-hour shifts</user_topic>"));
    assert!(text.contains("<user_goal>Recommend a rota</user_goal>"));
    assert!(text.contains("Mode: Debate"));
    assert!(text.contains("SYNTHESIS & CONCLUSIONS"));
    assert!(text.contains("- Jon (Administrator): budget"));
    assert!(!text.contains("- Ines (Nurse)"));
    assert!(text.contains("Knows shift-length research."));
    assert!(text.contains("Bring the 2019 fatigue study."));
    assert!(text.contains("[source title](url)"));
}

#[test]
fn cjk_topics_pin_the_reply_language() {
    let agent = Agent::new("Lin", "Educator");
    let panel = vec![agent.clone()];
    let text = PromptBuilder::default().system_instructions(&PromptContext {
        agent: &agent,
        topic: "遠距教學的未來",
        panel: &panel,
        mode: FocusGroupMode::SharePerspectives,
        goal: None,
        search_enabled: false,
        round: None,
        brief: None,
        accumulated_insights: None,
        timezone: "UTC",
        now: Utc::now(),
    });
    assert!(text.contains("LANGUAGE:"));
}

#[test]
fn turn_content_switches_on_history_and_interjection() {
    let builder = PromptBuilder::default();
    let ada = Agent::new("Ada", "Engineer");
    let history = vec![DiscussionMessage::agent(&ada, "Rail beats roads.", vec![])];

    let first = builder.turn_content(&TurnPrompt {
        topic: "transit",
        history: &[],
        history_budget: 1_000,
        round: Some(info(2, 3)),
        interjection: None,
        panel_size: 2,
    });
    assert!(first.contains("You are the first to speak."));

    let engaged = builder.turn_content(&TurnPrompt {
        topic: "transit",
        history: &history,
        history_budget: 1_000,
        round: Some(info(2, 3)),
        interjection: Some("Costs?"),
        panel_size: 2,
    });
    assert!(engaged.contains("[Ada - Engineer]: Rail beats roads."));
    assert!(engaged.contains("The moderator has just interjected: \"Costs?\""));
}

#[test]
fn long_histories_are_compressed_with_a_marker() {
    let ada = Agent::new("Ada", "Engineer");
    let messages: Vec<DiscussionMessage> = (0..30)
        .map(|i| DiscussionMessage::agent(&ada, format!("{} {}", i, "x".repeat(400)), vec![]))
        .collect();

    let text = history::compress(&messages, 1_200);
    assert!(text.starts_with(OMITTED_MARKER));
    assert!(text.contains("[Ada - Engineer]: 29 "));
    assert!(!text.contains("[Ada - Engineer]: 0 "));

    let untouched = history::compress(&messages[..3], 12_000);
    assert!(!untouched.contains(OMITTED_MARKER));
    assert!(untouched.starts_with("[Ada - Engineer]: 0 "));
}
