mod common;

use common::{ScriptedClient, Step};
use focusgroup::agent_store::{AgentStore, InMemoryAgentStore, KnowledgeUpdate, NewAgent};
use focusgroup::knowledge::{KnowledgeError, KnowledgeMerger, LearnRequest};
use focusgroup::model::{Agent, DiscussionMessage, SearchResult, Session, Source};
use std::sync::Arc;

async fn stored_agent(store: &InMemoryAgentStore, name: &str) -> Agent {
    store
        .create(NewAgent {
            name: name.to_string(),
            role: "Epidemiologist".to_string(),
            ..NewAgent::default()
        })
        .await
        .unwrap()
        .to_agent()
}

#[tokio::test]
async fn learn_replaces_insights_and_records_the_topic() {
    let store = Arc::new(InMemoryAgentStore::new());
    let agent = stored_agent(&store, "Vera").await;
    let id = agent.id.clone().unwrap();
    store
        .update_knowledge(
            &id,
            KnowledgeUpdate {
                new_insights: Some("Knows vaccine logistics.".to_string()),
                ..KnowledgeUpdate::default()
            },
        )
        .await
        .unwrap();

    let client = Arc::new(
        ScriptedClient::new("unused")
            .with_steps(vec![Step::Reply("Logistics and school policy.".to_string())]),
    );
    let merger = KnowledgeMerger::new(client.clone(), store.clone());
    let record = merger
        .learn(
            &id,
            LearnRequest {
                topic: "School closures".to_string(),
                session_id: "s-1".to_string(),
                contributions: "Closures cost more than they save.".to_string(),
                sources: vec![Source {
                    url: "https://example.org/study".to_string(),
                    title: "Closure study".to_string(),
                }],
            },
        )
        .await
        .unwrap();

    assert_eq!(record.accumulated_insights, "Logistics and school policy.");
    assert_eq!(record.knowledge_base.session_count, 1);
    assert_eq!(record.knowledge_base.topics_discussed[0].topic, "School closures");
    assert_eq!(record.knowledge_sources.len(), 1);

    let prompt = &client.user_prompts()[0];
    assert!(prompt.contains("Knows vaccine logistics."));
    assert!(prompt.contains("Closures cost more than they save."));
    assert!(prompt.contains("Closure study (https://example.org/study)"));
}

#[tokio::test]
async fn empty_merge_keeps_existing_insights() {
    let store = Arc::new(InMemoryAgentStore::new());
    let agent = stored_agent(&store, "Wes").await;
    let id = agent.id.clone().unwrap();
    store
        .update_knowledge(
            &id,
            KnowledgeUpdate {
                new_insights: Some("Original.".to_string()),
                ..KnowledgeUpdate::default()
            },
        )
        .await
        .unwrap();

    let client = Arc::new(ScriptedClient::new("unused").with_steps(vec![Step::Empty]));
    let merger = KnowledgeMerger::new(client, store.clone());
    let record = merger
        .learn(
            &id,
            LearnRequest {
                topic: "t".to_string(),
                session_id: "s".to_string(),
                contributions: "something".to_string(),
                sources: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.accumulated_insights, "Original.");
    assert_eq!(record.knowledge_base.session_count, 1);
}

#[tokio::test]
async fn unknown_agent_and_failed_generation_are_reported() {
    let store = Arc::new(InMemoryAgentStore::new());
    let agent = stored_agent(&store, "Xan").await;
    let client =
        Arc::new(ScriptedClient::new("unused").with_steps(vec![Step::Refuse("500".to_string())]));
    let merger = KnowledgeMerger::new(client, store);
    let request = LearnRequest {
        topic: "t".to_string(),
        session_id: "s".to_string(),
        contributions: "c".to_string(),
        sources: Vec::new(),
    };

    assert!(matches!(
        merger.learn("ghost", request.clone()).await,
        Err(KnowledgeError::AgentNotFound(_))
    ));
    assert!(matches!(
        merger.learn(agent.id.as_deref().unwrap(), request).await,
        Err(KnowledgeError::Generation(_))
    ));
}

#[tokio::test]
async fn session_learning_covers_only_persistent_speakers() {
    let store = Arc::new(InMemoryAgentStore::new());
    let speaker = stored_agent(&store, "Yara").await;
    let silent = stored_agent(&store, "Zed").await;
    let guest = Agent::new("Guest", "Visitor");

    let mut session = Session::new("Four-day week", vec![speaker.clone(), silent, guest.clone()]);
    session.push(DiscussionMessage::agent(
        &speaker,
        "Trials show [steady output](https://trial.example/results).",
        vec![],
    ));
    session.push(DiscussionMessage::search(
        &speaker.name,
        "four-day week trials",
        vec![SearchResult {
            title: "Trial results".to_string(),
            url: "https://trial.example/results".to_string(),
            description: String::new(),
        }],
    ));
    session.push(DiscussionMessage::agent(&guest, "I like long weekends.", vec![]));

    let client = Arc::new(ScriptedClient::new("Knows the trial data."));
    let merger = KnowledgeMerger::new(client.clone(), store.clone());
    let reports = merger.learn_from_session(&session).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].agent_name, "Yara");
    let record = reports[0].result.as_ref().unwrap();
    assert_eq!(record.knowledge_sources.len(), 1);
    assert_eq!(record.knowledge_sources[0].session_topic, "Four-day week");
    assert_eq!(client.calls().len(), 1);
}

#[test]
fn learn_request_caps_contributions() {
    let agent = Agent::new("Ana", "Nurse");
    let mut session = Session::new("t", vec![agent.clone()]);
    session.push(DiscussionMessage::agent(&agent, "a".repeat(1_500), vec![]));
    session.push(DiscussionMessage::agent(&agent, "b".repeat(1_500), vec![]));

    let request = LearnRequest::from_session(&session, &agent, 2_000);
    assert_eq!(request.contributions.chars().count(), 2_000);
    assert!(request.contributions.contains("\n---\n"));
}
