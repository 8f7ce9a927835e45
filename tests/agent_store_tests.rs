use focusgroup::agent_store::{
    AgentStore, AgentUpdate, JsonFileAgentStore, KnowledgeUpdate, NewAgent, StoreError,
};
use focusgroup::model::{Agent, Source};

fn new_agent(name: &str) -> NewAgent {
    NewAgent {
        name: name.to_string(),
        role: "Analyst".to_string(),
        background: Some("Retail".to_string()),
        ..NewAgent::default()
    }
}

#[tokio::test]
async fn roster_survives_a_new_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    let created = {
        let store = JsonFileAgentStore::in_dir(dir.path());
        store.create(new_agent("Nia")).await.unwrap()
    };
    assert!(dir.path().join("agents.json").exists());
    assert!(!dir.path().join("agents.json.tmp").exists());

    let reopened = JsonFileAgentStore::in_dir(dir.path());
    let loaded = reopened.get(&created.id).await.unwrap().unwrap();
    assert_eq!(loaded, created);
    assert_eq!(reopened.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_file_is_an_empty_roster_and_nested_dirs_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileAgentStore::in_dir(dir.path().join("nested").join("data"));
    assert!(store.list().await.unwrap().is_empty());

    store.create(new_agent("Oli")).await.unwrap();
    assert!(store.path().exists());
}

#[tokio::test]
async fn corrupt_file_starts_empty_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("agents.json"), "{ not json").unwrap();
    let store = JsonFileAgentStore::in_dir(dir.path());

    assert!(store.list().await.unwrap().is_empty());
    store.create(new_agent("Pia")).await.unwrap();
    let raw = std::fs::read_to_string(store.path()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.as_array().map(Vec::len), Some(1));
    assert_eq!(parsed[0]["name"], "Pia");
}

#[tokio::test]
async fn update_and_delete_report_unknown_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileAgentStore::in_dir(dir.path());
    let record = store.create(new_agent("Rae")).await.unwrap();

    let updated = store
        .update(
            &record.id,
            AgentUpdate {
                perspective: Some("cautious".to_string()),
                ..AgentUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.perspective, "cautious");
    assert_eq!(updated.background, "Retail");

    assert!(matches!(
        store.update("nope", AgentUpdate::default()).await,
        Err(StoreError::NotFound(_))
    ));
    store.delete(&record.id).await.unwrap();
    assert!(matches!(
        store.delete(&record.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(JsonFileAgentStore::in_dir(dir.path())
        .list()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn knowledge_sources_are_capped_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileAgentStore::in_dir(dir.path()).with_source_cap(50);
    let record = store.create(new_agent("Sol")).await.unwrap();

    for batch in 0..3 {
        let sources = (0..20)
            .map(|i| Source {
                url: format!("https://example.com/{}/{}", batch, i),
                title: format!("Source {}", i),
            })
            .collect();
        store
            .update_knowledge(
                &record.id,
                KnowledgeUpdate {
                    topic: format!("topic {}", batch),
                    session_id: format!("session-{}", batch),
                    new_insights: Some(format!("insights after {}", batch)),
                    sources,
                },
            )
            .await
            .unwrap();
    }

    let stored = JsonFileAgentStore::in_dir(dir.path())
        .get(&record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.knowledge_sources.len(), 50);
    assert_eq!(stored.knowledge_sources[0].url, "https://example.com/0/10");
    assert_eq!(stored.knowledge_base.session_count, 3);
    assert_eq!(stored.accumulated_insights, "insights after 2");
}

#[tokio::test]
async fn save_from_session_skips_agents_that_already_have_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileAgentStore::in_dir(dir.path());
    let agents = vec![
        Agent::new("Tao", "Engineer").with_id("existing"),
        Agent::new("Uma", "Designer"),
    ];

    let created = store.save_from_session(&agents).await.unwrap();
    assert!(created[0].is_none());
    assert_eq!(created[1].as_ref().map(|r| r.name.as_str()), Some("Uma"));
    assert_eq!(store.list().await.unwrap().len(), 1);
}
