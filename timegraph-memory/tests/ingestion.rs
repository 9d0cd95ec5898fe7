//! Episode ingestion: attestation, deduplication and failure handling

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    day, entities, episode, fact, facts, fast_config, graph_on, graph_with, memory_graph,
    BagOfWordsEmbedder, BrokenExtractor, CommitFault, FlakyExtractor, PatternExtractor,
    ScriptedStore, StallingExtractor,
};
use timegraph_memory::{
    GraphConfig, GraphError, NewEpisode, ProviderPolicy, SearchRequest, TemporalGraph,
};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_same_fact_from_two_episodes_is_one_edge() {
    let graph = memory_graph();
    let first = graph
        .add_episode(episode("g", "Bob works at Acme.", day(1)))
        .await
        .unwrap();
    let second = graph
        .add_episode(episode("g", "Bob works at Acme.", day(2)))
        .await
        .unwrap();

    let all = facts(&graph, "g").await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].episodes, vec![first.episode.uuid, second.episode.uuid]);
    assert_eq!(all[0].valid_at(), day(1));
    assert!(all[0].invalid_at().is_none());
    assert_eq!(second.edges[0].uuid, all[0].uuid);

    // attested facts are reported per episode
    let attested = graph.episode_edges(second.episode.uuid).await.unwrap();
    assert_eq!(attested.len(), 1);
}

#[tokio::test]
async fn test_reingesting_an_episode_creates_no_duplicate_entities() {
    let graph = memory_graph();
    let body = "Alice moved to Boston. Alice knows Bob. Bob works at Acme.";
    graph.add_episode(episode("g", body, day(1))).await.unwrap();
    let before = entities(&graph, "g").await;
    assert_eq!(before.len(), 4);

    graph.add_episode(episode("g", body, day(1))).await.unwrap();
    let after = entities(&graph, "g").await;
    let mut uuids_before: Vec<_> = before.iter().map(|n| n.uuid).collect();
    let mut uuids_after: Vec<_> = after.iter().map(|n| n.uuid).collect();
    uuids_before.sort();
    uuids_after.sort();
    assert_eq!(uuids_before, uuids_after);
    assert_eq!(facts(&graph, "g").await.len(), 3);
}

#[tokio::test]
async fn test_mention_case_and_spacing_resolve_to_one_entity() {
    let graph = memory_graph();
    graph
        .add_episode(episode("g", "Bob works at Acme.", day(1)))
        .await
        .unwrap();
    graph
        .add_episode(episode("g", "bob  knows Carol.", day(2)))
        .await
        .unwrap();

    let names: Vec<String> = entities(&graph, "g").await.into_iter().map(|n| n.name).collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&"Bob".to_string()));
}

#[tokio::test]
async fn test_groups_do_not_share_entities() {
    let graph = memory_graph();
    graph
        .add_episode(episode("a", "Bob works at Acme.", day(1)))
        .await
        .unwrap();
    graph
        .add_episode(episode("b", "Bob works at Acme.", day(1)))
        .await
        .unwrap();

    let a = entities(&graph, "a").await;
    let b = entities(&graph, "b").await;
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|n| b.iter().all(|m| m.uuid != n.uuid)));
}

#[tokio::test]
async fn test_terminal_failure_leaves_no_trace() {
    let graph = graph_with(Arc::new(BrokenExtractor));
    let ep = episode("g", "Bob works at Acme.", day(1));
    let uuid = ep.uuid;

    let err = graph.add_episode(ep).await.unwrap_err();
    match &err {
        GraphError::Ingestion {
            episode_uuid,
            source,
        } => {
            assert_eq!(*episode_uuid, uuid);
            assert!(matches!(**source, GraphError::Provider(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());

    assert!(graph.get_episode(uuid).await.is_err());
    assert!(graph.staged_episodes().await.unwrap().is_empty());
    assert!(graph
        .retrieve_episodes(&["g".to_string()], 10, None)
        .await
        .unwrap()
        .is_empty());
    assert!(entities(&graph, "g").await.is_empty());
}

#[tokio::test]
async fn test_single_conflict_is_replanned_under_lock() {
    let store = Arc::new(ScriptedStore::failing([CommitFault::Conflict]));
    let extractor = Arc::new(PatternExtractor::default());
    let graph = graph_on(store.clone(), extractor.clone());

    assert_ok!(
        graph
            .add_episode(episode("g", "Bob works at Acme.", day(1)))
            .await
    );
    assert_eq!(store.commit_attempts(), 2);
    assert_eq!(extractor.extract_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facts(&graph, "g").await.len(), 1);
}

#[tokio::test]
async fn test_repeated_conflict_surfaces_as_conflict() {
    let store = Arc::new(ScriptedStore::failing([
        CommitFault::Conflict,
        CommitFault::Conflict,
    ]));
    let extractor = Arc::new(PatternExtractor::default());
    let graph = graph_on(store.clone(), extractor.clone());

    let err = assert_err!(
        graph
            .add_episode(episode("g", "Bob works at Acme.", day(1)))
            .await
    );
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert_eq!(store.commit_attempts(), 2);
    assert_eq!(extractor.extract_calls.load(Ordering::SeqCst), 1);
    assert!(facts(&graph, "g").await.is_empty());
    assert!(graph.staged_episodes().await.unwrap().is_empty());

    // faults are spent, so the caller's retry goes through
    assert_ok!(
        graph
            .add_episode(episode("g", "Bob works at Acme.", day(1)))
            .await
    );
    assert_eq!(facts(&graph, "g").await.len(), 1);
}

#[tokio::test]
async fn test_store_failure_is_not_retried() {
    let store = Arc::new(ScriptedStore::failing([CommitFault::Backend]));
    let extractor = Arc::new(PatternExtractor::default());
    let graph = graph_on(store.clone(), extractor.clone());

    let err = assert_err!(
        graph
            .add_episode(episode("g", "Bob works at Acme.", day(1)))
            .await
    );
    match &err {
        GraphError::Ingestion { source, .. } => {
            assert!(matches!(**source, GraphError::Store(_)))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(store.commit_attempts(), 1);
    assert_eq!(extractor.extract_calls.load(Ordering::SeqCst), 1);
    assert!(entities(&graph, "g").await.is_empty());
    assert!(graph.staged_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let extractor = Arc::new(FlakyExtractor::new(2));
    let graph = graph_with(extractor.clone());

    let result = graph
        .add_episode(episode("g", "Bob works at Acme.", day(1)))
        .await
        .unwrap();
    assert_eq!(result.edges.len(), 1);
    assert_eq!(extractor.extract_calls(), 1);
    assert!(graph.staged_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retries_exhausted_surface_as_ingestion_error() {
    let graph = graph_with(Arc::new(FlakyExtractor::new(10)));
    let err = graph
        .add_episode(episode("g", "Bob works at Acme.", day(1)))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(graph.staged_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stalled_group_does_not_block_other_groups() {
    let config = GraphConfig {
        provider: ProviderPolicy {
            timeout_ms: 300,
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        ..GraphConfig::default()
    };
    let graph = TemporalGraph::in_memory(
        Arc::new(BagOfWordsEmbedder::default()),
        Arc::new(StallingExtractor::new("slow")),
        config,
    )
    .unwrap();

    let started = Instant::now();
    let (slow, fast) = tokio::join!(
        graph.add_episode(episode("slow", "Bob works at Acme.", day(1))),
        async {
            let result = graph
                .add_episode(episode("fast", "Bob works at Acme.", day(1)))
                .await;
            (result, started.elapsed())
        }
    );

    let (fast, fast_elapsed) = fast;
    assert!(fast.is_ok());
    assert!(fast_elapsed < Duration::from_millis(300));
    assert!(slow.is_err());
    assert!(graph.staged_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_ingestion_discards_staged_episode() {
    let graph = TemporalGraph::in_memory(
        Arc::new(BagOfWordsEmbedder::default()),
        Arc::new(StallingExtractor::new("slow")),
        fast_config(),
    )
    .unwrap();

    let ep = episode("slow", "Bob works at Acme.", day(1));
    let uuid = ep.uuid;
    let outcome = tokio::time::timeout(Duration::from_millis(50), graph.add_episode(ep)).await;
    assert!(outcome.is_err());

    assert!(graph.staged_episodes().await.unwrap().is_empty());
    assert!(graph.get_episode(uuid).await.is_err());
}

#[tokio::test]
async fn test_bulk_ingestion_orders_each_group_by_reference_time() {
    let graph = memory_graph();
    let inputs: Vec<NewEpisode> = vec![
        episode("a", "Alice moved to Seattle.", day(2)),
        episode("b", "Bob works at Initech.", day(9)),
        episode("a", "Alice moved to Boston.", day(1)),
        episode("b", "Bob works at Acme.", day(3)),
    ];
    let expected: Vec<_> = inputs.iter().map(|e| e.uuid).collect();

    let results = graph.add_episodes(inputs).await;
    let uuids: Vec<_> = results
        .iter()
        .map(|r| r.as_ref().unwrap().episode.uuid)
        .collect();
    assert_eq!(uuids, expected);

    // Boston was ingested first, so sequence and reference order agree
    let boston = fact(&graph, "a", "Alice moved to Boston.").await;
    let seattle = fact(&graph, "a", "Alice moved to Seattle.").await;
    assert!(boston.sequence < seattle.sequence);
    assert_eq!(boston.invalid_at(), Some(day(2)));
    assert!(seattle.invalid_at().is_none());

    let acme = fact(&graph, "b", "Bob works at Acme.").await;
    assert_eq!(acme.invalid_at(), Some(day(9)));
}

#[tokio::test]
async fn test_concurrent_episodes_in_one_group_share_new_entities() {
    let graph = memory_graph();
    let (a, b) = tokio::join!(
        graph.add_episode(episode("g", "Zed works at Acme.", day(1))),
        graph.add_episode(episode("g", "Zed knows Carol.", day(1)))
    );
    a.unwrap();
    b.unwrap();

    let zeds: Vec<_> = entities(&graph, "g")
        .await
        .into_iter()
        .filter(|n| n.name == "Zed")
        .collect();
    assert_eq!(zeds.len(), 1);
    assert_eq!(facts(&graph, "g").await.len(), 2);
}

#[tokio::test]
async fn test_episode_is_searchable_only_after_commit() {
    let graph = memory_graph();
    let result = graph
        .add_episode(episode("g", "Dana works at Globex.", day(1)))
        .await
        .unwrap();
    assert_eq!(result.episodic_edges.len(), 2);

    let found = graph
        .search(&SearchRequest::new("Globex").group("g"))
        .await
        .unwrap();
    assert_eq!(found.facts(), vec!["Dana works at Globex."]);
    assert!(found.nodes.iter().any(|n| n.item.name == "Globex"));
}

#[tokio::test]
async fn test_extraction_sees_previous_episodes() {
    let extractor = Arc::new(PatternExtractor::default());
    let graph = graph_with(extractor.clone());
    for i in 0..5 {
        graph
            .add_episode(episode("g", "Bob works at Acme.", day(i)))
            .await
            .unwrap();
    }
    assert_eq!(
        extractor
            .extract_calls
            .load(Ordering::SeqCst),
        5
    );
    let recent = graph
        .retrieve_episodes(&["g".to_string()], 3, None)
        .await
        .unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[2].reference_time, day(4));
}
