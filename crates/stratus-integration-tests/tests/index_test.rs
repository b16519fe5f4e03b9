// Integration tests for the index manager
// Writers commit to one index object without the commit lock, relying on
// conditional writes alone

use std::sync::Arc;

use stratus_coordination::{Coordinator, IndexMutation, IndexRecord, StratusError};
use stratus_integration_tests::{fast_config, shared_store};
use stratus_store::MemoryStore;

fn optimistic_participant(store: &Arc<MemoryStore>, retry_budget: u32) -> Coordinator {
    let mut config = fast_config();
    config.index.lock_writes = false;
    config.index.retry_budget = retry_budget;
    Coordinator::new(store.clone(), config).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_commits_are_merged() {
    let store = shared_store(1);

    let tasks: Vec<_> = (0..6)
        .map(|writer| {
            let index = optimistic_participant(&store, 200).index_manager("catalog/__index__");
            tokio::spawn(async move {
                let mut attempts = 0;
                for key in 0..5 {
                    let name = format!("w{}-k{}", writer, key);
                    let mutation =
                        IndexMutation::new().upsert(IndexRecord::new(name.clone(), format!("blob/{}", name)));
                    attempts += index.commit(&mutation).await.unwrap().attempts;
                }
                attempts
            })
        })
        .collect();

    let mut total_attempts = 0;
    for task in tasks {
        total_attempts += task.await.unwrap();
    }

    let reader = optimistic_participant(&store, 1).index_manager("catalog/__index__");
    let (document, version) = reader.fetch().await.unwrap();
    assert_eq!(document.len(), 30);
    assert!(version.is_some());
    assert!(total_attempts >= 30);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_surfaces_conflict() {
    let store = shared_store(0);
    let index = optimistic_participant(&store, 4).index_manager("catalog/__index__");
    store.inject_condition_failures(4);

    let result = index
        .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
        .await;
    assert!(matches!(
        result,
        Err(StratusError::IndexConflict { attempts: 4, .. })
    ));

    // The next commit starts a fresh budget.
    index
        .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
        .await
        .unwrap();
    assert!(index.lookup("a").await.unwrap().is_some());
}
