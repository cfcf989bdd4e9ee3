//! Concurrency tests for the job queue.
//!
//! Each worker gets its own database handle to the same file, the way
//! separate processes would.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use patchforge::scheduler::{
    event_kinds, JobCompletion, JobQueue, JobState, NewJob, Priority,
};
use patchforge::storage::Database;
use tempfile::TempDir;

const NO_STALE: Duration = Duration::from_secs(3600);

async fn open_queues(count: usize) -> (Vec<JobQueue>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queue.db");
    let mut queues = Vec::with_capacity(count);
    for _ in 0..count {
        let db = Database::open_with_connections(&path, 2)
            .await
            .expect("open database");
        queues.push(JobQueue::new(db));
    }
    (queues, dir)
}

fn job(key: &str, resource: &str) -> NewJob {
    NewJob::new(key, serde_json::json!({ "workdir": "/tmp" })).with_resource_key(resource)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let (queues, _dir) = open_queues(8).await;
    let id = queues[0].enqueue(job("ISSUE-1", "repoA")).await.unwrap();

    let claims = queues.iter().enumerate().map(|(i, queue)| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.claim(&format!("w{}", i), 1, NO_STALE).await })
    });
    let results: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .map(|r| r.expect("task").expect("claim"))
        .collect();

    let winners: Vec<_> = results.iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, id);

    let stored = queues[0].get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Claimed);
    assert_eq!(stored.lock_owner.as_deref(), Some(winners[0].worker_id.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_respect_resource_limit() {
    let (queues, _dir) = open_queues(6).await;
    for i in 0..3 {
        queues[0]
            .enqueue(job(&format!("A-{}", i), "repoA"))
            .await
            .unwrap();
        queues[0]
            .enqueue(job(&format!("B-{}", i), "repoB"))
            .await
            .unwrap();
    }

    let claims = queues.iter().enumerate().map(|(i, queue)| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.claim(&format!("w{}", i), 1, NO_STALE).await })
    });
    let claimed: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .filter_map(|r| r.expect("task").expect("claim"))
        .collect();

    // One job per resource key, no matter how many workers race.
    assert_eq!(claimed.len(), 2);
    let resources: HashSet<_> = claimed.iter().map(|c| c.resource_key.as_str()).collect();
    assert_eq!(resources, HashSet::from(["repoA", "repoB"]));

    let stats = queues[0].stats().await.unwrap();
    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.queued, 4);
    assert_eq!(stats.claimed_by_resource.get("repoA"), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_claimed_exactly_once() {
    let (queues, _dir) = open_queues(4).await;
    let mut ids = HashSet::new();
    for i in 0..20 {
        let id = queues[0]
            .enqueue(job(&format!("J-{}", i), &format!("repo{}", i)))
            .await
            .unwrap();
        ids.insert(id);
    }

    let workers = queues.iter().enumerate().map(|(i, queue)| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let worker = format!("w{}", i);
            let mut mine = Vec::new();
            while let Some(claimed) = queue.claim(&worker, 1, NO_STALE).await.expect("claim") {
                queue
                    .complete(claimed.id, &JobCompletion::done(0, "no-op"))
                    .await
                    .expect("complete");
                mine.push(claimed.id);
            }
            mine
        })
    });

    let mut seen = Vec::new();
    for handle in join_all(workers).await {
        seen.extend(handle.expect("task"));
    }

    assert_eq!(seen.len(), ids.len());
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), ids);

    let stats = queues[0].stats().await.unwrap();
    assert_eq!(stats.done, 20);
    assert_eq!(stats.queued + stats.claimed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_lock_reclaimed_by_other_worker() {
    let (queues, _dir) = open_queues(2).await;
    let stale_timeout = Duration::from_millis(200);
    let id = queues[0].enqueue(job("CRASHY", "repoA")).await.unwrap();

    let first = queues[0].claim("w0", 1, stale_timeout).await.unwrap().unwrap();
    assert_eq!(first.id, id);
    queues[0].touch(id, "w0", 1, Some("boom"), Some("primary")).await.unwrap();

    // w0 "crashes": no more touches.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = queues[1].claim("w1", 1, stale_timeout).await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 1, "persisted attempts survive reclamation");

    // The original owner has lost the lock.
    assert!(!queues[0].touch(id, "w0", 2, None, None).await.unwrap());
    assert!(queues[1].touch(id, "w1", 2, None, None).await.unwrap());

    let reclaimed = queues[1]
        .events_of_kind(id, event_kinds::LOCK_RECLAIMED)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn test_priority_beats_age_across_resources() {
    let (queues, _dir) = open_queues(1).await;
    let queue = &queues[0];

    let old_low = queue
        .enqueue(job("old-low", "r1").with_priority(Priority::Low))
        .await
        .unwrap();
    let normal = queue.enqueue(job("normal", "r2")).await.unwrap();
    let critical = queue
        .enqueue(job("critical", "r3").with_priority(Priority::Critical))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(claimed) = queue.claim("w", 3, NO_STALE).await.unwrap() {
        order.push(claimed.id);
    }
    assert_eq!(order, vec![critical, normal, old_low]);
}

#[tokio::test]
async fn test_completed_job_is_never_claimed_again() {
    let (queues, _dir) = open_queues(1).await;
    let queue = &queues[0];
    let id = queue.enqueue(job("once", "repoA")).await.unwrap();

    let claimed = queue.claim("w", 1, Duration::from_millis(1)).await.unwrap().unwrap();
    queue
        .complete(claimed.id, &JobCompletion::failed(3, "still broken"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.claim("w", 1, Duration::from_millis(1)).await.unwrap().is_none());

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("still broken"));

    let terminal = queue.events_of_kind(id, event_kinds::TERMINAL).await.unwrap();
    assert_eq!(terminal.len(), 1);
}
