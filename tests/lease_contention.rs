//! Several nodes, each with its own connection pool on one database file,
//! race to acquire the same lease at the same instant.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio::sync::Barrier;

use clustercron::scheduler::{LeaseLock, SqliteLeaseLock, DEFAULT_LEASE_WINDOW_SECS};
use clustercron::storage::open_pool;

const NODES: usize = 6;
const ROUNDS: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_acquire_has_exactly_one_winner() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("cluster.db");
    let db = db.to_string_lossy();

    let locks: Vec<Arc<SqliteLeaseLock>> = (0..NODES)
        .map(|_| open_pool(&db).map(|pool| Arc::new(SqliteLeaseLock::new(pool))))
        .collect::<Result<_, _>>()?;
    let lease = Duration::seconds(DEFAULT_LEASE_WINDOW_SECS);

    for round in 0..ROUNDS {
        let task = format!("backup-{round}");
        let now = Utc::now();
        let barrier = Arc::new(Barrier::new(NODES));

        let attempts = locks.iter().enumerate().map(|(i, lock)| {
            let (lock, barrier, task) = (lock.clone(), barrier.clone(), task.clone());
            tokio::spawn(async move {
                let node = format!("node-{i}");
                barrier.wait().await;
                let won = lock.acquire(&task, &node, now, lease).await?;
                Ok::<_, clustercron::SchedulerError>((node, won))
            })
        });

        let mut winners = Vec::new();
        for joined in join_all(attempts).await {
            let (node, won) = joined??;
            if won {
                winners.push(node);
            }
        }
        assert_eq!(winners.len(), 1, "round {round}: winners {winners:?}");

        let record = locks[0].get(&task).await?.expect("lease row exists");
        assert_eq!(record.holder.as_ref(), Some(&winners[0]), "round {round}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_lease_is_taken_by_exactly_one_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("cluster.db");
    let db = db.to_string_lossy();

    let locks: Vec<Arc<SqliteLeaseLock>> = (0..NODES)
        .map(|_| open_pool(&db).map(|pool| Arc::new(SqliteLeaseLock::new(pool))))
        .collect::<Result<_, _>>()?;
    let lease = Duration::seconds(DEFAULT_LEASE_WINDOW_SECS);

    // A crashed node left a lease that has since aged out.
    let stale = Utc::now() - lease - Duration::seconds(1);
    assert!(locks[0].acquire("report", "crashed", stale, lease).await?);

    let now = Utc::now();
    let barrier = Arc::new(Barrier::new(NODES));
    let attempts = locks.iter().enumerate().map(|(i, lock)| {
        let (lock, barrier) = (lock.clone(), barrier.clone());
        tokio::spawn(async move {
            barrier.wait().await;
            lock.acquire("report", &format!("node-{i}"), now, lease).await
        })
    });

    let mut won = 0;
    for joined in join_all(attempts).await {
        if joined?? {
            won += 1;
        }
    }
    assert_eq!(won, 1);

    let holder = locks[0].get("report").await?.and_then(|r| r.holder);
    assert!(holder.is_some_and(|h| h.starts_with("node-")));
    Ok(())
}
