use chrono::{TimeZone, Utc};
use profile_sync_core::clock::{Clock, ManualClock};
use profile_sync_core::db;
use profile_sync_core::lease::{
    LeaseAcquireResult, LeaseProvider, LeaseReleaseResult, LeaseRepository,
    MemoryLeaseRepository, SqliteLeaseRepository, StorageLeaseProvider,
};
use std::sync::Arc;
use std::time::Duration;

async fn backends() -> Vec<(&'static str, Arc<dyn LeaseRepository>)> {
    let pool = db::open_sqlite_in_memory().await.unwrap();
    vec![
        ("memory", Arc::new(MemoryLeaseRepository::new())),
        (
            "sqlite",
            Arc::new(SqliteLeaseRepository::new(pool).await.unwrap()),
        ),
    ]
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn acquire_contend_expire_seize() {
    for (name, repo) in backends().await {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let a = StorageLeaseProvider::with_clock(repo.clone(), clock.clone());
        let b = StorageLeaseProvider::with_clock(repo.clone(), clock.clone());
        let d = Duration::from_secs(30);

        let first = a.try_acquire("sync-favorites", d, None).await.unwrap();
        let ticket_a = first.ticket().cloned().unwrap();
        assert_eq!(ticket_a.expires, t0 + secs(30), "{name}");

        clock.set(t0 + secs(10));
        match b.try_acquire("sync-favorites", d, None).await.unwrap() {
            LeaseAcquireResult::Failed {
                expires,
                last_acquired,
                ..
            } => {
                assert_eq!(expires, t0 + secs(30), "{name}");
                assert_eq!(last_acquired, t0, "{name}");
            }
            other => panic!("{name}: contender should fail, got {other:?}"),
        }

        clock.set(t0 + secs(31));
        let seized = b.try_acquire("sync-favorites", d, None).await.unwrap();
        let ticket_b = seized.ticket().cloned().unwrap();
        assert_ne!(ticket_a.token, ticket_b.token, "{name}");
        assert_eq!(ticket_b.expires, t0 + secs(61), "{name}");

        let row = repo.get("sync-favorites").await.unwrap().unwrap();
        assert_eq!(row.token, ticket_b.token, "{name}");
        assert_eq!(row.acquired, t0 + secs(31), "{name}");

        // The displaced holder can neither renew nor release.
        assert!(!a.try_renew(&ticket_a, d).await.unwrap().is_acquired(), "{name}");
        assert_eq!(
            a.release(&ticket_a).await.unwrap(),
            LeaseReleaseResult::NotHeld,
            "{name}"
        );
    }
}

#[tokio::test]
async fn release_frees_the_lease_immediately() {
    for (name, repo) in backends().await {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let provider = StorageLeaseProvider::with_clock(repo.clone(), clock.clone());
        let d = Duration::from_secs(60);

        let ticket = provider
            .try_acquire("sync-portal", d, None)
            .await
            .unwrap()
            .ticket()
            .cloned()
            .unwrap();
        clock.advance(secs(5));
        assert!(matches!(
            provider.release(&ticket).await.unwrap(),
            LeaseReleaseResult::Released { .. }
        ), "{name}");

        let row = repo.get("sync-portal").await.unwrap().unwrap();
        assert!(row.expires <= clock.now(), "{name}");
        assert_eq!(row.released, Some(t0 + secs(5)), "{name}");

        // Another instance takes over without waiting out the original duration.
        let next = provider.try_acquire("sync-portal", d, None).await.unwrap();
        assert!(next.is_acquired(), "{name}");
    }
}

#[tokio::test]
async fn renewals_only_move_expiry_forward() {
    for (name, repo) in backends().await {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let provider = StorageLeaseProvider::with_clock(repo.clone(), clock.clone());

        let ticket = provider
            .try_acquire("sync-krr", Duration::from_secs(60), None)
            .await
            .unwrap()
            .ticket()
            .cloned()
            .unwrap();

        clock.advance(secs(10));
        let renewed = provider
            .try_renew(&ticket, Duration::from_secs(5))
            .await
            .unwrap();
        let renewed = renewed.ticket().cloned().unwrap();
        assert_eq!(renewed.expires, t0 + secs(60), "{name}");
        assert_eq!(renewed.token, ticket.token, "{name}");

        let row = repo.get("sync-krr").await.unwrap().unwrap();
        assert_eq!(row.acquired, t0, "{name}");
    }
}

#[tokio::test]
async fn sqlite_leases_survive_reopening_the_file() {
    let dir = std::env::temp_dir().join(format!("profile-sync-{}", uuid::Uuid::new_v4()));
    let path = dir.join("leases.db");
    let provider_token = {
        let pool = db::open_sqlite(&path).await.unwrap();
        let repo = Arc::new(SqliteLeaseRepository::new(pool.clone()).await.unwrap());
        let provider = StorageLeaseProvider::new(repo);
        let ticket = provider
            .try_acquire("sync-addresses", Duration::from_secs(300), None)
            .await
            .unwrap()
            .ticket()
            .cloned()
            .unwrap();
        pool.close().await;
        ticket.token
    };

    let pool = db::open_sqlite(&path).await.unwrap();
    let repo = SqliteLeaseRepository::new(pool.clone()).await.unwrap();
    let row = repo.get("sync-addresses").await.unwrap().unwrap();
    assert_eq!(row.token, provider_token);
    pool.close().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sqlite_acquires_elect_one_holder() {
    let dir = std::env::temp_dir().join(format!("profile-sync-{}", uuid::Uuid::new_v4()));
    let pool = db::open_sqlite(dir.join("leases.db")).await.unwrap();
    let repo: Arc<dyn LeaseRepository> =
        Arc::new(SqliteLeaseRepository::new(pool.clone()).await.unwrap());

    for round in 0..10 {
        let lease_id = format!("sync-round-{round}");
        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let contenders: Vec<_> = (0..4)
            .map(|_| {
                let provider = StorageLeaseProvider::new(repo.clone());
                let barrier = barrier.clone();
                let lease_id = lease_id.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    provider
                        .try_acquire(&lease_id, Duration::from_secs(300), None)
                        .await
                })
            })
            .collect();

        let mut acquired = 0;
        for handle in contenders {
            match handle.await.unwrap() {
                Ok(LeaseAcquireResult::Acquired { .. }) => acquired += 1,
                Ok(LeaseAcquireResult::Failed { .. }) => {}
                Err(e) => panic!("round {round}: contender errored instead of losing: {e}"),
            }
        }
        assert_eq!(acquired, 1, "round {round}");
    }

    pool.close().await;
    let _ = std::fs::remove_dir_all(dir);
}
