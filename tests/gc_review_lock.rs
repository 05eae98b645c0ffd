//! §8 S5 — the GC review-lock protocol's defining scenario: holding the
//! review row's `SELECT ... FOR UPDATE` across a mutator's deadline forces
//! that mutator to surface `Unavailable` instead of blocking indefinitely;
//! once the holder releases, the same mutation goes through on retry.
//!
//! Unlike `tests/api_integration.rs` (filesystem-only, no database), this
//! drives the actual lock contention through `sqlx::PgPool`, so it needs a
//! real Postgres. `#[sqlx::test]` provisions and migrates a fresh, isolated
//! database per test from `DATABASE_URL`/`TEST_DATABASE_URL`, the same
//! mechanism `migrations/` is written for. The deadlines below are scaled
//! down from the spec's illustrative 10s-hold/5s-deadline shape so the test
//! runs in well under a second while exercising the identical mechanism:
//! a blocking row lock plus a `tokio::time::timeout`-bounded wait.

use std::time::Duration;

use chrono::Utc;
use oci_registry_core::error::{AppError, OciError};
use oci_registry_core::gc::GcCoordinator;
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_repo_with_tagged_manifest(pool: &PgPool) -> (Uuid, Uuid) {
    let repository_id = Uuid::new_v4();
    sqlx::query("INSERT INTO repositories (id, path) VALUES ($1, $2)")
        .bind(repository_id)
        .bind("s5/repo")
        .execute(pool)
        .await
        .unwrap();

    let manifest_id = Uuid::new_v4();
    let digest = format!("sha256:{}", "0".repeat(64));
    sqlx::query(
        "INSERT INTO manifests (id, repository_id, schema_version, media_type, digest, payload) \
         VALUES ($1, $2, 2, $3, $4, $5)",
    )
    .bind(manifest_id)
    .bind(repository_id)
    .bind("application/vnd.oci.image.manifest.v1+json")
    .bind(&digest)
    .bind(b"{}".to_vec())
    .execute(pool)
    .await
    .unwrap();

    sqlx::query("INSERT INTO tags (repository_id, name, manifest_id) VALUES ($1, $2, $3)")
        .bind(repository_id)
        .bind("latest")
        .bind(manifest_id)
        .execute(pool)
        .await
        .unwrap();

    (repository_id, manifest_id)
}

#[sqlx::test(migrations = "./migrations")]
async fn long_held_review_lock_times_out_then_retry_succeeds(pool: PgPool) {
    let (repository_id, manifest_id) = seed_repo_with_tagged_manifest(&pool).await;

    let scheduler = GcCoordinator::new(pool.clone());
    scheduler
        .schedule_review(repository_id, manifest_id, Utc::now())
        .await
        .unwrap();

    let holder = GcCoordinator::new(pool.clone());
    let hold_for = Duration::from_millis(900);
    let holding = tokio::spawn(async move {
        holder
            .with_review_lock(repository_id, manifest_id, Duration::from_secs(5), |_tx| async move {
                tokio::time::sleep(hold_for).await;
                Ok::<(), AppError>(())
            })
            .await
            .unwrap();
    });

    // Let the holder actually acquire the row lock before the contending
    // delete starts waiting on it.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mutator = GcCoordinator::new(pool.clone());
    let short_deadline = Duration::from_millis(300);
    let err = mutator
        .delete_tag_under_lock(repository_id, manifest_id, "latest", short_deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Oci(OciError::Unavailable(_))));

    holding.await.unwrap();

    // The holder has committed and released the lock; the identical
    // mutation now goes through well within a generous deadline.
    mutator
        .delete_tag_under_lock(repository_id, manifest_id, "latest", Duration::from_secs(5))
        .await
        .unwrap();

    let remaining: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM tags WHERE repository_id = $1 AND manifest_id = $2",
    )
    .bind(repository_id)
    .bind(manifest_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining, 0);
}

/// The manifest-delete mutator's tombstone write (not just its tag delete)
/// must land inside the same locked transaction, so a concurrent GC pass
/// that grabs the row the instant the lock is released never observes a
/// state where tags are gone but the manifest is neither tombstoned nor
/// already collectible without first running `process_one_due_task` itself.
#[sqlx::test(migrations = "./migrations")]
async fn manifest_delete_under_lock_tombstones_in_the_same_transaction(pool: PgPool) {
    let (repository_id, manifest_id) = seed_repo_with_tagged_manifest(&pool).await;

    let coordinator = GcCoordinator::new(pool.clone());
    coordinator
        .delete_manifest_link_under_lock(repository_id, manifest_id, Duration::from_secs(5))
        .await
        .unwrap();

    let deleted_at: Option<chrono::DateTime<Utc>> =
        sqlx::query_scalar("SELECT deleted_at FROM manifests WHERE id = $1")
            .bind(manifest_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(deleted_at.is_some());

    let remaining_tags: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM tags WHERE repository_id = $1 AND manifest_id = $2",
    )
    .bind(repository_id)
    .bind(manifest_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining_tags, 0);
}
