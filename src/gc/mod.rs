//! Online garbage-collection coordination (§4.8) — "the crown jewel" per
//! §9's design notes. A background collector and the API's own tag/
//! manifest-delete handlers share one lock point: the `gc_manifest_tasks`
//! review row. Both sides acquire it with `SELECT ... FOR UPDATE` inside a
//! transaction, so whichever side gets there first forces the other to
//! block until it commits or rolls back — never both editing the
//! reference graph unsynchronized.
//!
//! This lives outside `crate::metadata::MetadataStore` deliberately: row
//! locks with a hard wait are a genuine relational-database capability,
//! not something the old filesystem layout can offer, so this module
//! speaks directly to a `sqlx::PgPool`.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, OciError};

/// API-side review-lock acquisition deadline (§4.8, §5). Exceeding it means
/// GC is holding a pathologically long transaction; the caller aborts and
/// surfaces 503 so the client retries.
pub const REVIEW_LOCK_DEADLINE: Duration = Duration::from_secs(5);

/// Grace period before a freshly-dereferenced manifest becomes eligible
/// for collection, giving a racing concurrent request (e.g. a second tag
/// pointing at the same manifest written moments later) a window to land
/// before GC samples dangling status.
pub const REVIEW_GRACE: Duration = Duration::from_secs(30);

pub struct GcCoordinator {
    pool: PgPool,
}

impl GcCoordinator {
    pub fn new(pool: PgPool) -> Self {
        GcCoordinator { pool }
    }

    /// Inserts or bumps the review row for `(repository_id, manifest_id)`,
    /// deferring processing until `review_after` (§3 GCManifestTask,
    /// §4.8 "GC inserts/updates a row ... whenever a reference ... is
    /// removed").
    pub async fn schedule_review(
        &self,
        repository_id: Uuid,
        manifest_id: Uuid,
        review_after: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO gc_manifest_tasks (repository_id, manifest_id, review_after) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (repository_id, manifest_id) \
             DO UPDATE SET review_after = EXCLUDED.review_after",
        )
        .bind(repository_id)
        .bind(manifest_id)
        .bind(review_after)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Runs `mutate` inside the same transaction as a `SELECT ... FOR
    /// UPDATE` of the review row for `(repository_id, manifest_id)`, per
    /// §4.8's serialization contract for API mutators. If no review row
    /// exists yet there is nothing to contend on, and `mutate` runs
    /// immediately. The whole attempt — lock wait plus `mutate` plus
    /// commit — is bounded by `deadline`; exceeding it rolls back (by
    /// dropping the transaction) and yields `OciError::Unavailable`.
    pub async fn with_review_lock<F, Fut, T>(
        &self,
        repository_id: Uuid,
        manifest_id: Uuid,
        deadline: Duration,
        mutate: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce(&mut Transaction<'_, Postgres>) -> Fut + Send,
        Fut: Future<Output = Result<T, AppError>> + Send,
        T: Send,
    {
        let attempt = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "SELECT 1 FROM gc_manifest_tasks WHERE repository_id = $1 AND manifest_id = $2 \
                 FOR UPDATE",
            )
            .bind(repository_id)
            .bind(manifest_id)
            .fetch_optional(&mut *tx)
            .await?;

            let result = mutate(&mut tx).await?;
            tx.commit().await?;
            Ok::<T, AppError>(result)
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Oci(OciError::Unavailable(
                "timed out waiting for the garbage collection review lock".into(),
            ))),
        }
    }

    /// Deletes a single tag row, serialized against any in-flight GC
    /// transaction for the same manifest via [`Self::with_review_lock`]
    /// (§4.8: tag delete is one of the mutators that must acquire the
    /// review lock before changing the reference graph).
    pub async fn delete_tag_under_lock(
        &self,
        repository_id: Uuid,
        manifest_id: Uuid,
        tag_name: &str,
        deadline: Duration,
    ) -> Result<(), AppError> {
        self.with_review_lock(repository_id, manifest_id, deadline, |tx| async move {
            sqlx::query("DELETE FROM tags WHERE repository_id = $1 AND name = $2")
                .bind(repository_id)
                .bind(tag_name)
                .execute(&mut **tx)
                .await?;
            Ok(())
        })
        .await
    }

    /// Deletes every tag in `repository_id` pointing at `manifest_id` and
    /// tombstones the manifest row itself, serialized the same way (§4.8:
    /// manifest delete is also a mutator that must acquire the review lock).
    /// Both writes happen inside the locked transaction — per spec.md:134,
    /// a reference-graph-changing mutator must commit its whole mutation in
    /// the same transaction as the `SELECT ... FOR UPDATE`, not split it
    /// across this call and a later unlocked one. The row itself is still
    /// left for GC to reclaim.
    pub async fn delete_manifest_link_under_lock(
        &self,
        repository_id: Uuid,
        manifest_id: Uuid,
        deadline: Duration,
    ) -> Result<(), AppError> {
        self.with_review_lock(repository_id, manifest_id, deadline, |tx| async move {
            sqlx::query("DELETE FROM tags WHERE repository_id = $1 AND manifest_id = $2")
                .bind(repository_id)
                .bind(manifest_id)
                .execute(&mut **tx)
                .await?;
            sqlx::query(
                "UPDATE manifests SET deleted_at = now() \
                 WHERE repository_id = $1 AND id = $2 AND deleted_at IS NULL",
            )
            .bind(repository_id)
            .bind(manifest_id)
            .execute(&mut **tx)
            .await?;
            Ok(())
        })
        .await
    }

    /// One iteration of the conceptual background collector (§4.8, §9):
    /// locks the oldest due review row (skipping rows already locked by a
    /// concurrent mutator or another GC worker), re-verifies it is still
    /// dangling — no tag and no manifest-list item references it — deletes
    /// the manifest row if so, and always clears the review row. Returns
    /// whether a due row was found at all.
    ///
    /// The standalone binary that would call this on a schedule is out of
    /// scope (§1 Non-goals); this method is the protocol's GC-side half,
    /// exercised directly by tests.
    pub async fn process_one_due_task(&self) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT repository_id, manifest_id FROM gc_manifest_tasks \
             WHERE review_after <= now() ORDER BY review_after \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(false);
        };
        let repository_id: Uuid = row.get("repository_id");
        let manifest_id: Uuid = row.get("manifest_id");

        let has_tag = sqlx::query("SELECT 1 FROM tags WHERE repository_id = $1 AND manifest_id = $2")
            .bind(repository_id)
            .bind(manifest_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        let manifest_digest: Option<String> = sqlx::query("SELECT digest FROM manifests WHERE id = $1")
            .bind(manifest_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get("digest"));

        let has_list_reference = match &manifest_digest {
            Some(digest) => sqlx::query("SELECT 1 FROM manifest_list_items WHERE child_digest = $1")
                .bind(digest)
                .fetch_optional(&mut *tx)
                .await?
                .is_some(),
            None => false,
        };

        if !has_tag && !has_list_reference {
            sqlx::query("DELETE FROM manifests WHERE id = $1")
                .bind(manifest_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM gc_manifest_tasks WHERE repository_id = $1 AND manifest_id = $2")
            .bind(repository_id)
            .bind(manifest_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_lock_deadline_is_five_seconds() {
        assert_eq!(REVIEW_LOCK_DEADLINE, Duration::from_secs(5));
    }
}
