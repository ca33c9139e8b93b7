//! SQLite-backed brain.
//!
//! Tuples live in one row each, `(tag, p0..pN, suffix, msg)`, with the
//! rowid giving learn order. Prefix columns are generated for the order the
//! database was created with, which is pinned in `brain_meta`.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::tuple::assert_width;
use super::{Eraser, Learner, Lookup, MessageMeta, Occurrence, Tuple};
use crate::core::errors::{BrainError, StorageError};
use crate::userhash::UserHash;

/// SQL text specialized for one chain order.
struct Statements {
    insert_tuple: String,
    forget_tuple: String,
    lookup: String,
}

impl Statements {
    fn new(order: usize) -> Self {
        let cols: Vec<String> = (0..order).map(|i| format!("p{i}")).collect();
        // ?1 is the tag, prefixes follow, then the suffix.
        let matches: Vec<String> = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 2))
            .collect();
        let suffix = order + 2;

        let placeholders: Vec<String> = (1..=order + 3).map(|i| format!("?{i}")).collect();
        let insert_tuple = format!(
            "INSERT INTO tuples (tag, {}, suffix, msg) VALUES ({})",
            cols.join(", "),
            placeholders.join(", ")
        );
        let forget_tuple = format!(
            "DELETE FROM tuples WHERE id = (
                SELECT id FROM tuples
                WHERE tag = ?1 AND {} AND suffix = ?{suffix}
                ORDER BY id LIMIT 1
            )
            RETURNING msg",
            matches.join(" AND ")
        );
        let lookup = format!(
            "SELECT suffix, msg FROM tuples WHERE tag = ?1 AND {} ORDER BY id",
            matches.join(" AND ")
        );
        Self {
            insert_tuple,
            forget_tuple,
            lookup,
        }
    }
}

pub struct SqlBrain {
    pool: SqlitePool,
    order: usize,
    stmts: Statements,
}

impl SqlBrain {
    pub async fn with_path(db_path: PathBuf, order: usize) -> Result<Self, BrainError> {
        if order < 1 {
            return Err(BrainError::Config(format!("order must be at least 1, got {order}")));
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|err| BrainError::storage("open", "", err))?;

        let brain = Self {
            pool,
            order,
            stmts: Statements::new(order),
        };
        brain.init_schema().await?;
        Ok(brain)
    }

    async fn init_schema(&self) -> Result<(), BrainError> {
        let fail = |err: sqlx::Error| BrainError::storage("open", "", err);

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS brain_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(fail)?;

        sqlx::query("INSERT OR IGNORE INTO brain_meta (key, value) VALUES ('order', ?1)")
            .bind(self.order.to_string())
            .execute(&self.pool)
            .await
            .map_err(fail)?;
        let stored: String = sqlx::query("SELECT value FROM brain_meta WHERE key = 'order'")
            .fetch_one(&self.pool)
            .await
            .map_err(fail)?
            .try_get("value")
            .map_err(fail)?;
        let stored: usize = stored.parse().map_err(|_| {
            BrainError::storage("open", "", StorageError::Corrupt(format!("order {stored:?}")))
        })?;
        if stored != self.order {
            return Err(BrainError::Config(format!(
                "brain was created with order {stored}, not {}",
                self.order
            )));
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id BLOB PRIMARY KEY,
                user BLOB NOT NULL,
                tag TEXT NOT NULL,
                time INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(fail)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user)")
            .execute(&self.pool)
            .await
            .map_err(fail)?;

        let cols: Vec<String> = (0..self.order).map(|i| format!("p{i}")).collect();
        let defs: Vec<String> = cols.iter().map(|c| format!("{c} TEXT NOT NULL")).collect();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS tuples (
                id INTEGER PRIMARY KEY,
                tag TEXT NOT NULL,
                {},
                suffix TEXT NOT NULL,
                msg BLOB NOT NULL
            )",
            defs.join(",\n                ")
        ))
        .execute(&self.pool)
        .await
        .map_err(fail)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_tuples_prefix ON tuples(tag, {}, suffix)",
            cols.join(", ")
        ))
        .execute(&self.pool)
        .await
        .map_err(fail)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tuples_msg ON tuples(msg)")
            .execute(&self.pool)
            .await
            .map_err(fail)?;

        Ok(())
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Races `work` against `cancel`. Dropping the work drops any transaction it
/// borrows uncommitted, which rolls it back.
async fn guarded<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, BrainError>>,
) -> Result<T, BrainError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BrainError::Canceled),
        res = work => res,
    }
}

#[async_trait]
impl Learner for SqlBrain {
    fn order(&self) -> usize {
        self.order
    }

    async fn learn(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        tuples: &[Tuple],
    ) -> Result<(), BrainError> {
        assert_width(self.order, tuples);
        let tag = meta.tag.as_str();
        let fail = |err: sqlx::Error| BrainError::storage("learn", tag, err);
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }

        let mut tx = self.pool.begin().await.map_err(fail)?;
        guarded(cancel, async {
            sqlx::query("INSERT OR IGNORE INTO messages (id, user, tag, time) VALUES (?1, ?2, ?3, ?4)")
                .bind(meta.id)
                .bind(&meta.user.as_bytes()[..])
                .bind(tag)
                .bind(meta.time.timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(fail)?;

            for t in tuples {
                let mut query = sqlx::query(&self.stmts.insert_tuple).bind(tag);
                for p in &t.prefix {
                    query = query.bind(p.as_str());
                }
                query
                    .bind(t.suffix.as_str())
                    .bind(meta.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(fail)?;
            }
            Ok::<_, BrainError>(())
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        tx.commit().await.map_err(fail)?;
        Ok(())
    }

    async fn forget(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        tuples: &[Tuple],
    ) -> Result<(), BrainError> {
        assert_width(self.order, tuples);
        let fail = |err: sqlx::Error| BrainError::storage("forget", tag, err);
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }

        let mut tx = self.pool.begin().await.map_err(fail)?;
        guarded(cancel, async {
            let mut touched = BTreeSet::new();
            for t in tuples {
                let mut query = sqlx::query(&self.stmts.forget_tuple).bind(tag);
                for p in &t.prefix {
                    query = query.bind(p.as_str());
                }
                let row = query
                    .bind(t.suffix.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(fail)?;
                if let Some(row) = row {
                    let id: Uuid = row.try_get("msg").map_err(fail)?;
                    touched.insert(id);
                }
            }
            // A message record lives exactly as long as one of its tuples.
            for id in touched {
                sqlx::query(
                    "DELETE FROM messages
                     WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM tuples WHERE msg = ?1)",
                )
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(fail)?;
            }
            Ok::<_, BrainError>(())
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        tx.commit().await.map_err(fail)?;
        Ok(())
    }
}

#[async_trait]
impl Lookup for SqlBrain {
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prefix: &[String],
    ) -> Result<Vec<Occurrence>, BrainError> {
        assert_eq!(
            prefix.len(),
            self.order,
            "lookup prefix has width {} but the brain has order {}",
            prefix.len(),
            self.order
        );
        let fail = |err: sqlx::Error| BrainError::storage("lookup", tag, err);
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }

        guarded(cancel, async {
            let mut query = sqlx::query(&self.stmts.lookup).bind(tag);
            for p in prefix {
                query = query.bind(p.as_str());
            }
            let rows = query.fetch_all(&self.pool).await.map_err(fail)?;
            rows.iter()
                .map(|row| {
                    Ok(Occurrence {
                        suffix: row.try_get("suffix").map_err(fail)?,
                        id: row.try_get("msg").map_err(fail)?,
                    })
                })
                .collect::<Result<Vec<_>, BrainError>>()
        })
        .await
    }
}

#[async_trait]
impl Eraser for SqlBrain {
    async fn message(
        &self,
        cancel: &CancellationToken,
        id: Uuid,
    ) -> Result<Option<MessageMeta>, BrainError> {
        let fail = |err: sqlx::Error| BrainError::storage("message", "", err);
        let corrupt = |what: String| BrainError::storage("message", "", StorageError::Corrupt(what));
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }

        guarded(cancel, async {
            let row = sqlx::query("SELECT user, tag, time FROM messages WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(fail)?;
            let Some(row) = row else {
                return Ok::<_, BrainError>(None);
            };
            let user: Vec<u8> = row.try_get("user").map_err(fail)?;
            let user: [u8; 32] = user
                .try_into()
                .map_err(|raw: Vec<u8>| corrupt(format!("user hash of {} bytes", raw.len())))?;
            let millis: i64 = row.try_get("time").map_err(fail)?;
            let time = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| corrupt(format!("message time {millis}")))?;
            Ok(Some(MessageMeta {
                id,
                user: UserHash::from_bytes(user),
                tag: row.try_get("tag").map_err(fail)?,
                time,
            }))
        })
        .await
    }

    async fn forget_message(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        id: Uuid,
    ) -> Result<usize, BrainError> {
        let fail = |err: sqlx::Error| BrainError::storage("forget_message", tag, err);
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }

        let mut tx = self.pool.begin().await.map_err(fail)?;
        let removed = guarded(cancel, async {
            let removed = sqlx::query("DELETE FROM tuples WHERE tag = ?1 AND msg = ?2")
                .bind(tag)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(fail)?
                .rows_affected();
            sqlx::query("DELETE FROM messages WHERE id = ?1 AND tag = ?2")
                .bind(id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(fail)?;
            Ok::<_, BrainError>(removed as usize)
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        tx.commit().await.map_err(fail)?;
        Ok(removed)
    }

    async fn forget_user(
        &self,
        cancel: &CancellationToken,
        user: &UserHash,
    ) -> Result<usize, BrainError> {
        let fail = |err: sqlx::Error| BrainError::storage("forget_user", "", err);
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        let user = &user.as_bytes()[..];

        let mut tx = self.pool.begin().await.map_err(fail)?;
        let removed = guarded(cancel, async {
            let removed = sqlx::query(
                "DELETE FROM tuples WHERE msg IN (SELECT id FROM messages WHERE user = ?1)",
            )
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(fail)?
            .rows_affected();
            sqlx::query("DELETE FROM messages WHERE user = ?1")
                .bind(user)
                .execute(&mut *tx)
                .await
                .map_err(fail)?;
            Ok::<_, BrainError>(removed as usize)
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        tx.commit().await.map_err(fail)?;
        Ok(removed)
    }
}
