use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::{DbError, DomainError, DomainResult};

use super::types::ParticipationRow;

/// Rows are always emitted in this order so repeated runs of the same
/// report produce byte-identical documents.
const STREAM_SQL: &str = "SELECT id, class_id, student_name, student_email, activity_name, \
     activity_kind, present, hours, score, grade, evaluation_status \
     FROM participation WHERE class_id = ? \
     ORDER BY student_name, activity_name, id";

/// Row-streaming access to class participation data.
#[async_trait]
pub trait ParticipationRepository: Send + Sync {
    /// Whether the class has anything to report on.
    async fn class_has_rows(&self, class_id: &str) -> DomainResult<bool>;

    /// Stream the class rows incrementally, never materializing the full
    /// set.
    fn stream_for_class(&self, class_id: &str)
        -> BoxStream<'static, DomainResult<ParticipationRow>>;
}

pub struct SqliteParticipationRepository {
    pool: SqlitePool,
}

impl SqliteParticipationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipationRepository for SqliteParticipationRepository {
    async fn class_has_rows(&self, class_id: &str) -> DomainResult<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM participation WHERE class_id = ?")
                .bind(class_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DomainError::Database(DbError::from(e)))?;
        Ok(count > 0)
    }

    fn stream_for_class(
        &self,
        class_id: &str,
    ) -> BoxStream<'static, DomainResult<ParticipationRow>> {
        let pool = self.pool.clone();
        let class_id = class_id.to_string();

        // The query runs on a separate task and hands rows over a bounded
        // channel, so the cursor lives exactly as long as the consumer and
        // backpressure propagates to the database read.
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut rows = sqlx::query_as::<_, ParticipationRow>(STREAM_SQL)
                .bind(&class_id)
                .fetch(&pool);

            while let Some(row) = rows.next().await {
                let item = row.map_err(|e| DomainError::Database(DbError::from(e)));
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    // Consumer dropped the stream. Stop so the cursor is
                    // released.
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
pub(crate) async fn seed_participation(pool: &SqlitePool, class_id: &str, rows: &[(&str, &str)]) {
    for (index, (student, activity)) in rows.iter().enumerate() {
        sqlx::query(
            "INSERT INTO participation (id, class_id, student_name, student_email, \
             activity_name, activity_kind, present, hours, score, grade, evaluation_status) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
        )
        .bind(format!("row-{}-{}", class_id, index))
        .bind(class_id)
        .bind(student)
        .bind(format!("{}@example.com", student.to_lowercase()))
        .bind(activity)
        .bind("workshop")
        .bind(2.0_f64)
        .bind(7.5_f64)
        .bind("B")
        .bind("approved")
        .execute(pool)
        .await
        .expect("seed participation row");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_class_has_rows() {
        let pool = test_pool().await;
        let repo = SqliteParticipationRepository::new(pool.clone());

        assert!(!repo.class_has_rows("class-1").await.unwrap());
        seed_participation(&pool, "class-1", &[("Alice", "Robotics")]).await;
        assert!(repo.class_has_rows("class-1").await.unwrap());
        assert!(!repo.class_has_rows("class-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_is_scoped_and_ordered() {
        let pool = test_pool().await;
        seed_participation(
            &pool,
            "class-1",
            &[("Carol", "Chess"), ("Alice", "Robotics"), ("Bob", "Chess")],
        )
        .await;
        seed_participation(&pool, "class-2", &[("Zoe", "Drama")]).await;

        let repo = SqliteParticipationRepository::new(pool);
        let rows: Vec<ParticipationRow> = repo
            .stream_for_class("class-1")
            .try_collect()
            .await
            .unwrap();

        let names: Vec<&str> = rows.iter().map(|r| r.student_name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
        assert!(rows.iter().all(|r| r.class_id == "class-1"));
    }

    #[tokio::test]
    async fn test_stream_for_empty_class_ends_immediately() {
        let pool = test_pool().await;
        let repo = SqliteParticipationRepository::new(pool);
        let rows: Vec<ParticipationRow> = repo
            .stream_for_class("missing")
            .try_collect()
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
