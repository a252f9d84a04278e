//! Recurring schedule repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ScheduleDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create_schedule(&self, schedule: &ScheduleDbModel) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<ScheduleDbModel>;
    async fn list_schedules(&self) -> Result<Vec<ScheduleDbModel>>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of ScheduleRepository.
pub struct SqlxScheduleRepository {
    pool: SqlitePool,
}

impl SqlxScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for SqlxScheduleRepository {
    async fn create_schedule(&self, schedule: &ScheduleDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_schedule", || async {
            sqlx::query(
                r#"
                INSERT INTO job_schedule (id, function_ref, interval_ms, kwargs, scheduled_by, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&schedule.id)
            .bind(&schedule.function_ref)
            .bind(schedule.interval_ms)
            .bind(&schedule.kwargs)
            .bind(&schedule.scheduled_by)
            .bind(schedule.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_schedule(&self, id: &str) -> Result<ScheduleDbModel> {
        sqlx::query_as::<_, ScheduleDbModel>("SELECT * FROM job_schedule WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Schedule", id))
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDbModel>> {
        let schedules =
            sqlx::query_as::<_, ScheduleDbModel>("SELECT * FROM job_schedule ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(schedules)
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        let deleted = retry_on_sqlite_busy("delete_schedule", || async {
            let result = sqlx::query("DELETE FROM job_schedule WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if deleted == 0 {
            return Err(Error::not_found("Schedule", id));
        }
        Ok(())
    }
}
