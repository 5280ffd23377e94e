use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::Job;

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Durable copy of job records, written when jobs reach a terminal state and
/// when the orchestrator shuts down.
#[derive(Clone)]
pub struct JobArchive {
    pool: PgPool,
}

impl JobArchive {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, job: &Job) -> Result<(), sqlx::Error> {
        queries::upsert_job(&self.pool, job).await
    }

    pub async fn save_all(&self, jobs: &[Job]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            queries::upsert_job(&mut *tx, job).await?;
        }
        tx.commit().await
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        queries::get_job(&self.pool, job_id).await
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ())
    }
}
