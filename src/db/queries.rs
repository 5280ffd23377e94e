use std::str::FromStr;

use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use crate::models::job::{FailureReason, Job, JobFailure, JobOptions, JobStatus};
use crate::models::mode::Mode;

/// Insert or update an archived job
pub async fn upsert_job<'e, E>(executor: E, job: &Job) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let failure = job.failure();

    sqlx::query(
        r#"
        INSERT INTO generation_jobs (
            id, mode, prompt, style, resolution, duration_secs, status,
            failure_reason, failure_detail, rejection_reason, result_ref,
            progress_message, created_at, updated_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            failure_reason = EXCLUDED.failure_reason,
            failure_detail = EXCLUDED.failure_detail,
            rejection_reason = EXCLUDED.rejection_reason,
            result_ref = EXCLUDED.result_ref,
            progress_message = EXCLUDED.progress_message,
            updated_at = EXCLUDED.updated_at,
            finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(job.id)
    .bind(job.mode.to_string())
    .bind(&job.prompt)
    .bind(job.options.style.as_deref())
    .bind(job.options.resolution.as_deref())
    .bind(job.options.duration.map(|d| d as i32))
    .bind(job.status().to_string())
    .bind(failure.map(|f| f.reason.to_string()))
    .bind(failure.map(|f| f.detail.as_str()))
    .bind(job.rejection_reason())
    .bind(job.result_ref())
    .bind(job.progress_message.as_deref())
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.finished_at())
    .execute(executor)
    .await?;

    Ok(())
}

/// Get an archived job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, mode, prompt, style, resolution, duration_secs, status,
               failure_reason, failure_detail, rejection_reason, result_ref,
               progress_message, created_at, updated_at, finished_at
        FROM generation_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let mode: String = r.try_get("mode")?;
    let status: String = r.try_get("status")?;
    let failure_reason: Option<String> = r.try_get("failure_reason")?;
    let failure_detail: Option<String> = r.try_get("failure_detail")?;
    let duration: Option<i32> = r.try_get("duration_secs")?;

    let failure = failure_reason
        .map(|reason| -> Result<JobFailure, sqlx::Error> {
            Ok(JobFailure {
                reason: FailureReason::from_str(&reason).map_err(decode_error("failure_reason"))?,
                detail: failure_detail.unwrap_or_default(),
            })
        })
        .transpose()?;

    Ok(Some(Job {
        id: r.try_get("id")?,
        mode: Mode::from_str(&mode).map_err(decode_error("mode"))?,
        prompt: r.try_get("prompt")?,
        options: JobOptions {
            style: r.try_get("style")?,
            resolution: r.try_get("resolution")?,
            duration: duration.map(|d| d.max(0) as u32),
        },
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        progress_message: r.try_get("progress_message")?,
        status: JobStatus::from_str(&status).map_err(decode_error("status"))?,
        finished_at: r.try_get("finished_at")?,
        result_ref: r.try_get("result_ref")?,
        failure,
        rejection_reason: r.try_get("rejection_reason")?,
    }))
}

fn decode_error(column: &'static str) -> impl Fn(strum::ParseError) -> sqlx::Error {
    move |e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}
