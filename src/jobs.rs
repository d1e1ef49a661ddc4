use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::entities;
use crate::errors::TetherError;
use crate::security::devices::DeviceRegistry;
use crate::security::tokens::TokenLifecycle;
use crate::settings::Events;
use crate::storage;

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    db: DatabaseConnection,
    registry: Arc<DeviceRegistry>,
    tokens: Arc<TokenLifecycle>,
    events_cfg: Events,
) -> Result<JobScheduler, TetherError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| TetherError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let db_clone = db.clone();
    let registry_clone = registry.clone();

    // Expired device trust sweep - runs every hour
    let trust_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        let registry = registry_clone.clone();
        Box::pin(async move {
            info!("Running cleanup_expired_trust job");
            let execution_id = start_job_execution(&db, "cleanup_expired_trust").await.ok();

            match registry.cleanup_expired_trust().await {
                Ok(count) => {
                    info!("Cleared trust on {} expired registrations", count);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, true, None, Some(count as i64)).await;
                    }
                }
                Err(e) => {
                    error!("Failed to cleanup expired trust: {}", e);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, false, Some(e.to_string()), None).await;
                    }
                }
            }
        })
    })
    .map_err(|e| TetherError::Other(format!("Failed to create trust cleanup job: {}", e)))?;

    sched
        .add(trust_job)
        .await
        .map_err(|e| TetherError::Other(format!("Failed to add trust cleanup job: {}", e)))?;

    let db_clone = db.clone();
    let tokens_clone = tokens.clone();

    // Expired token pairing sweep - runs every hour at 30 minutes past
    let tokens_job = Job::new_async("0 30 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        let tokens = tokens_clone.clone();
        Box::pin(async move {
            info!("Running cleanup_expired_tokens job");
            let execution_id = start_job_execution(&db, "cleanup_expired_tokens").await.ok();

            match tokens.cleanup_expired_tokens().await {
                Ok(count) => {
                    info!("Reclaimed {} expired token pairings", count);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, true, None, Some(count as i64)).await;
                    }
                }
                Err(e) => {
                    error!("Failed to cleanup expired tokens: {}", e);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, false, Some(e.to_string()), None).await;
                    }
                }
            }
        })
    })
    .map_err(|e| TetherError::Other(format!("Failed to create token cleanup job: {}", e)))?;

    sched
        .add(tokens_job)
        .await
        .map_err(|e| TetherError::Other(format!("Failed to add token cleanup job: {}", e)))?;

    let db_clone = db.clone();
    let retention_days = events_cfg.retention_days;

    // Security event retention sweep - runs daily at 03:15
    let events_job = Job::new_async("0 15 3 * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            info!("Running cleanup_old_security_events job");
            let execution_id = start_job_execution(&db, "cleanup_old_security_events")
                .await
                .ok();

            let cutoff = Utc::now().timestamp() - retention_days * 24 * 3600;
            match storage::cleanup_old_security_events(&db, cutoff).await {
                Ok(count) => {
                    info!("Deleted {} security events past retention", count);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, true, None, Some(count as i64)).await;
                    }
                }
                Err(e) => {
                    error!("Failed to cleanup old security events: {}", e);
                    if let Some(id) = execution_id {
                        let _ =
                            complete_job_execution(&db, id, false, Some(e.to_string()), None).await;
                    }
                }
            }
        })
    })
    .map_err(|e| TetherError::Other(format!("Failed to create event cleanup job: {}", e)))?;

    sched
        .add(events_job)
        .await
        .map_err(|e| TetherError::Other(format!("Failed to add event cleanup job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| TetherError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", 3);

    Ok(sched)
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, TetherError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
        ..Default::default()
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), TetherError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (useful for operational tooling)
pub async fn trigger_job_manually(
    db: &DatabaseConnection,
    registry: &DeviceRegistry,
    tokens: &TokenLifecycle,
    events_cfg: &Events,
    job_name: &str,
) -> Result<(), TetherError> {
    info!("Manually triggering job: {}", job_name);
    let execution_id = start_job_execution(db, job_name).await?;

    let result = match job_name {
        "cleanup_expired_trust" => registry.cleanup_expired_trust().await,
        "cleanup_expired_tokens" => tokens.cleanup_expired_tokens().await,
        "cleanup_old_security_events" => {
            let cutoff = Utc::now().timestamp() - events_cfg.retention_days * 24 * 3600;
            storage::cleanup_old_security_events(db, cutoff).await
        }
        _ => {
            return Err(TetherError::Other(format!("Unknown job name: {}", job_name)));
        }
    };

    match result {
        Ok(count) => {
            info!(
                "Manually triggered job {} completed: {} records",
                job_name, count
            );
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await?;
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
        }
    }

    Ok(())
}
