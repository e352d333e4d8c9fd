use tracing::{info, instrument};
use url::Url;

use super::{JobContext, JobResult};
use crate::core::errors::ServiceWorkerError;

/// Retire the scope's workers and delete its registration
#[instrument(skip_all, fields(scope = %scope))]
pub(crate) async fn run(ctx: &JobContext, scope: Url) -> JobResult {
    let registration = ctx
        .store
        .find_registration(&scope)
        .await?
        .ok_or_else(|| ServiceWorkerError::not_found(format!("registration for {}", scope)))?;

    ctx.context.retire_registration(registration.id).await?;
    ctx.store.delete_registration(&scope).await?;
    info!(registration_id = %registration.id, "Unregistered");
    Ok(registration)
}
