//! Update job: refetch the script and swap in a new version when it changed

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{JobContext, JobResult};
use crate::core::errors::ServiceWorkerError;

#[instrument(skip_all, fields(scope = %scope, force = force))]
pub(crate) async fn run(ctx: &JobContext, scope: Url, force: bool) -> JobResult {
    let mut registration = ctx
        .store
        .find_registration(&scope)
        .await?
        .ok_or_else(|| ServiceWorkerError::not_found(format!("registration for {}", scope)))?;

    let now = Utc::now();
    let since_check = (now - registration.last_update_check)
        .to_std()
        .unwrap_or_default();
    if !force && since_check < ctx.update_check_interval {
        debug!(?since_check, "Checked recently, skipping update");
        return Ok(registration);
    }

    // An unchanged script leaves the stored registration as it was.
    let script_id = ctx
        .scripts
        .fetch_and_cache(&registration.script_url, registration.script_id)
        .await
        .into_result(&registration.script_url)?;

    let previous = registration.active_version;
    let version_id = ctx.start_new_version(&registration, script_id).await?;
    registration.active_version = Some(version_id);
    registration.script_id = Some(script_id);
    registration.last_update_check = now;

    if let Err(err) = ctx.store.store_registration(&registration).await {
        warn!(version_id = %version_id, error = %err, "Persisting updated version failed");
        ctx.context.retire_version(version_id).await?;
        return Err(err);
    }
    if let Some(previous) = previous {
        ctx.context.retire_version(previous).await?;
    }
    info!(registration_id = %registration.id, version_id = %version_id, "Registration updated");
    Ok(registration)
}
