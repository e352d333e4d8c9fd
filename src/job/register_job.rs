//! Register job: lookup, reuse or replace, persist, start worker

use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{JobContext, JobResult};
use crate::core::errors::Result;
use crate::storage::Registration;

#[instrument(skip_all, fields(scope = %scope, script_url = %script_url))]
pub(crate) async fn run(ctx: &JobContext, scope: Url, script_url: Url) -> JobResult {
    let registration = match ctx.store.find_registration(&scope).await? {
        Some(existing) if existing.script_url == script_url => {
            debug!(registration_id = %existing.id, "Reusing registration");
            existing
        }
        Some(stale) => {
            info!(
                registration_id = %stale.id,
                stale_script = %stale.script_url,
                "Script URL changed, replacing registration"
            );
            ctx.context.retire_registration(stale.id).await?;
            ctx.store.delete_registration(&scope).await?;
            create(ctx, scope, script_url).await?
        }
        None => create(ctx, scope, script_url).await?,
    };

    if registration.active_version.is_some() {
        return Ok(registration);
    }
    start_worker(ctx, registration).await
}

async fn create(ctx: &JobContext, scope: Url, script_url: Url) -> Result<Registration> {
    let id = ctx.store.new_registration_id().await?;
    let registration = Registration::new(id, scope, script_url);
    ctx.store.store_registration(&registration).await?;
    debug!(registration_id = %id, "Created registration");
    Ok(registration)
}

async fn start_worker(ctx: &JobContext, mut registration: Registration) -> JobResult {
    let script_id = ctx
        .scripts
        .fetch_and_cache(&registration.script_url, None)
        .await
        .into_result(&registration.script_url)?;

    let version_id = ctx.start_new_version(&registration, script_id).await?;
    registration.active_version = Some(version_id);
    registration.script_id = Some(script_id);

    if let Err(err) = ctx.store.store_registration(&registration).await {
        warn!(version_id = %version_id, error = %err, "Persisting active version failed");
        ctx.context.retire_version(version_id).await?;
        return Err(err);
    }
    info!(registration_id = %registration.id, version_id = %version_id, "Registration installed");
    Ok(registration)
}
