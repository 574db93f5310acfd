//! # Reconciler
//!
//! The per-key control loop for `ConfigMapSecret` resources:
//!
//! 1. Fetch the source (a deleted source only has its index rows cleared;
//!    the rendered secret is garbage collected through its owner reference).
//! 2. Refresh the reference index from the spec.
//! 3. Render the target secret and create it, update it, or take ownership
//!    of an existing unowned secret with the same name.
//! 4. Write the `RenderFailure` status condition.
//! 5. Clean up previously rendered secrets left behind by a template rename.
//!
//! Configuration errors (missing required dependencies or keys) are surfaced
//! as a status condition and a requeue; every other error bubbles up to the
//! error policy for a backed-off retry.

use crate::controller::backoff::FibonacciBackoff;
use crate::controller::conditions::{
    new_condition, set_condition, CREATE_VARIABLES_ERROR_REASON, INTERNAL_ERROR_REASON,
};
use crate::controller::refmap::{self, RefIndex};
use crate::controller::render::{controller_owner_ref, render_secret, target_secret_name};
use crate::controller::vars::{make_variables, var_refs};
use crate::crd::{ConfigMapSecret, ConfigMapSecretStatus, RENDER_FAILURE_CONDITION};
use crate::observability::metrics;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::events::{Recorder, Reporter};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

/// Minimum and maximum requeue delay for failed or unrenderable sources.
const BACKOFF_MIN_SECONDS: u64 = 30;
const BACKOFF_MAX_SECONDS: u64 = 300;

/// Errors produced by a reconcile.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced resource or key is required but absent. Reported through
    /// the status condition rather than as a runtime failure.
    #[error("{0}")]
    Config(String),

    /// The target secret exists with a different controller owner. Human
    /// action is required.
    #[error("Secret {namespace}/{name} is already owned by {owner_kind} {owner_name}")]
    AlreadyOwned {
        namespace: String,
        name: String,
        owner_kind: String,
        owner_name: String,
    },

    /// A required metadata field is unset on an object from the API server.
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Any other cluster API error.
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl Error {
    /// Whether this error indicates user or cluster-data misconfiguration.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

/// State shared by every reconcile and by the event dispatch handlers.
pub struct Context {
    pub client: Client,
    pub recorder: Recorder,
    pub index: Arc<RwLock<RefIndex>>,
    backoffs: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl Context {
    pub fn new(client: Client, index: Arc<RwLock<RefIndex>>) -> Self {
        let reporter = Reporter {
            controller: "configmapsecret-controller".to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            index,
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    fn next_backoff(&self, key: &str) -> std::time::Duration {
        self.backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(BACKOFF_MIN_SECONDS, BACKOFF_MAX_SECONDS))
            .next_backoff()
    }

    fn reset_backoff(&self, key: &str) {
        self.backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Core `ObjectReference` of a source, for event publishing.
pub fn object_reference(cms: &ConfigMapSecret) -> ObjectReference {
    ObjectReference {
        api_version: Some(ConfigMapSecret::api_version(&()).to_string()),
        kind: Some(ConfigMapSecret::kind(&()).to_string()),
        name: cms.metadata.name.clone(),
        namespace: cms.metadata.namespace.clone(),
        uid: cms.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

/// Reconciles a single ConfigMapSecret.
pub async fn reconcile(cms: Arc<ConfigMapSecret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cms
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cms.name_any();
    let key = format!("{namespace}/{name}");

    metrics::increment_reconciliations();
    let timer = metrics::reconcile_timer();

    let api: Api<ConfigMapSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    let cms = match api.get(&name).await {
        Ok(cms) => cms,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            // Rendered secrets are garbage collected via the owner reference.
            refmap::write(&ctx.index).clear_refs(&namespace, &name);
            ctx.reset_backoff(&key);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let (secret_names, config_map_names) = var_refs(&cms);
    refmap::write(&ctx.index).set_refs(&namespace, &name, &secret_names, &config_map_names);

    let sync_result = sync(&ctx, &cms).await;
    let cleanup_result = cleanup(&ctx, &cms).await;
    let requeue = match sync_result {
        Ok(requeue) => {
            cleanup_result?;
            requeue
        }
        Err(err) => {
            if let Err(cleanup_err) = cleanup_result {
                warn!(configmapsecret = %key, error = %cleanup_err, "Cleanup failed");
            }
            return Err(err);
        }
    };

    timer.observe_duration();
    if requeue {
        Ok(Action::requeue(ctx.next_backoff(&key)))
    } else {
        ctx.reset_backoff(&key);
        Ok(Action::await_change())
    }
}

/// Requeue policy for reconcile errors, paced per resource.
pub fn error_policy(cms: Arc<ConfigMapSecret>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        cms.namespace().unwrap_or_default(),
        cms.name_any()
    );
    metrics::increment_reconciliation_errors();
    warn!(configmapsecret = %key, error = %error, "Reconcile failed");
    Action::requeue(ctx.next_backoff(&key))
}

/// Renders the target secret and writes it through the cluster API.
/// Returns whether the reconcile should requeue without error.
async fn sync(ctx: &Context, cms: &ConfigMapSecret) -> Result<bool, Error> {
    let namespace = cms
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let source_key = format!("{namespace}/{}", cms.name_any());

    let rendered = match render(ctx, cms).await {
        Ok(secret) => secret,
        Err(err) if err.is_config() => {
            metrics::increment_missing_value_render_errors(&namespace);
            info!(configmapsecret = %source_key, warning = %err, "Unable to render ConfigMapSecret");
            sync_render_failure_status(ctx, cms, CREATE_VARIABLES_ERROR_REASON, &err.to_string())
                .await?;
            return Ok(true);
        }
        Err(err) => {
            let reason = match err {
                Error::Api(_) => CREATE_VARIABLES_ERROR_REASON,
                _ => INTERNAL_ERROR_REASON,
            };
            if let Err(status_err) =
                sync_render_failure_status(ctx, cms, reason, &err.to_string()).await
            {
                warn!(configmapsecret = %source_key, error = %status_err, "Unable to update status");
            }
            return Err(err);
        }
    };

    let target_name = rendered.name_any();
    let secret_key = format!("{namespace}/{target_name}");
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut found = match secrets.get(&target_name).await {
        Ok(secret) => secret,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            info!(secret = %secret_key, "Creating Secret");
            secrets.create(&PostParams::default(), &rendered).await?;
            sync_success_status(ctx, cms).await?;
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    let owner_changed = set_owner(cms, &mut found)?;
    if owner_changed || should_update(&found, &rendered) {
        found.metadata.labels = rendered.metadata.labels.clone();
        found.metadata.annotations = rendered.metadata.annotations.clone();
        found.data = rendered.data.clone();
        found.type_ = rendered.type_.clone();
        info!(secret = %secret_key, "Updating Secret");
        secrets
            .replace(&target_name, &PostParams::default(), &found)
            .await?;
    }
    sync_success_status(ctx, cms).await?;
    Ok(false)
}

async fn render(ctx: &Context, cms: &ConfigMapSecret) -> Result<Secret, Error> {
    let env = make_variables(ctx, cms).await?;
    render_secret(cms, &env)
}

/// Confirms or takes controller ownership of an existing secret. Returns
/// whether the owner reference list was modified.
fn set_owner(cms: &ConfigMapSecret, secret: &mut Secret) -> Result<bool, Error> {
    let owner = controller_owner_ref(cms)?;
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();
    let secret_key = format!("{namespace}/{name}");
    let refs = secret.metadata.owner_references.get_or_insert_with(Vec::new);
    for existing in refs.iter_mut() {
        if existing.controller != Some(true) {
            continue;
        }
        if existing.uid != owner.uid {
            return Err(Error::AlreadyOwned {
                namespace,
                name,
                owner_kind: existing.kind.clone(),
                owner_name: existing.name.clone(),
            });
        }
        if *existing != owner {
            // e.g. the apiVersion changed
            info!(secret = %secret_key, "Updating ownership of Secret");
            *existing = owner;
            return Ok(true);
        }
        return Ok(false);
    }
    info!(secret = %secret_key, "Taking ownership of Secret");
    refs.push(owner);
    Ok(true)
}

/// Whether the existing secret differs from the rendered one in any of the
/// fields the controller owns. Absent and empty maps compare equal.
fn should_update(current: &Secret, desired: &Secret) -> bool {
    fn differs<V: PartialEq>(
        a: &Option<BTreeMap<String, V>>,
        b: &Option<BTreeMap<String, V>>,
    ) -> bool {
        let empty = BTreeMap::new();
        a.as_ref().unwrap_or(&empty) != b.as_ref().unwrap_or(&empty)
    }

    current.type_ != desired.type_
        || differs(&current.metadata.annotations, &desired.metadata.annotations)
        || differs(&current.metadata.labels, &desired.metadata.labels)
        || differs(&current.data, &desired.data)
}

/// Deletes previously rendered secrets whose name no longer matches the
/// template's target name.
async fn cleanup(ctx: &Context, cms: &ConfigMapSecret) -> Result<(), Error> {
    let namespace = cms
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let Some(uid) = cms.metadata.uid.as_deref() else {
        return Ok(());
    };
    let target_name = target_secret_name(cms);
    let owned = refmap::read(&ctx.index).owned_secrets(&namespace, uid);

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    for name in owned {
        if name == target_name {
            continue;
        }
        let secret_key = format!("{namespace}/{name}");
        info!(secret = %secret_key, "Cleaning up secret");
        match secrets.get(&name).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(secret = %secret_key, "Cleaning up secret unnecessary, already removed");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        match secrets.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn sync_success_status(ctx: &Context, cms: &ConfigMapSecret) -> Result<(), Error> {
    sync_status(ctx, cms, "False", "", "").await
}

async fn sync_render_failure_status(
    ctx: &Context,
    cms: &ConfigMapSecret,
    reason: &str,
    message: &str,
) -> Result<(), Error> {
    sync_status(ctx, cms, "True", reason, message).await
}

/// Writes `observedGeneration` and the `RenderFailure` condition through the
/// status subresource. Skipped entirely when nothing changed.
async fn sync_status(
    ctx: &Context,
    cms: &ConfigMapSecret,
    cond_status: &str,
    reason: &str,
    message: &str,
) -> Result<(), Error> {
    let namespace = cms
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cms.name_any();

    let mut status = ConfigMapSecretStatus {
        observed_generation: cms.metadata.generation,
        conditions: cms
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
    };
    let cond = new_condition(RENDER_FAILURE_CONDITION, cond_status, reason, message);
    set_condition(&mut status, cond);
    if cms.status.as_ref() == Some(&status) {
        return Ok(());
    }

    info!(configmapsecret = %format!("{namespace}/{name}"), "Updating status");
    let api: Api<ConfigMapSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}
