//! # Event dispatch
//!
//! Translates Secret and ConfigMap change events into reconcile requests for
//! exactly the affected ConfigMapSecrets, and keeps the owned-secret side of
//! the reference index current. The mappers plug into `Controller::watches`;
//! the trackers run as standalone watch tasks so deletions are observed with
//! their final object state.

use crate::controller::refmap::{self, RefIndex};
use crate::crd::{ConfigMapSecret, GROUP};
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// The controller owner reference of a secret, provided it points at a
/// ConfigMapSecret in our API group.
pub fn controller_owner(secret: &Secret) -> Option<&OwnerReference> {
    let owner = secret
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))?;
    if owner.kind != ConfigMapSecret::kind(&()).as_ref() {
        return None;
    }
    let group = owner.api_version.split('/').next().unwrap_or_default();
    (group == GROUP).then_some(owner)
}

/// Maps a Secret change to the owning source plus every source referencing
/// the secret as a data source.
pub fn secret_mapper(
    index: Arc<RwLock<RefIndex>>,
) -> impl Fn(Secret) -> Vec<ObjectRef<ConfigMapSecret>> {
    move |secret| {
        let Some(namespace) = secret.namespace() else {
            return Vec::new();
        };
        let name = secret.name_any();
        let owner_name = controller_owner(&secret).map(|o| o.name.clone());

        let mut requests = Vec::new();
        if let Some(owner) = &owner_name {
            requests.push(ObjectRef::new(owner).within(&namespace));
        }
        for src in refmap::read(&index).secret_srcs(&namespace, &name) {
            if owner_name.as_deref() == Some(src.as_str()) {
                continue;
            }
            requests.push(ObjectRef::new(&src).within(&namespace));
        }
        requests
    }
}

/// Maps a ConfigMap change to every source referencing it.
pub fn config_map_mapper(
    index: Arc<RwLock<RefIndex>>,
) -> impl Fn(ConfigMap) -> Vec<ObjectRef<ConfigMapSecret>> {
    move |config_map| {
        let Some(namespace) = config_map.namespace() else {
            return Vec::new();
        };
        let name = config_map.name_any();
        refmap::read(&index)
            .config_map_srcs(&namespace, &name)
            .iter()
            .map(|src| ObjectRef::new(src).within(&namespace))
            .collect()
    }
}

/// Watches Secrets and maintains the owned relation of the index: a valid
/// controller owner sets the row, deletion or an invalid owner clears it.
pub async fn track_owned_secrets(api: Api<Secret>, index: Arc<RwLock<RefIndex>>) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(secret)) | Ok(watcher::Event::InitApply(secret)) => {
                record_owner(&index, &secret, false);
            }
            Ok(watcher::Event::Delete(secret)) => record_owner(&index, &secret, true),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Secret watch error"),
        }
    }
}

fn record_owner(index: &RwLock<RefIndex>, secret: &Secret, deleted: bool) {
    let Some(namespace) = secret.namespace() else {
        return;
    };
    let name = secret.name_any();
    let uid = if deleted {
        None
    } else {
        controller_owner(secret).map(|o| o.uid.clone())
    };
    refmap::write(index).set_owner(&namespace, &name, uid.as_deref());
}

/// Watches ConfigMapSecrets and clears a source's dependency rows when it is
/// deleted. The rendered secret itself is garbage collected by the cluster.
pub async fn track_sources(api: Api<ConfigMapSecret>, index: Arc<RwLock<RefIndex>>) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Delete(cms)) => {
                if let Some(namespace) = cms.namespace() {
                    refmap::write(&index).clear_refs(&namespace, &cms.name_any());
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "ConfigMapSecret watch error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashSet;

    fn secret(namespace: &str, name: &str, owners: Vec<OwnerReference>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: (!owners.is_empty()).then_some(owners),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    fn owner(kind: &str, api_version: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(controller),
            block_owner_deletion: None,
        }
    }

    fn index_with_secret_ref(namespace: &str, src: &str, dep: &str) -> Arc<RwLock<RefIndex>> {
        let index = Arc::new(RwLock::new(RefIndex::default()));
        let secrets: HashSet<String> = [dep.to_string()].into();
        refmap::write(&index).set_refs(namespace, src, &secrets, &HashSet::new());
        index
    }

    #[test]
    fn controller_owner_requires_our_kind_and_group() {
        let ours = owner("ConfigMapSecret", "secrets.mz.com/v1alpha1", "cms", true);
        assert!(controller_owner(&secret("default", "s", vec![ours.clone()])).is_some());

        let wrong_kind = owner("Deployment", "apps/v1", "dep", true);
        assert!(controller_owner(&secret("default", "s", vec![wrong_kind])).is_none());

        let wrong_group = owner("ConfigMapSecret", "other.io/v1alpha1", "cms", true);
        assert!(controller_owner(&secret("default", "s", vec![wrong_group])).is_none());

        let not_controller = owner("ConfigMapSecret", "secrets.mz.com/v1alpha1", "cms", false);
        assert!(controller_owner(&secret("default", "s", vec![not_controller])).is_none());
    }

    #[test]
    fn secret_mapper_enqueues_owner_and_referencing_sources() {
        let index = index_with_secret_ref("default", "reader", "dep-secret");
        let mapper = secret_mapper(index);

        let ours = owner("ConfigMapSecret", "secrets.mz.com/v1alpha1", "owner-cms", true);
        let requests = mapper(secret("default", "dep-secret", vec![ours]));

        let expected_owner = ObjectRef::<ConfigMapSecret>::new("owner-cms").within("default");
        let expected_reader = ObjectRef::<ConfigMapSecret>::new("reader").within("default");
        assert_eq!(requests.len(), 2);
        assert!(requests.contains(&expected_owner));
        assert!(requests.contains(&expected_reader));
    }

    #[test]
    fn secret_mapper_skips_owner_among_referencing_sources() {
        let index = index_with_secret_ref("default", "self-ref", "dep-secret");
        let mapper = secret_mapper(index);

        let ours = owner("ConfigMapSecret", "secrets.mz.com/v1alpha1", "self-ref", true);
        let requests = mapper(secret("default", "dep-secret", vec![ours]));
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn config_map_mapper_uses_reference_index() {
        let index = Arc::new(RwLock::new(RefIndex::default()));
        let config_maps: HashSet<String> = ["settings".to_string()].into();
        refmap::write(&index).set_refs("default", "reader", &HashSet::new(), &config_maps);
        let mapper = config_map_mapper(index);

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let requests = mapper(cm);
        assert_eq!(
            requests,
            vec![ObjectRef::<ConfigMapSecret>::new("reader").within("default")]
        );

        let unrelated = ConfigMap {
            metadata: ObjectMeta {
                name: Some("other".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let mapper = config_map_mapper(Arc::new(RwLock::new(RefIndex::default())));
        assert!(mapper(unrelated).is_empty());
    }

    #[test]
    fn record_owner_tracks_lifecycle() {
        let index = Arc::new(RwLock::new(RefIndex::default()));
        let ours = owner("ConfigMapSecret", "secrets.mz.com/v1alpha1", "cms", true);
        let owned = secret("default", "rendered", vec![ours]);

        record_owner(&index, &owned, false);
        assert_eq!(
            refmap::read(&index).owned_secrets("default", "uid-cms"),
            ["rendered"]
        );

        record_owner(&index, &owned, true);
        assert!(refmap::read(&index)
            .owned_secrets("default", "uid-cms")
            .is_empty());
    }
}
