//! # Secret rendering
//!
//! Assembles the target Secret from a ConfigMapSecret's template and a
//! resolved variable environment, including the controller owner reference.

use crate::controller::expansion::{expand, mapping_for};
use crate::controller::reconciler::Error;
use crate::crd::ConfigMapSecret;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};

/// Name of the secret a source renders to: the template metadata name when
/// set, otherwise the source's own name.
pub fn target_secret_name(cms: &ConfigMapSecret) -> String {
    match cms.spec.template.metadata.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => cms.name_any(),
    }
}

/// Builds the controller owner reference pointing at `cms`.
pub fn controller_owner_ref(cms: &ConfigMapSecret) -> Result<OwnerReference, Error> {
    let name = cms
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let uid = cms
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    Ok(OwnerReference {
        api_version: ConfigMapSecret::api_version(&()).to_string(),
        kind: ConfigMapSecret::kind(&()).to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Renders the target Secret for `cms` under the environment `env`.
///
/// Template `data` values are expanded; `binaryData` values are expanded
/// only when they contain a `$` and decode as UTF-8, and are copied through
/// byte-identical otherwise.
pub fn render_secret(
    cms: &ConfigMapSecret,
    env: &HashMap<String, String>,
) -> Result<Secret, Error> {
    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    if let Some(template_data) = &cms.spec.template.data {
        for (k, v) in template_data {
            let expanded = expand(v, mapping_for(env));
            data.insert(k.clone(), ByteString(expanded.into_bytes()));
        }
    }
    if let Some(binary_data) = &cms.spec.template.binary_data {
        for (k, v) in binary_data {
            data.insert(k.clone(), ByteString(expand_bytes(&v.0, env)));
        }
    }

    let meta = &cms.spec.template.metadata;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(target_secret_name(cms)),
            namespace: cms.metadata.namespace.clone(),
            labels: meta.labels.clone(),
            annotations: meta.annotations.clone(),
            owner_references: Some(vec![controller_owner_ref(cms)?]),
            ..ObjectMeta::default()
        },
        data: (!data.is_empty()).then_some(data),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    })
}

fn expand_bytes(value: &[u8], env: &HashMap<String, String>) -> Vec<u8> {
    if !value.contains(&b'$') {
        return value.to_vec();
    }
    match std::str::from_utf8(value) {
        Ok(s) => expand(s, mapping_for(env)).into_bytes(),
        Err(_) => value.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Bytes, ConfigMapSecretSpec, ConfigMapTemplate, TemplateMetadata};

    fn source(spec: ConfigMapSecretSpec) -> ConfigMapSecret {
        let mut cms = ConfigMapSecret::new("example", spec);
        cms.metadata.namespace = Some("default".to_string());
        cms.metadata.uid = Some("uid-1234".to_string());
        cms
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn target_name_defaults_to_source_name() {
        let cms = source(ConfigMapSecretSpec::default());
        assert_eq!(target_secret_name(&cms), "example");

        let mut named = cms.clone();
        named.spec.template.metadata.name = Some("custom".to_string());
        assert_eq!(target_secret_name(&named), "custom");

        named.spec.template.metadata.name = Some(String::new());
        assert_eq!(target_secret_name(&named), "example");
    }

    #[test]
    fn renders_expanded_data_and_metadata() {
        let cms = source(ConfigMapSecretSpec {
            template: ConfigMapTemplate {
                metadata: TemplateMetadata {
                    labels: Some([("foo".to_string(), "bar".to_string())].into()),
                    annotations: Some([("note".to_string(), "x".to_string())].into()),
                    ..TemplateMetadata::default()
                },
                data: Some(
                    [
                        ("greeting".to_string(), "hello $(WHO)".to_string()),
                        ("escaped".to_string(), "$$(WHO)".to_string()),
                    ]
                    .into(),
                ),
                binary_data: None,
            },
            ..ConfigMapSecretSpec::default()
        });

        let secret = render_secret(&cms, &env(&[("WHO", "world")])).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("example"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(secret.metadata.labels.as_ref().unwrap()["foo"], "bar");
        assert_eq!(secret.metadata.annotations.as_ref().unwrap()["note"], "x");
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));

        let data = secret.data.as_ref().unwrap();
        assert_eq!(data["greeting"].0, b"hello world");
        assert_eq!(data["escaped"].0, b"$(WHO)");
    }

    #[test]
    fn unresolved_references_stay_verbatim() {
        let cms = source(ConfigMapSecretSpec {
            template: ConfigMapTemplate {
                data: Some([("baz".to_string(), "baz: $(BAZ)".to_string())].into()),
                ..ConfigMapTemplate::default()
            },
            ..ConfigMapSecretSpec::default()
        });
        let secret = render_secret(&cms, &HashMap::new()).unwrap();
        assert_eq!(secret.data.as_ref().unwrap()["baz"].0, b"baz: $(BAZ)");
    }

    #[test]
    fn attaches_exactly_one_controller_owner() {
        let cms = source(ConfigMapSecretSpec::default());
        let secret = render_secret(&cms, &HashMap::new()).unwrap();
        let owners = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        let owner = &owners[0];
        assert_eq!(owner.api_version, "secrets.mz.com/v1alpha1");
        assert_eq!(owner.kind, "ConfigMapSecret");
        assert_eq!(owner.name, "example");
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn binary_values_without_operator_pass_through() {
        let raw = vec![0xff, 0xfe, 0x00, 0x01];
        let templated = b"user=$(USER)".to_vec();
        let cms = source(ConfigMapSecretSpec {
            template: ConfigMapTemplate {
                binary_data: Some(
                    [
                        ("raw".to_string(), Bytes(raw.clone())),
                        ("templated".to_string(), Bytes(templated)),
                    ]
                    .into(),
                ),
                ..ConfigMapTemplate::default()
            },
            ..ConfigMapSecretSpec::default()
        });

        let secret = render_secret(&cms, &env(&[("USER", "alice")])).unwrap();
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data["raw"].0, raw);
        assert_eq!(data["templated"].0, b"user=alice");
    }

    #[test]
    fn empty_template_renders_no_data() {
        let cms = source(ConfigMapSecretSpec::default());
        let secret = render_secret(&cms, &HashMap::new()).unwrap();
        assert!(secret.data.is_none());
    }

    #[test]
    fn missing_uid_is_an_internal_error() {
        let mut cms = source(ConfigMapSecretSpec::default());
        cms.metadata.uid = None;
        assert!(matches!(
            render_secret(&cms, &HashMap::new()),
            Err(Error::MissingObjectKey(".metadata.uid"))
        ));
    }
}
