//! # Variable resolution
//!
//! Builds the `name -> value` environment for a single reconcile by pulling
//! every `varsFrom` source in order and then every `vars` entry, the same
//! way the kubelet assembles container environment variables. Referenced
//! objects are fetched once per reconcile through a local cache.

use crate::controller::expansion::{expand, mapping_for};
use crate::controller::reconciler::{object_reference, Context, Error};
use crate::crd::{
    ConfigMapKeySelector, ConfigMapSecret, ConfigMapVarsSource, SecretKeySelector,
    SecretVarsSource,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, ResourceExt};
use kube_runtime::events::{Event, EventType};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Returns the Secret and ConfigMap names referenced by the spec, for the
/// reference index.
pub fn var_refs(cms: &ConfigMapSecret) -> (HashSet<String>, HashSet<String>) {
    let mut secrets = HashSet::new();
    let mut config_maps = HashSet::new();
    for source in &cms.spec.vars_from {
        if let Some(r) = &source.secret_ref {
            secrets.insert(r.name.clone());
        }
        if let Some(r) = &source.config_map_ref {
            config_maps.insert(r.name.clone());
        }
    }
    for var in &cms.spec.vars {
        if let Some(r) = &var.secret_value {
            secrets.insert(r.name.clone());
        }
        if let Some(r) = &var.config_map_value {
            config_maps.insert(r.name.clone());
        }
    }
    (secrets, config_maps)
}

/// Checks `key` against the variable-name rule (`[A-Za-z_][A-Za-z0-9_]*`)
/// and returns it with `prefix` applied. The prefixed name is what gets
/// bound, and what invalid-key warnings report.
fn valid_prefixed_key(prefix: Option<&str>, key: &str) -> (String, bool) {
    let valid = is_valid_var_name(key);
    let key = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}{key}"),
        _ => key.to_string(),
    };
    (key, valid)
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves the full variable environment for `cms`.
///
/// Missing required dependencies and keys surface as configuration errors;
/// skipped invalid keys produce one warning event per offending `varsFrom`
/// entry.
pub async fn make_variables(
    ctx: &Context,
    cms: &ConfigMapSecret,
) -> Result<HashMap<String, String>, Error> {
    let namespace = cms
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let mut cache = DepCache::new(ctx, &namespace);
    let mut env: HashMap<String, String> = HashMap::new();

    for source in &cms.spec.vars_from {
        let prefix = source.prefix.as_deref();
        let (kind, name, values, mut invalid_keys) = if let Some(r) = &source.secret_ref {
            let (values, invalid) = cache.secret_values(prefix, r).await?;
            ("Secret", r.name.clone(), values, invalid)
        } else if let Some(r) = &source.config_map_ref {
            let (values, invalid) = cache.config_map_values(prefix, r).await?;
            ("ConfigMap", r.name.clone(), values, invalid)
        } else {
            continue;
        };
        env.extend(values);
        if !invalid_keys.is_empty() {
            invalid_keys.sort();
            publish_invalid_keys_event(ctx, cms, kind, &namespace, &name, &invalid_keys).await;
        }
    }

    for var in &cms.spec.vars {
        let literal = var.value.as_deref().unwrap_or_default();
        let mut found = true;
        let value = if !literal.is_empty() {
            expand(literal, mapping_for(&env))
        } else if let Some(r) = &var.secret_value {
            match cache.secret_value(r).await? {
                Some(v) => v,
                None => {
                    found = false;
                    String::new()
                }
            }
        } else if let Some(r) = &var.config_map_value {
            match cache.config_map_value(r).await? {
                Some(v) => v,
                None => {
                    found = false;
                    String::new()
                }
            }
        } else {
            String::new()
        };
        if !found {
            continue;
        }
        env.insert(var.name.clone(), value);
    }

    Ok(env)
}

async fn publish_invalid_keys_event(
    ctx: &Context,
    cms: &ConfigMapSecret,
    kind: &str,
    namespace: &str,
    name: &str,
    invalid_keys: &[String],
) {
    let note = format!(
        "Keys [{}] from the VarsFrom {} {}/{} were skipped since they are considered invalid template variable names.",
        invalid_keys.join(", "),
        kind,
        namespace,
        name,
    );
    let event = Event {
        type_: EventType::Warning,
        reason: "InvalidTemplateVariableNames".to_string(),
        note: Some(note),
        action: "Render".to_string(),
        secondary: None,
    };
    if let Err(err) = ctx.recorder.publish(&event, &object_reference(cms)).await {
        warn!(error = %err, "Unable to publish invalid-keys event");
    }
}

/// Per-reconcile cache of fetched dependencies. Never shared: every
/// reconcile reads fresh cluster state.
struct DepCache<'a> {
    ctx: &'a Context,
    namespace: &'a str,
    secrets: HashMap<String, Secret>,
    config_maps: HashMap<String, ConfigMap>,
}

impl<'a> DepCache<'a> {
    fn new(ctx: &'a Context, namespace: &'a str) -> Self {
        Self {
            ctx,
            namespace,
            secrets: HashMap::new(),
            config_maps: HashMap::new(),
        }
    }

    /// Fetches a Secret through the cache. Returns `None` when the Secret is
    /// absent and the reference is optional.
    async fn secret(&mut self, name: &str, optional: Option<bool>) -> Result<Option<&Secret>, Error> {
        if !self.secrets.contains_key(name) {
            let api: Api<Secret> = Api::namespaced(self.ctx.client.clone(), self.namespace);
            match api.get(name).await {
                Ok(secret) => {
                    self.secrets.insert(name.to_string(), secret);
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    if optional.unwrap_or(false) {
                        return Ok(None);
                    }
                    return Err(Error::Config(format!(
                        "Secret {}/{} not found",
                        self.namespace, name
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.secrets.get(name))
    }

    async fn config_map(
        &mut self,
        name: &str,
        optional: Option<bool>,
    ) -> Result<Option<&ConfigMap>, Error> {
        if !self.config_maps.contains_key(name) {
            let api: Api<ConfigMap> = Api::namespaced(self.ctx.client.clone(), self.namespace);
            match api.get(name).await {
                Ok(config_map) => {
                    self.config_maps.insert(name.to_string(), config_map);
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    if optional.unwrap_or(false) {
                        return Ok(None);
                    }
                    return Err(Error::Config(format!(
                        "ConfigMap {}/{} not found",
                        self.namespace, name
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.config_maps.get(name))
    }

    async fn secret_values(
        &mut self,
        prefix: Option<&str>,
        r: &SecretVarsSource,
    ) -> Result<(HashMap<String, String>, Vec<String>), Error> {
        let Some(secret) = self.secret(&r.name, r.optional).await? else {
            return Ok((HashMap::new(), Vec::new()));
        };
        let mut values = HashMap::new();
        let mut invalid_keys = Vec::new();
        for (k, v) in secret.data.iter().flatten() {
            let (key, valid) = valid_prefixed_key(prefix, k);
            if valid {
                values.insert(key, String::from_utf8_lossy(&v.0).into_owned());
            } else {
                invalid_keys.push(key);
            }
        }
        Ok((values, invalid_keys))
    }

    async fn config_map_values(
        &mut self,
        prefix: Option<&str>,
        r: &ConfigMapVarsSource,
    ) -> Result<(HashMap<String, String>, Vec<String>), Error> {
        let Some(config_map) = self.config_map(&r.name, r.optional).await? else {
            return Ok((HashMap::new(), Vec::new()));
        };
        let mut values = HashMap::new();
        let mut invalid_keys = Vec::new();
        for (k, v) in config_map.data.iter().flatten() {
            let (key, valid) = valid_prefixed_key(prefix, k);
            if valid {
                values.insert(key, v.clone());
            } else {
                invalid_keys.push(key);
            }
        }
        for (k, v) in config_map.binary_data.iter().flatten() {
            let (key, valid) = valid_prefixed_key(prefix, k);
            if valid {
                values.insert(key, String::from_utf8_lossy(&v.0).into_owned());
            } else {
                invalid_keys.push(key);
            }
        }
        Ok((values, invalid_keys))
    }

    async fn secret_value(&mut self, r: &SecretKeySelector) -> Result<Option<String>, Error> {
        let namespace = self.namespace;
        let Some(secret) = self
            .secret(&r.name, r.optional)
            .await?
        else {
            return Ok(None);
        };
        if let Some(value) = secret.data.as_ref().and_then(|d| d.get(&r.key)) {
            return Ok(Some(String::from_utf8_lossy(&value.0).into_owned()));
        }
        if r.optional.unwrap_or(false) {
            return Ok(None);
        }
        Err(Error::Config(format!(
            "Couldn't find key {} in Secret {}/{}",
            r.key, namespace, r.name
        )))
    }

    async fn config_map_value(&mut self, r: &ConfigMapKeySelector) -> Result<Option<String>, Error> {
        let namespace = self.namespace;
        let Some(config_map) = self.config_map(&r.name, r.optional).await? else {
            return Ok(None);
        };
        if let Some(value) = config_map.data.as_ref().and_then(|d| d.get(&r.key)) {
            return Ok(Some(value.clone()));
        }
        if let Some(value) = config_map.binary_data.as_ref().and_then(|d| d.get(&r.key)) {
            return Ok(Some(String::from_utf8_lossy(&value.0).into_owned()));
        }
        if r.optional.unwrap_or(false) {
            return Ok(None);
        }
        Err(Error::Config(format!(
            "Couldn't find key {} in ConfigMap {}/{}",
            r.key, namespace, r.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigMapSecretSpec, TemplateVariable, VarsFromSource};

    fn cms_with_spec(spec: ConfigMapSecretSpec) -> ConfigMapSecret {
        let mut cms = ConfigMapSecret::new("example", spec);
        cms.metadata.namespace = Some("default".to_string());
        cms
    }

    #[test]
    fn var_refs_collects_both_kinds() {
        let cms = cms_with_spec(ConfigMapSecretSpec {
            vars_from: vec![
                VarsFromSource {
                    secret_ref: Some(SecretVarsSource {
                        name: "from-secret".to_string(),
                        optional: None,
                    }),
                    ..VarsFromSource::default()
                },
                VarsFromSource {
                    config_map_ref: Some(ConfigMapVarsSource {
                        name: "from-cm".to_string(),
                        optional: None,
                    }),
                    ..VarsFromSource::default()
                },
            ],
            vars: vec![
                TemplateVariable {
                    name: "A".to_string(),
                    secret_value: Some(SecretKeySelector {
                        name: "keyed-secret".to_string(),
                        key: "k".to_string(),
                        optional: None,
                    }),
                    ..TemplateVariable::default()
                },
                TemplateVariable {
                    name: "B".to_string(),
                    config_map_value: Some(ConfigMapKeySelector {
                        name: "keyed-cm".to_string(),
                        key: "k".to_string(),
                        optional: None,
                    }),
                    ..TemplateVariable::default()
                },
                TemplateVariable {
                    name: "C".to_string(),
                    value: Some("literal".to_string()),
                    ..TemplateVariable::default()
                },
            ],
            ..ConfigMapSecretSpec::default()
        });

        let (secrets, config_maps) = var_refs(&cms);
        let mut secrets: Vec<_> = secrets.into_iter().collect();
        secrets.sort();
        let mut config_maps: Vec<_> = config_maps.into_iter().collect();
        config_maps.sort();
        assert_eq!(secrets, ["from-secret", "keyed-secret"]);
        assert_eq!(config_maps, ["from-cm", "keyed-cm"]);
    }

    #[test]
    fn var_refs_dedupes_names() {
        let cms = cms_with_spec(ConfigMapSecretSpec {
            vars_from: vec![VarsFromSource {
                secret_ref: Some(SecretVarsSource {
                    name: "shared".to_string(),
                    optional: None,
                }),
                ..VarsFromSource::default()
            }],
            vars: vec![TemplateVariable {
                name: "A".to_string(),
                secret_value: Some(SecretKeySelector {
                    name: "shared".to_string(),
                    key: "k".to_string(),
                    optional: None,
                }),
                ..TemplateVariable::default()
            }],
            ..ConfigMapSecretSpec::default()
        });

        let (secrets, config_maps) = var_refs(&cms);
        assert_eq!(secrets.len(), 1);
        assert!(config_maps.is_empty());
    }

    #[test]
    fn prefixed_keys_are_validated() {
        assert_eq!(
            valid_prefixed_key(Some("TEST_"), "FOO"),
            ("TEST_FOO".to_string(), true)
        );
        assert_eq!(
            valid_prefixed_key(Some("TEST_"), "1bad"),
            ("TEST_1bad".to_string(), false)
        );
        assert_eq!(valid_prefixed_key(None, "1bad"), ("1bad".to_string(), false));
        assert_eq!(
            valid_prefixed_key(None, "with-dash"),
            ("with-dash".to_string(), false)
        );
        assert_eq!(valid_prefixed_key(None, ""), (String::new(), false));
        assert_eq!(valid_prefixed_key(None, "_ok"), ("_ok".to_string(), true));
    }
}
