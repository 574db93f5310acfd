//! # ConfigMapSecret API types
//!
//! The `secrets.mz.com/v1alpha1` API group. A `ConfigMapSecret` holds
//! configuration data with embedded secrets: a Secret template whose
//! `$(VAR_NAME)` references are expanded from inline variables and from
//! referenced Secrets and ConfigMaps.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// API group of the ConfigMapSecret kind.
pub const GROUP: &str = "secrets.mz.com";
/// API version within [`GROUP`].
pub const VERSION: &str = "v1alpha1";

/// Condition type reported when the target secret could not be rendered.
pub const RENDER_FAILURE_CONDITION: &str = "RenderFailure";

/// Desired state of a ConfigMapSecret.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.mz.com",
    version = "v1alpha1",
    kind = "ConfigMapSecret",
    plural = "configmapsecrets",
    namespaced,
    status = "ConfigMapSecretStatus",
    printcolumn = r#"{"name":"RenderFailure", "type":"string", "jsonPath":".status.conditions[?(@.type==\"RenderFailure\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSecretSpec {
    /// Template that describes the secret that will be rendered.
    ///
    /// Variable references `$(VAR_NAME)` in template data are expanded using
    /// the ConfigMapSecret's variables. If a variable cannot be resolved, the
    /// reference in the input data is left unchanged. The `$(VAR_NAME)`
    /// syntax can be escaped with a double `$$`, ie: `$$(VAR_NAME)`. Escaped
    /// references are never expanded, regardless of whether the variable
    /// exists or not.
    #[serde(default)]
    pub template: ConfigMapTemplate,

    /// List of sources to populate template variables from.
    ///
    /// Keys defined in a source must consist of alphanumeric characters or
    /// `_`, and must not start with a digit. When a key exists in multiple
    /// sources, the value from the last source takes precedence. Values
    /// defined by `vars` with a duplicate name take precedence over all
    /// sources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars_from: Vec<VarsFromSource>,

    /// List of template variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<TemplateVariable>,
}

/// Secret template: metadata plus UTF-8 and binary payloads.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapTemplate {
    /// Metadata of the rendered secret.
    #[serde(default)]
    pub metadata: TemplateMetadata,

    /// Data contains the configuration data.
    ///
    /// Each key must consist of alphanumeric characters, `-`, `_` or `.`.
    /// Values with non-UTF-8 byte sequences must use the `binaryData` field.
    /// The keys stored in `data` must not overlap with the keys in the
    /// `binaryData` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,

    /// BinaryData contains the binary configuration data.
    ///
    /// Each key must consist of alphanumeric characters, `-`, `_` or `.`.
    /// The keys stored in `binaryData` must not overlap with the keys in the
    /// `data` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data: Option<BTreeMap<String, Bytes>>,
}

/// Subset of object metadata that a template may set on the rendered secret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Name of the rendered secret. Defaults to the ConfigMapSecret's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Labels copied onto the rendered secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations copied onto the rendered secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A source of template variables: a whole Secret or a whole ConfigMap.
///
/// Exactly one of `secretRef` and `configMapRef` must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarsFromSource {
    /// Optional prefix prepended to every key of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// The Secret to select from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretVarsSource>,
    /// The ConfigMap to select from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapVarsSource>,
}

/// Selects all keys of a Secret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretVarsSource {
    /// Name of the referenced Secret.
    pub name: String,
    /// Whether the Secret must exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Selects all keys of a ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVarsSource {
    /// Name of the referenced ConfigMap.
    pub name: String,
    /// Whether the ConfigMap must exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// A single template variable.
///
/// Exactly one of `value`, `secretValue`, and `configMapValue` should be
/// set; a non-empty literal `value` takes precedence over the selectors.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    /// Name of the template variable.
    pub name: String,

    /// Literal value. Variable references `$(VAR_NAME)` are expanded using
    /// the previously defined variables of the ConfigMapSecret. Defaults to
    /// `""`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Selects a value by its key in a Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_value: Option<SecretKeySelector>,

    /// Selects a value by its key in a ConfigMap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_value: Option<ConfigMapKeySelector>,
}

/// Selects a single key of a Secret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Name of the referenced Secret.
    pub name: String,
    /// Key to select.
    pub key: String,
    /// Whether the Secret and the key must exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Selects a single key of a ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeySelector {
    /// Name of the referenced ConfigMap.
    pub name: String,
    /// Key to select.
    pub key: String,
    /// Whether the ConfigMap and the key must exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Observed state of a ConfigMapSecret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSecretStatus {
    /// The generation observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Latest available observations of the ConfigMapSecret's state,
    /// unique by condition type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConfigMapSecretCondition>,
}

/// A status condition of a ConfigMapSecret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSecretCondition {
    /// Type of the condition.
    pub r#type: String,
    /// Status of the condition: `True`, `False`, or `Unknown`.
    pub status: String,
    /// The last time the condition was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// The reason for the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// A human readable message with details about the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Binary payload serialized as a base64 string, wire-compatible with the
/// Kubernetes `byte` format.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes(pub Vec<u8>);

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes)
            .map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Bytes {
    fn schema_name() -> String {
        "Bytes".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        Schema::Object(SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            format: Some("byte".to_string()),
            ..SchemaObject::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_manifest_json() {
        let spec: ConfigMapSecretSpec = serde_json::from_value(serde_json::json!({
            "template": {
                "metadata": {
                    "name": "rendered",
                    "labels": {"app": "demo"}
                },
                "data": {"config.yaml": "user: $(USER)"},
                "binaryData": {"blob": "AQID"}
            },
            "varsFrom": [
                {"prefix": "APP_", "configMapRef": {"name": "settings", "optional": true}}
            ],
            "vars": [
                {"name": "USER", "secretValue": {"name": "creds", "key": "user"}}
            ]
        }))
        .unwrap();

        assert_eq!(spec.template.metadata.name.as_deref(), Some("rendered"));
        let binary = spec.template.binary_data.as_ref().unwrap();
        assert_eq!(binary["blob"], Bytes(vec![1, 2, 3]));
        assert_eq!(spec.vars_from[0].prefix.as_deref(), Some("APP_"));
        assert_eq!(spec.vars_from[0].config_map_ref.as_ref().unwrap().optional, Some(true));
        assert_eq!(spec.vars[0].secret_value.as_ref().unwrap().key, "user");
        assert!(spec.vars[0].value.is_none());
    }

    #[test]
    fn empty_spec_uses_defaults() {
        let spec: ConfigMapSecretSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec, ConfigMapSecretSpec::default());
        assert!(spec.template.data.is_none());
        assert!(spec.vars_from.is_empty());
        assert!(spec.vars.is_empty());
    }

    #[test]
    fn bytes_round_trips_through_base64() {
        let json = serde_json::to_string(&Bytes(b"hello".to_vec())).unwrap();
        assert_eq!(json, "\"aGVsbG8=\"");
        let back: Bytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, b"hello");
    }
}
