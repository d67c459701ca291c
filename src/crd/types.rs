//! Supporting types shared by the Stratus CRDs

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-service entry in the control plane spec.
///
/// The template body is opaque to the sequencer: it is copied verbatim
/// into the child resource's spec, with cross-cutting defaults filled in
/// only where the template left them unset.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ServiceTemplate {
    /// Whether the service should run. Disabling deletes the child
    /// resource and clears the service's conditions.
    #[serde(default)]
    pub enabled: bool,

    /// Desired spec fragment for the child resource, copied verbatim
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub template: serde_json::Value,

    /// Endpoint exposure overrides for services with HTTP endpoints
    #[serde(default, rename = "override", skip_serializing_if = "ServiceOverride::is_empty")]
    pub override_: ServiceOverride,
}

impl ServiceTemplate {
    /// Construct an enabled template with the given spec fragment
    pub fn enabled_with(template: serde_json::Value) -> Self {
        Self {
            enabled: true,
            template,
            override_: ServiceOverride::default(),
        }
    }
}

/// Endpoint override entries keyed by endpoint name (e.g. `public`,
/// `internal`). The values are opaque override fragments merged into the
/// child spec once the underlying Services exist.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ServiceOverride {
    /// Endpoint-name to override-fragment mapping
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service: BTreeMap<String, serde_json::Value>,
}

impl ServiceOverride {
    /// Returns true when no override entries are present
    pub fn is_empty(&self) -> bool {
        self.service.is_empty()
    }
}
