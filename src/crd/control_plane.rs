//! StratusControlPlane Custom Resource Definition
//!
//! The StratusControlPlane CRD is the single parent resource describing a
//! control plane deployment: which services run, their templates, and the
//! cross-cutting defaults (secret, storage class, node selector, database
//! instance) applied to every child that does not set its own.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ServiceTemplate;
use crate::conditions::{Conditions, READY};
use crate::registry::ServiceId;

/// Default name of the shared database instance children point at
pub const DEFAULT_DATABASE_INSTANCE: &str = "stratus";

/// Specification for a StratusControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stratus.dev",
    version = "v1alpha1",
    kind = "StratusControlPlane",
    plural = "stratuscontrolplanes",
    shortname = "scp",
    status = "StratusControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Deployed","type":"string","jsonPath":".status.deployedVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusControlPlaneSpec {
    /// Name of the secret holding service passwords, handed to every
    /// child that does not set its own
    pub secret: String,

    /// Default storage class for children that provision volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Default node selector applied to children that set none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Name of the database instance children connect to
    #[serde(default = "default_database_instance")]
    pub database_instance: String,

    /// Service-name to template mapping; services absent from the map
    /// are treated as disabled
    #[serde(default)]
    pub services: BTreeMap<String, ServiceTemplate>,
}

fn default_database_instance() -> String {
    DEFAULT_DATABASE_INSTANCE.to_string()
}

impl StratusControlPlaneSpec {
    /// Template for a service, if present in the spec
    pub fn service(&self, id: ServiceId) -> Option<&ServiceTemplate> {
        self.services.get(id.as_str())
    }

    /// Returns true if the service is present and enabled
    pub fn service_enabled(&self, id: ServiceId) -> bool {
        self.service(id).map(|t| t.enabled).unwrap_or(false)
    }

    /// Validate the specification.
    ///
    /// Service names must be known; dependency completeness is the
    /// admission layer's job and is deliberately not re-checked here.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.secret.is_empty() {
            return Err(crate::Error::validation("spec.secret must be set"));
        }
        for name in self.services.keys() {
            name.parse::<ServiceId>()?;
        }
        Ok(())
    }
}

/// Status for a StratusControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusControlPlaneStatus {
    /// Conditions representing control plane state, one per managed
    /// service plus the aggregate Ready condition
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,

    /// Container image deployed per service, recorded only once the
    /// service reports ready at its current generation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub container_images: BTreeMap<String, String>,

    /// Version that completed a full deployment pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_version: Option<String>,

    /// Generation most recently observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl StratusControlPlane {
    /// Returns true when the aggregate Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_true(READY))
            .unwrap_or(false)
    }

    /// Deployed container image for a service, if recorded
    pub fn deployed_image(&self, id: ServiceId) -> Option<&String> {
        self.status
            .as_ref()
            .and_then(|s| s.container_images.get(id.as_str()))
    }
}
