//! StratusVersion Custom Resource Definition
//!
//! A StratusVersion is created alongside each control plane (same name,
//! same namespace) and resolves the concrete container image for every
//! service at the target version: per-version defaults come from operator
//! configuration, and spec-level custom images win over defaults. Its
//! conditions gate both initial deployment (Initialized) and the phases
//! of a minor update.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Conditions;

/// Condition gating the control-plane sequencer on resolved images
pub const VERSION_INITIALIZED_CONDITION: &str = "Initialized";

/// Condition present while a newer version is available than deployed
pub const UPDATE_AVAILABLE_CONDITION: &str = "UpdateAvailable";

/// Specification for a StratusVersion
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stratus.dev",
    version = "v1alpha1",
    kind = "StratusVersion",
    plural = "stratusversions",
    shortname = "sv",
    status = "StratusVersionStatus",
    namespaced,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetVersion"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.availableVersion"}"#,
    printcolumn = r#"{"name":"Deployed","type":"string","jsonPath":".status.deployedVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusVersionSpec {
    /// Version whose images should be deployed
    #[serde(default)]
    pub target_version: String,

    /// Per-service image overrides that win over the configured defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_container_images: BTreeMap<String, String>,
}

/// Status for a StratusVersion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusVersionStatus {
    /// Conditions: Initialized, the minor-update phases, UpdateAvailable
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,

    /// Version the running operator can deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_version: Option<String>,

    /// Resolved service-name to image mapping for the target version
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub container_images: BTreeMap<String, String>,

    /// Image defaults recorded per known version, so a target version
    /// older than the operator can still be resolved
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub container_image_defaults: BTreeMap<String, BTreeMap<String, String>>,

    /// Version whose deployment completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_version: Option<String>,

    /// Generation most recently observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl StratusVersion {
    /// Returns true once images for the target version are resolved
    pub fn is_initialized(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_true(VERSION_INITIALIZED_CONDITION))
            .unwrap_or(false)
    }

    /// Resolved image for a service at the target version, if any
    pub fn resolved_image(&self, service: &str) -> Option<&String> {
        self.status
            .as_ref()
            .and_then(|s| s.container_images.get(service))
    }

    /// Returns true while a minor update is in progress: a version was
    /// deployed and the target differs from it
    pub fn minor_update_in_progress(&self) -> bool {
        match self.status.as_ref().and_then(|s| s.deployed_version.as_ref()) {
            Some(deployed) => *deployed != self.spec.target_version,
            None => false,
        }
    }
}
