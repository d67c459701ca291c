//! Custom Resource Definitions for Stratus
//!
//! Two parent resources exist: [`StratusControlPlane`] declares the
//! desired set of services, [`StratusVersion`] resolves container images
//! for a target version and tracks minor-update progress. Child service
//! resources are dynamic objects owned by the control plane; their kinds
//! live in the [`crate::registry`] table.

mod control_plane;
mod types;
mod version;

pub use control_plane::{StratusControlPlane, StratusControlPlaneSpec, StratusControlPlaneStatus};
pub use types::{ServiceOverride, ServiceTemplate};
pub use version::{
    StratusVersion, StratusVersionSpec, StratusVersionStatus, UPDATE_AVAILABLE_CONDITION,
    VERSION_INITIALIZED_CONDITION,
};
