//! Stratus - CRD-driven Kubernetes operator for control-plane orchestration
//!
//! Stratus deploys and manages a multi-service control plane from a single
//! parent custom resource. The parent spec maps service names to per-service
//! templates; a dependency-ordered sequencer turns that desired state into a
//! fleet of child custom resources and rolls their readiness up into one
//! aggregate condition.
//!
//! # Architecture
//!
//! - A `StratusControlPlane` declares which services run and with what
//!   template; each enabled service becomes one owned child resource.
//! - A `StratusVersion` resolves the container-image set for the target
//!   version and gates minor updates through an ordered set of phase
//!   conditions.
//! - Reconciliation is a strict sequence: services are visited in
//!   dependency order, and the first service that is not yet actionable
//!   ends the pass with a scheduled retry.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (StratusControlPlane, StratusVersion)
//! - [`conditions`] - Condition ledger for status reporting
//! - [`registry`] - Compiled-in service descriptor table
//! - [`graph`] - Service dependency graph and ordering validation
//! - [`store`] - Object store abstraction over the Kubernetes API
//! - [`sync`] - Child-resource synchronizer (create-or-patch)
//! - [`service`] - Generic per-service reconcile step
//! - [`controller`] - Reconciliation logic for both parent resources
//! - [`config`] - Operator configuration (image defaults, versions)
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod graph;
pub mod registry;
pub mod service;
pub mod store;
pub mod sync;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Stratus custom resources
pub const API_GROUP: &str = "stratus.dev";

/// API group for the child service custom resources
pub const SERVICES_API_GROUP: &str = "services.stratus.dev";

/// Label applied to exposed Services so endpoint readiness can be queried
pub const SERVICE_LABEL: &str = "stratus.dev/service";

/// Field manager name used for status patches
pub const FIELD_MANAGER: &str = "stratus-controller";
