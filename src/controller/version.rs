//! StratusVersion controller implementation
//!
//! Resolves the container-image set for the target version (operator
//! defaults overridden by spec-level custom images) and, when the target
//! differs from what is deployed, walks the minor-update phases: each
//! component phase opens only once the previous phases are complete and
//! the control plane reports the new image for that component at
//! readiness. The control-plane sequencer consumes these phase
//! conditions to decide what it may reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::conditions::{Condition, ConditionReason, ConditionSeverity};
use crate::config::OperatorConfig;
use crate::crd::{
    StratusControlPlane, StratusVersion, StratusVersionStatus, UPDATE_AVAILABLE_CONDITION,
    VERSION_INITIALIZED_CONDITION,
};
use crate::registry::ServiceId;
use crate::store::{ObjectStore, FINALIZER};
use crate::{Error, Result};

/// Condition for the network phase of a minor update
pub(crate) const MINOR_UPDATE_NETWORK: &str = "MinorUpdateNetwork";
/// Condition for the broker phase of a minor update
pub(crate) const MINOR_UPDATE_BROKER: &str = "MinorUpdateBroker";
/// Condition for the database phase of a minor update
pub(crate) const MINOR_UPDATE_DATABASE: &str = "MinorUpdateDatabase";
/// Condition for the cache phase of a minor update
pub(crate) const MINOR_UPDATE_CACHE: &str = "MinorUpdateCache";
/// Condition for the identity phase of a minor update
pub(crate) const MINOR_UPDATE_IDENTITY: &str = "MinorUpdateIdentity";
/// Condition for the final whole-control-plane phase of a minor update
pub(crate) const MINOR_UPDATE_CONTROL_PLANE: &str = "MinorUpdateControlPlane";

/// Component phases of a minor update, walked strictly in order before
/// the whole control plane is released
pub(crate) const MINOR_UPDATE_PHASES: &[(ServiceId, &str)] = &[
    (ServiceId::Network, MINOR_UPDATE_NETWORK),
    (ServiceId::Broker, MINOR_UPDATE_BROKER),
    (ServiceId::Database, MINOR_UPDATE_DATABASE),
    (ServiceId::Cache, MINOR_UPDATE_CACHE),
    (ServiceId::Identity, MINOR_UPDATE_IDENTITY),
];

const VERSION_INIT_MESSAGE: &str = "Version initialization started";
const MINOR_UPDATE_INIT_MESSAGE: &str = "Minor update pending";

/// Delay before re-checking an unresolvable target version
const UNKNOWN_TARGET_REQUEUE: Duration = Duration::from_secs(30);

/// Controller context for StratusVersion reconciliation
pub struct VersionContext {
    /// Store holding all resources the controller reads and writes
    pub store: Arc<dyn ObjectStore>,
    /// Operator configuration (available version, image defaults)
    pub config: OperatorConfig,
}

/// Reconcile a StratusVersion resource
#[instrument(skip(version, ctx), fields(version = %version.name_any()))]
pub async fn reconcile(version: Arc<StratusVersion>, ctx: Arc<VersionContext>) -> Result<Action> {
    let name = version.name_any();
    let namespace = version
        .namespace()
        .ok_or_else(|| Error::validation("version instance has no namespace"))?;
    debug!("reconciling version");

    // Deletion is released by the control plane's delete path, which
    // strips our finalizer.
    if version.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let mut version = (*version).clone();
    let generation = version.metadata.generation;
    let target = version.spec.target_version.clone();

    let status = version.status.get_or_insert_with(Default::default);
    let is_new = status.conditions.is_empty();
    let saved = status.conditions.clone();

    let mut defaults = vec![Condition::unknown(
        VERSION_INITIALIZED_CONDITION,
        VERSION_INIT_MESSAGE,
    )];
    // Minor-update conditions only exist while a deployed version lags
    // the target.
    let minor_update = status
        .deployed_version
        .as_ref()
        .is_some_and(|deployed| *deployed != target);
    if minor_update {
        for (_, condition) in MINOR_UPDATE_PHASES {
            defaults.push(Condition::unknown(*condition, MINOR_UPDATE_INIT_MESSAGE));
        }
        defaults.push(Condition::unknown(
            MINOR_UPDATE_CONTROL_PLANE,
            MINOR_UPDATE_INIT_MESSAGE,
        ));
    }
    status.conditions.init(&defaults);
    status.observed_generation = generation;

    if is_new {
        let mut finalizers = version.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
            ctx.store
                .set_version_finalizers(&namespace, &name, &finalizers)
                .await?;
            version.metadata.finalizers = Some(finalizers);
        }
        // Register overall status immediately for early feedback.
        super::rollup_ready(
            &mut version
                .status
                .get_or_insert_with(Default::default)
                .conditions,
            &saved,
        );
        let status = version.status.get_or_insert_with(Default::default);
        ctx.store
            .patch_version_status(&namespace, &name, status)
            .await?;
        return Ok(Action::await_change());
    }

    let outcome = reconcile_inner(&ctx, &mut version, &namespace, &name).await;

    let status = version.status.get_or_insert_with(Default::default);
    super::rollup_ready(&mut status.conditions, &saved);
    let patched = ctx
        .store
        .patch_version_status(&namespace, &name, status)
        .await;

    match outcome {
        Ok(action) => {
            patched?;
            Ok(action)
        }
        Err(e) => {
            if let Err(patch_err) = patched {
                debug!(error = %patch_err, "failed to patch status after pass error");
            }
            Err(e)
        }
    }
}

async fn reconcile_inner(
    ctx: &VersionContext,
    version: &mut StratusVersion,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let target = version.spec.target_version.clone();
    let custom = version.spec.custom_container_images.clone();
    let status = version.status.get_or_insert_with(Default::default);

    status.conditions.mark_false(
        VERSION_INITIALIZED_CONDITION,
        ConditionReason::Requested,
        ConditionSeverity::Info,
        "resolving container images",
    );

    status.available_version = Some(ctx.config.available_version.clone());
    status.container_image_defaults.insert(
        ctx.config.available_version.clone(),
        ctx.config.image_defaults.clone(),
    );

    let Some(defaults) = status.container_image_defaults.get(&target) else {
        info!(target = %target, "target version not found in image defaults");
        return Ok(Action::requeue(UNKNOWN_TARGET_REQUEUE));
    };
    status.container_images = resolve_images(defaults, &custom);
    status
        .conditions
        .mark_true(VERSION_INITIALIZED_CONDITION, "container images resolved");

    let Some(control_plane) = ctx.store.get_control_plane(namespace, name).await? else {
        debug!("control plane not found, nothing to track");
        return Ok(Action::await_change());
    };

    // Green field: nothing to track until the control plane completes
    // its first full deployment pass.
    let cp_deployed = control_plane
        .status
        .as_ref()
        .and_then(|s| s.deployed_version.clone());
    if cp_deployed.is_none() {
        debug!("waiting for the control plane to be deployed");
        return Ok(Action::await_change());
    }

    let minor_update = status
        .deployed_version
        .as_ref()
        .is_some_and(|deployed| *deployed != target);
    if minor_update {
        for (service, condition) in MINOR_UPDATE_PHASES {
            let phase_complete = !control_plane.spec.service_enabled(*service)
                || (images_match(&control_plane, status, *service)
                    && control_plane
                        .status
                        .as_ref()
                        .map(|s| s.conditions.is_true(service.condition_type()))
                        .unwrap_or(false));
            if !phase_complete {
                info!(service = %service, "minor update phase in progress");
                status.conditions.mark_false(
                    condition,
                    ConditionReason::Requested,
                    ConditionSeverity::Info,
                    format!("minor update of {service} in progress"),
                );
                return Ok(Action::await_change());
            }
            status
                .conditions
                .mark_true(condition, format!("minor update of {service} complete"));
        }

        if !control_plane.is_ready() {
            info!("minor update of the control plane in progress");
            status.conditions.mark_false(
                MINOR_UPDATE_CONTROL_PLANE,
                ConditionReason::Requested,
                ConditionSeverity::Info,
                "minor update of the control plane in progress",
            );
            return Ok(Action::await_change());
        }
        let mismatched = mismatched_services(&control_plane, status);
        if !mismatched.is_empty() {
            status.conditions.mark_false(
                MINOR_UPDATE_CONTROL_PLANE,
                ConditionReason::Requested,
                ConditionSeverity::Info,
                format!(
                    "control plane images do not match the target version for: {}",
                    mismatched.join(", ")
                ),
            );
            return Ok(Action::await_change());
        }
        status.conditions.mark_true(
            MINOR_UPDATE_CONTROL_PLANE,
            "minor update of the control plane complete",
        );
        info!("minor update of the control plane complete");
    }

    if control_plane.is_ready() {
        if status.deployed_version.as_deref() != Some(target.as_str()) {
            info!(version = %target, "recording deployed version");
        }
        status.deployed_version = Some(target.clone());
    }

    match (&status.deployed_version, &status.available_version) {
        (Some(deployed), Some(available)) if deployed != available => {
            status.conditions.set(Condition::true_(
                UPDATE_AVAILABLE_CONDITION,
                format!("version {available} is available"),
            ));
        }
        _ => status.conditions.remove(UPDATE_AVAILABLE_CONDITION),
    }

    Ok(Action::await_change())
}

/// Resolve the image set for a version: spec-level custom images win
/// over the configured defaults
fn resolve_images(
    defaults: &BTreeMap<String, String>,
    custom: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut images = defaults.clone();
    for (service, image) in custom {
        images.insert(service.clone(), image.clone());
    }
    images
}

/// Whether the control plane reports the version's image for a service.
///
/// Only meaningful for enabled services; callers gate on enablement.
fn images_match(
    control_plane: &StratusControlPlane,
    status: &StratusVersionStatus,
    service: ServiceId,
) -> bool {
    let deployed = control_plane.deployed_image(service);
    let desired = status.container_images.get(service.as_str());
    match (deployed, desired) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Enabled services whose deployed image does not match the target
fn mismatched_services(
    control_plane: &StratusControlPlane,
    status: &StratusVersionStatus,
) -> Vec<String> {
    crate::registry::SERVICES
        .iter()
        .filter(|d| control_plane.spec.service_enabled(d.id))
        .filter(|d| !images_match(control_plane, status, d.id))
        .map(|d| d.id.to_string())
        .collect()
}

/// Error policy for the version controller
pub fn error_policy(version: Arc<StratusVersion>, error: &Error, _ctx: Arc<VersionContext>) -> Action {
    if error.is_conflict() {
        debug!(version = %version.name_any(), "conflict, pass will be retried");
    } else {
        error!(
            ?error,
            version = %version.name_any(),
            "reconciliation failed"
        );
    }
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{ConditionStatus, READY};
    use crate::crd::StratusControlPlaneStatus;
    use crate::store::MockObjectStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn test_config(images: &[(&str, &str)]) -> OperatorConfig {
        OperatorConfig {
            available_version: "1.1.0".into(),
            image_defaults: images
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn version(target: &str) -> StratusVersion {
        let mut v = StratusVersion::new(
            "main",
            serde_json::from_value(json!({"targetVersion": target})).unwrap(),
        );
        v.metadata.namespace = Some("osp".into());
        v.metadata.uid = Some("uid-v".into());
        v.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        // Non-empty ledger: skip the first-contact early exit.
        let mut status = StratusVersionStatus::default();
        status
            .conditions
            .mark_unknown(VERSION_INITIALIZED_CONDITION, ConditionReason::Init, VERSION_INIT_MESSAGE);
        v.status = Some(status);
        v
    }

    fn control_plane(
        services: &[(&str, bool)],
        images: &[(&str, &str)],
        ready: bool,
        deployed: Option<&str>,
    ) -> StratusControlPlane {
        let service_map: serde_json::Map<String, serde_json::Value> = services
            .iter()
            .map(|(name, enabled)| (name.to_string(), json!({"enabled": enabled})))
            .collect();
        let spec = serde_json::from_value(json!({
            "secret": "osp-secret",
            "services": service_map,
        }))
        .unwrap();
        let mut cp = StratusControlPlane::new("main", spec);
        cp.metadata.namespace = Some("osp".into());

        let mut status = StratusControlPlaneStatus::default();
        for (service, image) in images {
            status
                .container_images
                .insert(service.to_string(), image.to_string());
        }
        for (service, enabled) in services {
            if *enabled {
                let id: ServiceId = service.parse().unwrap();
                if ready {
                    status
                        .conditions
                        .mark_true(id.condition_type(), "setup complete");
                }
            }
        }
        if ready {
            status.conditions.mark_true(READY, "Setup complete");
        }
        status.deployed_version = deployed.map(String::from);
        cp.status = Some(status);
        cp
    }

    #[derive(Default)]
    struct StatusCapture(Mutex<Vec<StratusVersionStatus>>);

    impl StatusCapture {
        fn last(&self) -> StratusVersionStatus {
            self.0.lock().unwrap().last().cloned().expect("status patched")
        }
    }

    fn capture_status(store: &mut MockObjectStore) -> Arc<StatusCapture> {
        let capture = Arc::new(StatusCapture::default());
        let sink = Arc::clone(&capture);
        store
            .expect_patch_version_status()
            .returning(move |_, _, status| {
                sink.0.lock().unwrap().push(status.clone());
                Ok(())
            });
        capture
    }

    fn context(store: MockObjectStore, config: OperatorConfig) -> Arc<VersionContext> {
        Arc::new(VersionContext {
            store: Arc::new(store),
            config,
        })
    }

    #[tokio::test]
    async fn resolves_images_with_custom_overrides_winning() {
        let mut store = MockObjectStore::new();
        store
            .expect_get_control_plane()
            .returning(|_, _| Ok(Some(control_plane(&[], &[], false, None))));
        let capture = capture_status(&mut store);

        let mut v = version("1.1.0");
        v.spec
            .custom_container_images
            .insert("broker".into(), "registry.example/custom-broker:pinned".into());

        reconcile(
            Arc::new(v),
            context(
                store,
                test_config(&[
                    ("broker", "registry.example/broker:1.1.0"),
                    ("identity", "registry.example/identity:1.1.0"),
                ]),
            ),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert!(status.conditions.is_true(VERSION_INITIALIZED_CONDITION));
        assert_eq!(
            status.container_images.get("broker").unwrap(),
            "registry.example/custom-broker:pinned"
        );
        assert_eq!(
            status.container_images.get("identity").unwrap(),
            "registry.example/identity:1.1.0"
        );
        assert_eq!(status.available_version.as_deref(), Some("1.1.0"));
    }

    #[tokio::test]
    async fn unknown_target_version_is_not_initialized() {
        let mut store = MockObjectStore::new();
        let capture = capture_status(&mut store);

        let action = reconcile(
            Arc::new(version("9.9.9")),
            context(store, test_config(&[("broker", "registry.example/broker:1.1.0")])),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(UNKNOWN_TARGET_REQUEUE));
        let status = capture.last();
        assert_eq!(
            status.conditions.get(VERSION_INITIALIZED_CONDITION).unwrap().status,
            ConditionStatus::False
        );
        assert!(status.container_images.is_empty());
    }

    #[tokio::test]
    async fn deployed_version_recorded_once_control_plane_is_ready() {
        let mut store = MockObjectStore::new();
        store.expect_get_control_plane().returning(|_, _| {
            Ok(Some(control_plane(
                &[("broker", true)],
                &[("broker", "registry.example/broker:1.1.0")],
                true,
                Some("1.1.0"),
            )))
        });
        let capture = capture_status(&mut store);

        reconcile(
            Arc::new(version("1.1.0")),
            context(store, test_config(&[("broker", "registry.example/broker:1.1.0")])),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert_eq!(status.deployed_version.as_deref(), Some("1.1.0"));
        // deployed == available: no update advertised
        assert!(status.conditions.get(UPDATE_AVAILABLE_CONDITION).is_none());
    }

    #[tokio::test]
    async fn greenfield_waits_for_the_first_deployment() {
        let mut store = MockObjectStore::new();
        store.expect_get_control_plane().returning(|_, _| {
            Ok(Some(control_plane(&[("broker", true)], &[], false, None)))
        });
        let capture = capture_status(&mut store);

        reconcile(
            Arc::new(version("1.1.0")),
            context(store, test_config(&[("broker", "registry.example/broker:1.1.0")])),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert!(status.conditions.is_true(VERSION_INITIALIZED_CONDITION));
        assert!(status.deployed_version.is_none());
    }

    #[tokio::test]
    async fn minor_update_phase_gates_on_image_and_readiness() {
        // Control plane still runs the old network image: the network
        // phase stays open and later phases are untouched.
        let mut store = MockObjectStore::new();
        store.expect_get_control_plane().returning(|_, _| {
            Ok(Some(control_plane(
                &[("network", true), ("broker", true)],
                &[
                    ("network", "registry.example/network:1.0.0"),
                    ("broker", "registry.example/broker:1.0.0"),
                ],
                true,
                Some("1.0.0"),
            )))
        });
        let capture = capture_status(&mut store);

        let mut v = version("1.1.0");
        v.status.as_mut().unwrap().deployed_version = Some("1.0.0".into());

        reconcile(
            Arc::new(v),
            context(
                store,
                test_config(&[
                    ("network", "registry.example/network:1.1.0"),
                    ("broker", "registry.example/broker:1.1.0"),
                ]),
            ),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert_eq!(
            status.conditions.get(MINOR_UPDATE_NETWORK).unwrap().status,
            ConditionStatus::False
        );
        assert_eq!(
            status.conditions.get(MINOR_UPDATE_BROKER).unwrap().status,
            ConditionStatus::Unknown
        );
        // the walk must not record the new version as deployed
        assert_eq!(status.deployed_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn minor_update_completes_when_all_components_match() {
        let mut store = MockObjectStore::new();
        store.expect_get_control_plane().returning(|_, _| {
            Ok(Some(control_plane(
                &[("network", true), ("broker", true)],
                &[
                    ("network", "registry.example/network:1.1.0"),
                    ("broker", "registry.example/broker:1.1.0"),
                ],
                true,
                Some("1.1.0"),
            )))
        });
        let capture = capture_status(&mut store);

        let mut v = version("1.1.0");
        v.status.as_mut().unwrap().deployed_version = Some("1.0.0".into());

        reconcile(
            Arc::new(v),
            context(
                store,
                test_config(&[
                    ("network", "registry.example/network:1.1.0"),
                    ("broker", "registry.example/broker:1.1.0"),
                ]),
            ),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert!(status.conditions.is_true(MINOR_UPDATE_NETWORK));
        assert!(status.conditions.is_true(MINOR_UPDATE_BROKER));
        assert!(status.conditions.is_true(MINOR_UPDATE_CONTROL_PLANE));
        assert_eq!(status.deployed_version.as_deref(), Some("1.1.0"));
    }

    #[tokio::test]
    async fn update_available_is_advertised_and_withdrawn() {
        // Deployed lags the available version: condition present.
        let mut store = MockObjectStore::new();
        store.expect_get_control_plane().returning(|_, _| {
            Ok(Some(control_plane(
                &[],
                &[],
                false,
                Some("1.0.0"),
            )))
        });
        let capture = capture_status(&mut store);

        let mut v = version("1.0.0");
        v.status.as_mut().unwrap().deployed_version = Some("1.0.0".into());
        // defaults recorded for 1.0.0 via a previous operator build
        v.status
            .as_mut()
            .unwrap()
            .container_image_defaults
            .insert("1.0.0".into(), BTreeMap::new());

        reconcile(
            Arc::new(v),
            context(store, test_config(&[])),
        )
        .await
        .unwrap();

        let status = capture.last();
        let update = status.conditions.get(UPDATE_AVAILABLE_CONDITION).unwrap();
        assert_eq!(update.status, ConditionStatus::True);
        assert!(update.message.contains("1.1.0"));
    }
}
