//! Generic per-service reconcile step
//!
//! One function drives every managed service, parameterized by its
//! [`ServiceDescriptor`]. Each pass re-evaluates the service's state:
//! disabled services get their child deleted and conditions cleared;
//! enabled services get their child synchronized and their readiness
//! reflected into the parent's conditions and image map.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::conditions::{ConditionReason, ConditionSeverity};
use crate::crd::{StratusControlPlane, StratusVersion};
use crate::registry::ServiceDescriptor;
use crate::store::ObjectStore;
use crate::sync::{ensure_deleted, fill_default, synchronize, OwnerInfo, SyncOutcome};
use crate::{Error, Result, SERVICE_LABEL};

/// Delay before re-checking a service whose exposed Services are not all
/// present yet
pub const ENDPOINT_REQUEUE: Duration = Duration::from_secs(10);

/// Outcome of one reconcile step, consumed by the sequencer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The step finished for this pass; the sequencer proceeds
    Continue,
    /// The step is waiting on something; end the pass and retry after
    /// the given delay, skipping all later steps
    RequeueAfter(Duration),
}

/// Reconcile one managed service against the control plane's desired
/// state.
///
/// Mutates `instance` in memory only (conditions and the deployed image
/// map); persisting the status is the sequencer's job at end of pass.
pub async fn reconcile_service(
    store: &dyn ObjectStore,
    desc: &'static ServiceDescriptor,
    instance: &mut StratusControlPlane,
    version: &StratusVersion,
    owner: &OwnerInfo,
) -> Result<StepResult> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::validation("control plane instance has no namespace"))?;
    let name = desc.id.as_str();
    let condition_type = desc.id.condition_type();

    let template = match instance.spec.service(desc.id) {
        Some(t) if t.enabled => t.clone(),
        _ => {
            // Disabled (or absent): delete the child and forget about it.
            ensure_deleted(store, &desc.child, &namespace, name).await?;
            if let Some(status) = instance.status.as_mut() {
                status.conditions.remove(condition_type);
                status.container_images.remove(name);
            }
            debug!(service = %desc.id, "service disabled");
            return Ok(StepResult::Continue);
        }
    };

    let Some(image) = version.resolved_image(name).cloned() else {
        let err = Error::malformed(format!(
            "no container image resolved for service {name} at version {}",
            version.spec.target_version
        ));
        if let Some(status) = instance.status.as_mut() {
            status.conditions.mark_false(
                condition_type,
                ConditionReason::Error,
                ConditionSeverity::Warning,
                format!("{name} service reconciliation failed: {err}"),
            );
        }
        return Err(err);
    };

    let existing = store.get_child(&desc.child, &namespace, name).await?;

    // Endpoint gate: once the child exists, endpoint configuration is
    // only computed when every expected underlying Service is present.
    if desc.exposes_endpoints && !template.override_.service.is_empty() && existing.is_some() {
        let selector = exposed_service_selector(name);
        let observed = store.list_exposed_services(&namespace, &selector).await?;
        let expected = template.override_.service.len();
        if observed.len() != expected {
            if let Some(status) = instance.status.as_mut() {
                status.conditions.mark_false(
                    condition_type,
                    ConditionReason::Requested,
                    ConditionSeverity::Info,
                    format!(
                        "waiting for exposed Services of {name}: {}/{expected} present",
                        observed.len()
                    ),
                );
            }
            debug!(service = %desc.id, observed = observed.len(), expected, "exposed Services incomplete");
            return Ok(StepResult::RequeueAfter(ENDPOINT_REQUEUE));
        }
    }

    let spec = &instance.spec;
    let sync_result = synchronize(store, &desc.child, &namespace, name, owner, |child| {
        let mut child_spec = if template.template.is_null() {
            json!({})
        } else {
            template.template.clone()
        };
        if !child_spec.is_object() {
            return Err(Error::validation(format!(
                "template for service {name} must be an object"
            )));
        }

        for (endpoint, fragment) in &template.override_.service {
            let mut fragment = fragment.clone();
            if let Some(obj) = fragment.as_object_mut() {
                let labels = obj.entry("labels").or_insert_with(|| json!({}));
                if !labels.is_object() {
                    *labels = json!({});
                }
                labels[SERVICE_LABEL] = json!(name);
            }
            child_spec["override"]["service"][endpoint] = fragment;
        }

        fill_default(&mut child_spec, "secret", json!(spec.secret));
        if let Some(selector) = &spec.node_selector {
            fill_default(&mut child_spec, "nodeSelector", json!(selector));
        }
        if desc.needs_database {
            fill_default(&mut child_spec, "databaseInstance", json!(spec.database_instance));
        }
        if desc.needs_storage {
            if let Some(class) = &spec.storage_class {
                fill_default(&mut child_spec, "storageClass", json!(class));
            }
        }
        child_spec["containerImage"] = json!(image);

        child.data["spec"] = child_spec;
        child
            .labels_mut()
            .insert(SERVICE_LABEL.to_string(), name.to_string());
        Ok(())
    })
    .await;

    let (outcome, child) = match sync_result {
        Ok(r) => r,
        Err(err) => {
            if let Some(status) = instance.status.as_mut() {
                status.conditions.mark_false(
                    condition_type,
                    ConditionReason::Error,
                    ConditionSeverity::Warning,
                    format!("{name} service reconciliation failed: {err}"),
                );
            }
            return Err(err);
        }
    };

    if outcome != SyncOutcome::Unchanged {
        info!(service = %desc.id, %outcome, "child resource synchronized");
    }

    let status = instance
        .status
        .get_or_insert_with(Default::default);

    // Both gates, not either: an image must never be published for a
    // spec the child has not caught up with yet.
    if child_is_ready(&child) && generation_current(&child) {
        status.container_images.insert(name.to_string(), image);
        status
            .conditions
            .mark_true(condition_type, format!("{name} service setup complete"));
    } else {
        status.conditions.mark_false(
            condition_type,
            ConditionReason::Requested,
            ConditionSeverity::Info,
            format!("{name} service setup in progress"),
        );
    }

    Ok(StepResult::Continue)
}

/// Label selector matching the Services a child exposes
pub fn exposed_service_selector(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SERVICE_LABEL.to_string(), service.to_string())])
}

/// Whether the child reports an aggregate Ready condition of True
fn child_is_ready(child: &DynamicObject) -> bool {
    child.data["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Whether the child's status reflects its current generation
fn generation_current(child: &DynamicObject) -> bool {
    let generation = child.metadata.generation;
    let observed = child.data["status"]["observedGeneration"].as_i64();
    match (generation, observed) {
        (Some(g), Some(o)) => g == o,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionStatus;
    use crate::crd::StratusVersionStatus;
    use crate::registry::{descriptor, ServiceId};
    use crate::store::MockObjectStore;

    fn control_plane(services: Value) -> StratusControlPlane {
        let spec = serde_json::from_value(json!({
            "secret": "osp-secret",
            "storageClass": "fast",
            "services": services,
        }))
        .unwrap();
        let mut cp = StratusControlPlane::new("main", spec);
        cp.metadata.namespace = Some("osp".into());
        cp.metadata.uid = Some("uid-1".into());
        cp.status = Some(Default::default());
        cp
    }

    fn version_with_images(images: &[(&str, &str)]) -> StratusVersion {
        let mut v = StratusVersion::new(
            "main",
            serde_json::from_value(json!({"targetVersion": "1.1.0"})).unwrap(),
        );
        let mut status = StratusVersionStatus::default();
        for (service, image) in images {
            status
                .container_images
                .insert(service.to_string(), image.to_string());
        }
        v.status = Some(status);
        v
    }

    fn owner() -> OwnerInfo {
        OwnerInfo {
            api_version: "stratus.dev/v1alpha1".into(),
            kind: "StratusControlPlane".into(),
            name: "main".into(),
            uid: "uid-1".into(),
        }
    }

    /// A persisted child in the given readiness state
    fn child(service: ServiceId, ready: bool, generation: i64, observed: i64) -> DynamicObject {
        let desc = descriptor(service);
        let mut obj =
            DynamicObject::new(service.as_str(), &desc.child.api_resource()).within("osp");
        obj.metadata.generation = Some(generation);
        obj.metadata.owner_references = Some(vec![owner().owner_reference()]);
        obj.data = json!({
            "spec": {},
            "status": {
                "observedGeneration": observed,
                "conditions": [
                    {"type": "Ready", "status": if ready { "True" } else { "False" }}
                ]
            }
        });
        obj
    }

    fn condition_status(cp: &StratusControlPlane, type_: &str) -> Option<ConditionStatus> {
        cp.status
            .as_ref()
            .unwrap()
            .conditions
            .get(type_)
            .map(|c| c.status.clone())
    }

    #[tokio::test]
    async fn disabled_service_is_deleted_and_forgotten() {
        let mut cp = control_plane(json!({"broker": {"enabled": false}}));
        {
            let status = cp.status.as_mut().unwrap();
            status.conditions.mark_true("BrokerReady", "setup complete");
            status
                .container_images
                .insert("broker".into(), "registry.example/broker:1.0.0".into());
        }

        let existing = child(ServiceId::Broker, true, 1, 1);
        let mut store = MockObjectStore::new();
        store
            .expect_get_child()
            .returning(move |_, _, _| Ok(Some(existing.clone())));
        store.expect_delete_child().returning(|_, _, _| Ok(()));

        let result = reconcile_service(
            &store,
            descriptor(ServiceId::Broker),
            &mut cp,
            &version_with_images(&[]),
            &owner(),
        )
        .await
        .unwrap();

        assert_eq!(result, StepResult::Continue);
        assert!(condition_status(&cp, "BrokerReady").is_none());
        assert!(cp.deployed_image(ServiceId::Broker).is_none());
    }

    #[tokio::test]
    async fn ready_child_at_current_generation_publishes_the_image() {
        let mut cp = control_plane(json!({"broker": {"enabled": true, "template": {"replicas": 3}}}));
        let existing = child(ServiceId::Broker, true, 2, 2);
        let mut store = MockObjectStore::new();
        store
            .expect_get_child()
            .returning(move |_, _, _| Ok(Some(existing.clone())));
        store.expect_update_child().returning(|_, _| Ok(()));

        let result = reconcile_service(
            &store,
            descriptor(ServiceId::Broker),
            &mut cp,
            &version_with_images(&[("broker", "registry.example/broker:1.1.0")]),
            &owner(),
        )
        .await
        .unwrap();

        assert_eq!(result, StepResult::Continue);
        assert_eq!(
            condition_status(&cp, "BrokerReady"),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            cp.deployed_image(ServiceId::Broker).unwrap(),
            "registry.example/broker:1.1.0"
        );
    }

    #[tokio::test]
    async fn stale_generation_blocks_image_propagation() {
        let mut cp = control_plane(json!({"broker": {"enabled": true}}));
        cp.status
            .as_mut()
            .unwrap()
            .container_images
            .insert("broker".into(), "registry.example/broker:1.0.0".into());

        // Ready, but status lags the spec generation
        let existing = child(ServiceId::Broker, true, 3, 2);
        let mut store = MockObjectStore::new();
        store
            .expect_get_child()
            .returning(move |_, _, _| Ok(Some(existing.clone())));
        store.expect_update_child().returning(|_, _| Ok(()));

        reconcile_service(
            &store,
            descriptor(ServiceId::Broker),
            &mut cp,
            &version_with_images(&[("broker", "registry.example/broker:1.1.0")]),
            &owner(),
        )
        .await
        .unwrap();

        // The prior image survives; the condition reports in-progress.
        assert_eq!(
            cp.deployed_image(ServiceId::Broker).unwrap(),
            "registry.example/broker:1.0.0"
        );
        assert_eq!(
            condition_status(&cp, "BrokerReady"),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn unready_child_reports_in_progress() {
        let mut cp = control_plane(json!({"broker": {"enabled": true}}));
        let existing = child(ServiceId::Broker, false, 1, 1);
        let mut store = MockObjectStore::new();
        store
            .expect_get_child()
            .returning(move |_, _, _| Ok(Some(existing.clone())));
        store.expect_update_child().returning(|_, _| Ok(()));

        let result = reconcile_service(
            &store,
            descriptor(ServiceId::Broker),
            &mut cp,
            &version_with_images(&[("broker", "registry.example/broker:1.1.0")]),
            &owner(),
        )
        .await
        .unwrap();

        assert_eq!(result, StepResult::Continue);
        let cond = cp.status.as_ref().unwrap().conditions.get("BrokerReady").unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert!(cond.message.contains("in progress"));
    }

    #[tokio::test]
    async fn missing_image_is_a_hard_error_with_condition() {
        let mut cp = control_plane(json!({"broker": {"enabled": true}}));
        let store = MockObjectStore::new();

        let err = reconcile_service(
            &store,
            descriptor(ServiceId::Broker),
            &mut cp,
            &version_with_images(&[]),
            &owner(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Malformed(_)));
        let cond = cp.status.as_ref().unwrap().conditions.get("BrokerReady").unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.severity, crate::conditions::ConditionSeverity::Warning);
        assert!(cond.message.contains("no container image"));
    }

    #[tokio::test]
    async fn incomplete_exposed_services_requeue_without_sync() {
        let mut cp = control_plane(json!({
            "identity": {
                "enabled": true,
                "override": {"service": {"public": {}, "internal": {}}}
            }
        }));
        let existing = child(ServiceId::Identity, false, 1, 1);
        let mut store = MockObjectStore::new();
        // one get for the gate; the synchronizer must never run
        store
            .expect_get_child()
            .times(1)
            .returning(move |_, _, _| Ok(Some(existing.clone())));
        store
            .expect_list_exposed_services()
            .returning(|_, _| Ok(vec!["identity-public".into()]));

        let result = reconcile_service(
            &store,
            descriptor(ServiceId::Identity),
            &mut cp,
            &version_with_images(&[("identity", "registry.example/identity:1.1.0")]),
            &owner(),
        )
        .await
        .unwrap();

        assert_eq!(result, StepResult::RequeueAfter(ENDPOINT_REQUEUE));
        let cond = cp.status.as_ref().unwrap().conditions.get("IdentityReady").unwrap();
        assert!(cond.message.contains("1/2"));
    }

    #[tokio::test]
    async fn first_pass_creates_the_child_despite_endpoint_overrides() {
        let mut cp = control_plane(json!({
            "identity": {
                "enabled": true,
                "override": {"service": {"public": {}}}
            }
        }));
        let mut store = MockObjectStore::new();
        store.expect_get_child().returning(|_, _, _| Ok(None));
        store
            .expect_create_child()
            .withf(|_, obj| {
                let spec = &obj.data["spec"];
                spec["override"]["service"]["public"]["labels"]["stratus.dev/service"]
                    == json!("identity")
                    && spec["databaseInstance"] == json!("stratus")
                    && spec["secret"] == json!("osp-secret")
            })
            .returning(|_, _| Ok(()));

        let result = reconcile_service(
            &store,
            descriptor(ServiceId::Identity),
            &mut cp,
            &version_with_images(&[("identity", "registry.example/identity:1.1.0")]),
            &owner(),
        )
        .await
        .unwrap();

        assert_eq!(result, StepResult::Continue);
    }

    #[tokio::test]
    async fn disable_then_enable_matches_fresh_enable() {
        let version = version_with_images(&[("broker", "registry.example/broker:1.1.0")]);

        // Fresh enable against a ready child.
        let mut fresh = control_plane(json!({"broker": {"enabled": true}}));
        let ready = child(ServiceId::Broker, true, 1, 1);
        let mut store = MockObjectStore::new();
        let ready_clone = ready.clone();
        store
            .expect_get_child()
            .returning(move |_, _, _| Ok(Some(ready_clone.clone())));
        store.expect_update_child().returning(|_, _| Ok(()));
        store.expect_delete_child().returning(|_, _, _| Ok(()));
        reconcile_service(&store, descriptor(ServiceId::Broker), &mut fresh, &version, &owner())
            .await
            .unwrap();

        // Disable, then re-enable with identical desired state.
        let mut cycled = control_plane(json!({"broker": {"enabled": false}}));
        reconcile_service(&store, descriptor(ServiceId::Broker), &mut cycled, &version, &owner())
            .await
            .unwrap();
        cycled.spec = fresh.spec.clone();
        reconcile_service(&store, descriptor(ServiceId::Broker), &mut cycled, &version, &owner())
            .await
            .unwrap();

        // No accumulated state leak: both paths land in the same
        // terminal ready state.
        let fresh_status = fresh.status.as_ref().unwrap();
        let cycled_status = cycled.status.as_ref().unwrap();
        assert_eq!(
            condition_status(&fresh, "BrokerReady"),
            condition_status(&cycled, "BrokerReady")
        );
        assert_eq!(fresh_status.container_images, cycled_status.container_images);
    }
}
