//! Child-resource synchronizer
//!
//! Create-or-patch for owned child resources: fetch the child, let the
//! caller mutate a working copy (copying the desired spec fragment and
//! filling defaults), register the controller owner reference, and
//! persist only when something actually changed. The mutate-then-compare
//! shape makes repeated passes over unchanged desired state free.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::debug;

use crate::crd::StratusControlPlane;
use crate::registry::ChildKind;
use crate::store::ObjectStore;
use crate::{Error, Result};

/// What the synchronizer did with the child resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The child did not exist and was created
    Created,
    /// The child existed and differed from the desired state
    Updated,
    /// The child already matched the desired state
    Unchanged,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Identity of the owning resource, recorded on every child
#[derive(Clone, Debug)]
pub struct OwnerInfo {
    /// Owner apiVersion
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner UID; identity for the single-owner invariant
    pub uid: String,
}

impl OwnerInfo {
    /// Build owner identity from a control plane instance.
    ///
    /// Fails when the instance has not been persisted yet (no UID); a
    /// child must never be created pointing at an unpersisted owner.
    pub fn from_control_plane(instance: &StratusControlPlane) -> Result<Self> {
        let uid = instance
            .meta()
            .uid
            .clone()
            .ok_or_else(|| Error::validation("control plane instance has no uid"))?;
        Ok(Self {
            api_version: StratusControlPlane::api_version(&()).to_string(),
            kind: StratusControlPlane::kind(&()).to_string(),
            name: instance.name_any(),
            uid,
        })
    }

    /// Owner reference marking the owner as controller, so the child is
    /// garbage-collected with the owner
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Upsert a child resource.
///
/// Fetches the child by identity (absent means a zero-value child with
/// that identity), applies `mutate`, registers the controller owner
/// reference, and persists create-if-new / update-if-changed. Returns
/// the outcome together with the object as persisted, whose status still
/// reflects the pre-mutation fetch.
pub async fn synchronize<F>(
    store: &dyn ObjectStore,
    kind: &ChildKind,
    namespace: &str,
    name: &str,
    owner: &OwnerInfo,
    mutate: F,
) -> Result<(SyncOutcome, DynamicObject)>
where
    F: FnOnce(&mut DynamicObject) -> Result<()>,
{
    let existing = store.get_child(kind, namespace, name).await?;

    let mut child = match &existing {
        Some(obj) => obj.clone(),
        None => DynamicObject::new(name, &kind.api_resource()).within(namespace),
    };
    if child.data.is_null() {
        child.data = Value::Object(Default::default());
    }

    mutate(&mut child)?;
    set_controller_reference(&mut child, owner)?;

    match existing {
        None => {
            store.create_child(kind, &child).await?;
            Ok((SyncOutcome::Created, child))
        }
        Some(before) if desired_state_equal(&before, &child) => {
            debug!(kind = %kind.kind, name = %name, "child already up to date");
            Ok((SyncOutcome::Unchanged, child))
        }
        Some(_) => {
            store.update_child(kind, &child).await?;
            Ok((SyncOutcome::Updated, child))
        }
    }
}

/// Delete a child resource if it exists; already-absent is success.
pub async fn ensure_deleted(
    store: &dyn ObjectStore,
    kind: &ChildKind,
    namespace: &str,
    name: &str,
) -> Result<()> {
    if store.get_child(kind, namespace, name).await?.is_none() {
        return Ok(());
    }
    store.delete_child(kind, namespace, name).await
}

/// Register `owner` as the controller of `child`.
///
/// A child already controlled by a different UID belongs to someone
/// else; that violates the single-owner invariant and is an error, not
/// something to silently adopt.
fn set_controller_reference(child: &mut DynamicObject, owner: &OwnerInfo) -> Result<()> {
    let child_namespace = child.metadata.namespace.clone().unwrap_or_default();
    let child_name = child.name_any();
    let refs = child.metadata.owner_references.get_or_insert_with(Vec::new);

    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(Error::ownership(format!(
            "{}/{} is already controlled by {} {} (uid {})",
            child_namespace,
            child_name,
            other.kind,
            other.name,
            other.uid,
        )));
    }

    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner.owner_reference());
    Ok(())
}

/// Compare the parts of a child the synchronizer manages: spec data,
/// labels, and owner references. Status and server-managed metadata are
/// ignored.
fn desired_state_equal(before: &DynamicObject, after: &DynamicObject) -> bool {
    before.data == after.data
        && before.metadata.labels == after.metadata.labels
        && before.metadata.owner_references == after.metadata.owner_references
}

/// Assign `value` to `spec[key]` only when the template left it unset
/// (absent, null, or an empty string). Explicit values are never
/// clobbered.
pub fn fill_default(spec: &mut Value, key: &str, value: Value) {
    let Some(map) = spec.as_object_mut() else {
        return;
    };
    let unset = match map.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if unset {
        map.insert(key.to_string(), value);
    }
}
