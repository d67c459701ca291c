//! StratusControlPlane controller implementation
//!
//! The sequencer: one pass walks the managed services in dependency
//! order, synchronizing each enabled service's child resource. A step
//! that reports "not yet" ends the pass with a scheduled retry so no
//! downstream service is attempted before its upstreams; a step error
//! aborts the pass and surfaces through the error policy. Every pass
//! exit rolls the per-service conditions up into the aggregate Ready
//! condition and patches status.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::version::{MINOR_UPDATE_CONTROL_PLANE, MINOR_UPDATE_NETWORK};
use crate::conditions::{Condition, ConditionReason, ConditionSeverity, READY, READY_INIT_MESSAGE};
use crate::config::OperatorConfig;
use crate::crd::{StratusControlPlane, StratusVersion, StratusVersionSpec};
use crate::graph;
use crate::registry::{descriptor, ServiceId};
use crate::service::{reconcile_service, StepResult};
use crate::store::{ObjectStore, FINALIZER};
use crate::sync::OwnerInfo;
use crate::{Error, Result};

/// Delay while waiting for the version resource to be initialized
const VERSION_WAIT: Duration = Duration::from_secs(5);

/// Steady-state requeue; child resources are not watched, so readiness
/// drift is picked up on this cadence
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(60);

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls. The step order
/// is computed once from the service table and validated against the
/// dependency graph; a table that fails validation aborts startup.
pub struct Context {
    /// Store holding all resources the sequencer reads and writes
    pub store: Arc<dyn ObjectStore>,
    /// Operator configuration (available version, image defaults)
    pub config: OperatorConfig,
    sequence: Vec<ServiceId>,
}

impl Context {
    /// Create a controller context, validating the service table
    pub fn new(store: Arc<dyn ObjectStore>, config: OperatorConfig) -> Result<Self> {
        let sequence = graph::sequence()?;
        Ok(Self {
            store,
            config,
            sequence,
        })
    }

    /// The validated step order
    pub fn sequence(&self) -> &[ServiceId] {
        &self.sequence
    }
}

/// Reconcile a StratusControlPlane resource
#[instrument(skip(instance, ctx), fields(control_plane = %instance.name_any()))]
pub async fn reconcile(instance: Arc<StratusControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::validation("control plane instance has no namespace"))?;
    debug!("reconciling control plane");

    // Cleanup is delegated to owner-reference garbage collection; the
    // pass itself is a no-op once deletion is underway.
    if instance.meta().deletion_timestamp.is_some() {
        return reconcile_delete(&ctx, &instance, &namespace, &name).await;
    }

    let mut instance = (*instance).clone();

    if let Err(e) = instance.spec.validate() {
        warn!(error = %e, "control plane validation failed");
        let status = instance.status.get_or_insert_with(Default::default);
        let saved = status.conditions.clone();
        status.conditions.mark_false(
            READY,
            ConditionReason::Error,
            ConditionSeverity::Error,
            format!("invalid spec: {e}"),
        );
        status.conditions.restore_last_transition_times(&saved);
        ctx.store
            .patch_control_plane_status(&namespace, &name, status)
            .await?;
        // Validation errors require a spec change; don't requeue.
        return Ok(Action::await_change());
    }

    let generation = instance.metadata.generation;

    let mut finalizer_added = false;
    if !instance.finalizers().iter().any(|f| f == FINALIZER) {
        let mut finalizers = instance.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        ctx.store
            .set_control_plane_finalizers(&namespace, &name, &finalizers)
            .await?;
        instance.metadata.finalizers = Some(finalizers);
        finalizer_added = true;
    }

    let status = instance.status.get_or_insert_with(Default::default);
    let is_new = status.conditions.is_empty();
    let saved = status.conditions.clone();

    let mut defaults = vec![Condition::unknown(READY, READY_INIT_MESSAGE)];
    for id in ctx.sequence() {
        if instance.spec.service_enabled(*id) {
            defaults.push(Condition::unknown(
                id.condition_type(),
                format!("{id} service setup started"),
            ));
        }
    }
    let status = instance.status.get_or_insert_with(Default::default);
    status.conditions.init(&defaults);
    status.observed_generation = generation;

    // Register overall status immediately on first contact so users get
    // early feedback; the watch retriggers the real pass.
    if finalizer_added || is_new {
        finish_conditions(&mut instance, &saved);
        let status = instance.status.get_or_insert_with(Default::default);
        ctx.store
            .patch_control_plane_status(&namespace, &name, status)
            .await?;
        return Ok(Action::await_change());
    }

    let outcome = reconcile_inner(&ctx, &mut instance, &namespace, &name).await;

    finish_conditions(&mut instance, &saved);
    let status = instance.status.get_or_insert_with(Default::default);
    let patched = ctx
        .store
        .patch_control_plane_status(&namespace, &name, status)
        .await;

    match outcome {
        Ok(action) => {
            patched?;
            Ok(action)
        }
        Err(e) => {
            if let Err(patch_err) = patched {
                warn!(error = %patch_err, "failed to patch status after pass error");
            }
            Err(e)
        }
    }
}

/// The body of one pass, after bookkeeping and before the status patch
async fn reconcile_inner(
    ctx: &Context,
    instance: &mut StratusControlPlane,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let owner = OwnerInfo::from_control_plane(instance)?;

    let version = match ctx.store.get_version(namespace, name).await? {
        Some(v) => v,
        None => {
            info!("creating version resource");
            let mut version = StratusVersion::new(
                name,
                StratusVersionSpec {
                    target_version: ctx.config.available_version.clone(),
                    custom_container_images: Default::default(),
                },
            );
            version.metadata.namespace = Some(namespace.to_string());
            version.metadata.owner_references = Some(vec![owner.owner_reference()]);
            ctx.store.create_version(&version).await?;
            return Ok(Action::requeue(VERSION_WAIT));
        }
    };

    if !version.is_initialized() {
        debug!("waiting for version to be initialized");
        return Ok(Action::requeue(VERSION_WAIT));
    }

    let target = version.spec.target_version.clone();
    let deployed = instance
        .status
        .as_ref()
        .and_then(|s| s.deployed_version.clone());

    match deployed {
        // Green field deployment, or no minor update in progress.
        None => run_full_sequence(ctx, instance, &version, &owner, &target).await,
        Some(d) if d == target => run_full_sequence(ctx, instance, &version, &owner, &target).await,
        Some(_) => {
            if !version
                .status
                .as_ref()
                .map(|s| s.conditions.is_true(MINOR_UPDATE_NETWORK))
                .unwrap_or(false)
            {
                info!("minor update: updating the networking control plane");
                match sequence_pass(ctx, instance, &version, &owner, &[ServiceId::Network]).await? {
                    Some(action) => Ok(action),
                    None => Ok(Action::requeue(VERSION_WAIT)),
                }
            } else if !version
                .status
                .as_ref()
                .map(|s| s.conditions.is_true(MINOR_UPDATE_CONTROL_PLANE))
                .unwrap_or(false)
            {
                info!("minor update: updating the control plane");
                run_full_sequence(ctx, instance, &version, &owner, &target).await
            } else {
                debug!("waiting on minor update to proceed");
                Ok(Action::await_change())
            }
        }
    }
}

/// Run every step in dependency order and record the deployed version on
/// a clean full pass
async fn run_full_sequence(
    ctx: &Context,
    instance: &mut StratusControlPlane,
    version: &StratusVersion,
    owner: &OwnerInfo,
    target: &str,
) -> Result<Action> {
    match sequence_pass(ctx, instance, version, owner, ctx.sequence()).await? {
        Some(action) => Ok(action),
        None => {
            let status = instance.status.get_or_insert_with(Default::default);
            if status.deployed_version.as_deref() != Some(target) {
                info!(version = %target, "full pass complete, recording deployed version");
                status.deployed_version = Some(target.to_string());
            }
            Ok(Action::requeue(STEADY_STATE_REQUEUE))
        }
    }
}

/// Walk the given steps strictly in order.
///
/// Returns `Ok(None)` when every step completed, `Ok(Some(action))` when
/// a step asked to requeue (later steps are skipped), and the error of
/// the first failing step otherwise.
async fn sequence_pass(
    ctx: &Context,
    instance: &mut StratusControlPlane,
    version: &StratusVersion,
    owner: &OwnerInfo,
    services: &[ServiceId],
) -> Result<Option<Action>> {
    for id in services {
        let step = reconcile_service(
            ctx.store.as_ref(),
            descriptor(*id),
            instance,
            version,
            owner,
        )
        .await?;
        match step {
            StepResult::Continue => {}
            StepResult::RequeueAfter(delay) => {
                debug!(service = %id, ?delay, "step not ready, ending pass");
                return Ok(Some(Action::requeue(delay)));
            }
        }
    }
    Ok(None)
}

/// Roll the per-service conditions up into the aggregate Ready condition
/// and restore transition times against the pre-pass snapshot
fn finish_conditions(instance: &mut StratusControlPlane, saved: &crate::conditions::Conditions) {
    let status = instance.status.get_or_insert_with(Default::default);
    super::rollup_ready(&mut status.conditions, saved);
}

/// Handle a control plane whose deletion is underway: release the
/// version resource's finalizer and then our own. Child resources are
/// garbage-collected via their owner references.
async fn reconcile_delete(
    ctx: &Context,
    instance: &StratusControlPlane,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    info!("reconcile delete");

    if let Some(version) = ctx.store.get_version(namespace, name).await? {
        let finalizers: Vec<String> = version
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        if finalizers.len() != version.finalizers().len() {
            ctx.store
                .set_version_finalizers(namespace, name, &finalizers)
                .await?;
        }
    }

    if instance.finalizers().iter().any(|f| f == FINALIZER) {
        let finalizers: Vec<String> = instance
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        ctx.store
            .set_control_plane_finalizers(namespace, name, &finalizers)
            .await?;
    }

    Ok(Action::await_change())
}

/// Error policy for the controller; reconciliation failures requeue with
/// a short delay and the outer scheduler's backoff
pub fn error_policy(
    instance: Arc<StratusControlPlane>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    // Store conflicts mean a stale read; the next pass re-fetches.
    if error.is_conflict() {
        debug!(control_plane = %instance.name_any(), "conflict, pass will be retried");
    } else {
        error!(
            ?error,
            control_plane = %instance.name_any(),
            "reconciliation failed"
        );
    }
    Action::requeue(Duration::from_secs(5))
}
