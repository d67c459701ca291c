//! Kubernetes controller reconciliation logic
//!
//! Two controllers run side by side: the control-plane sequencer walks
//! the managed services in dependency order, and the version controller
//! resolves container images and gates minor updates.

mod control_plane;
mod version;

pub use control_plane::{error_policy, reconcile, Context};
pub use version::{
    error_policy as version_error_policy, reconcile as version_reconcile, VersionContext,
};

use crate::conditions::{ConditionReason, Conditions, READY, READY_INIT_MESSAGE, READY_MESSAGE};

/// Roll all sub-conditions up into the aggregate Ready condition and
/// restore transition times against the pre-pass snapshot.
///
/// All True marks Ready True; otherwise Ready is reset and recomputed
/// from the other conditions so the dominant problem surfaces at the
/// top.
pub(crate) fn rollup_ready(conditions: &mut Conditions, saved: &Conditions) {
    if conditions.all_sub_conditions_true() {
        conditions.mark_true(READY, READY_MESSAGE);
    } else {
        conditions.mark_unknown(READY, ConditionReason::Init, READY_INIT_MESSAGE);
        let mirrored = conditions.mirror(READY);
        conditions.set(mirrored);
    }
    conditions.restore_last_transition_times(saved);
}
