//! Veto decision taken right before a job executes

use tracing::debug;

use crate::scheduler::trigger::TriggerState;

/// Suppresses the firing a trigger has moved away from.
///
/// When the trigger has just determined a better time, the firing at the
/// original base time must not run; the shifted firing that follows does.
/// In dry-run mode the decision is inverted so jobs keep running on their
/// original schedule while shifts are only computed and recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct FiringGate {
    dry_run: bool,
}

impl FiringGate {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn should_veto(&self, state: TriggerState) -> bool {
        let shifted = state == TriggerState::DeterminedBetterTime;
        let veto = if self.dry_run { !shifted } else { shifted };
        debug!(
            "Firing gate: state={} dry_run={} veto={}",
            state, self.dry_run, veto
        );
        veto
    }
}
