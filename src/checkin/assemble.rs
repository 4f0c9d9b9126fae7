//! Manifest assembly and the baseline-vs-delta choice (§4.4.4).

use crate::manifest::CommitManifest;

/// Decide whether the delta-form candidate should be used, given the parent baseline's
/// F-card count `baseline_count` and the delta candidate's F-card count (including its
/// B-card) `delta_count`.
///
/// Open question (preserved verbatim, not resolved — §9): the constant `B*3 - 9` encodes an
/// assumed three new F-cards per future commit. The source does not document how to tune
/// this; keep the exact formula rather than guessing at a replacement.
pub fn should_use_delta(baseline_count: i64, delta_count: i64) -> bool {
    delta_count * delta_count < baseline_count * 3 - 9
}

/// Choose between two already-built candidate manifests per §4.4.4, honoring a forced form
/// and the repository-wide "forbid delta manifests" setting.
pub enum ManifestChoice {
    Baseline,
    Delta,
}

pub fn choose_manifest_form(
    baseline: &CommitManifest,
    delta: &CommitManifest,
    forced: Option<ManifestChoiceForce>,
    forbid_delta: bool,
) -> ManifestChoice {
    if forbid_delta {
        return ManifestChoice::Baseline;
    }
    match forced {
        Some(ManifestChoiceForce::Baseline) => ManifestChoice::Baseline,
        Some(ManifestChoiceForce::Delta) => ManifestChoice::Delta,
        None => {
            let baseline_count = baseline.file_card_count() as i64;
            // +1 accounts for the B-card itself, per §4.4.4's "including the B-card".
            let delta_count = delta.file_card_count() as i64 + 1;
            if should_use_delta(baseline_count, delta_count) {
                ManifestChoice::Delta
            } else {
                ManifestChoice::Baseline
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestChoiceForce {
    Baseline,
    Delta,
}
