//! Judge verdicts and the score-derived classification policy.

use serde::{Deserialize, Serialize};

/// Coarse classification of a judge's assessment of a candidate artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictStatus {
    /// Score at or above the approval threshold. Terminates the controller
    /// in `AgentState::Succeeded`.
    Approve,
    /// Score in the refinement band. Triggers a same-conversation revision.
    SoftFail,
    /// Score below the replan threshold. Triggers a new-conversation plan.
    HardFail,
}

/// A judge's structured assessment of a candidate artifact.
///
/// Only constructible via [`Verdict::new`], which normalizes `status`
/// against `score` under the supplied thresholds — a judge response whose
/// reported status disagrees with its score is never trusted as-is (see
/// [`VerdictThresholds::classify`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub score: Option<f64>,
    pub notes: String,
    /// Bounded to `RevisionRequest::MAX_ITEMS` by the feedback shaping step,
    /// not here — a `Verdict` may still carry more than that at construction.
    pub required_fixes: Vec<String>,
    /// Whether this verdict's *reported* status differed from the one
    /// normalization derived from its score. Recorded so the controller can
    /// emit `Event::VerdictNormalized` without re-deriving it.
    pub was_normalized: bool,
}

impl Verdict {
    /// Whether this verdict represents acceptance.
    pub fn is_approved(&self) -> bool {
        self.status == VerdictStatus::Approve
    }
}

/// Score thresholds used to classify (and normalize) verdicts.
///
/// Defaults match the domain defaults in the spec: approve `>= 70`, soft
/// `50..70`, hard `< 50`.
#[derive(Debug, Clone, Copy)]
pub struct VerdictThresholds {
    pub approve: f64,
    pub soft: f64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            approve: 70.0,
            soft: 50.0,
        }
    }
}

impl VerdictThresholds {
    pub fn new(approve: f64, soft: f64) -> Self {
        Self { approve, soft }
    }

    /// Classify a raw score into a status under these thresholds.
    pub fn classify_score(&self, score: f64) -> VerdictStatus {
        if score >= self.approve {
            VerdictStatus::Approve
        } else if score >= self.soft {
            VerdictStatus::SoftFail
        } else {
            VerdictStatus::HardFail
        }
    }

    /// Build a normalized [`Verdict`] from a judge's raw, possibly
    /// inconsistent `(status, score)` pair.
    ///
    /// A missing score cannot be normalized against the thresholds — the
    /// judge's reported status is trusted as-is in that case (there is no
    /// score-derived alternative). A present score always wins: the judge
    /// is never re-invoked, per the spec's normative normalization policy.
    pub fn normalize(
        &self,
        reported_status: VerdictStatus,
        score: Option<f64>,
        notes: impl Into<String>,
        required_fixes: Vec<String>,
    ) -> Verdict {
        match score {
            Some(s) => {
                let derived = self.classify_score(s);
                Verdict {
                    status: derived,
                    score: Some(s),
                    notes: notes.into(),
                    required_fixes,
                    was_normalized: derived != reported_status,
                }
            }
            None => Verdict {
                status: reported_status,
                score: None,
                notes: notes.into(),
                required_fixes,
                was_normalized: false,
            },
        }
    }

    /// Treat a schema-invalid validator response as hard-fail-equivalent
    /// for routing purposes. Feedback tagging with `SCHEMA_INVALID` happens
    /// at the call site (the controller), not here.
    pub fn schema_invalid() -> VerdictStatus {
        VerdictStatus::HardFail
    }
}
