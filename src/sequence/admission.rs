//! Admission control — per-sender-identity hourly caps and overflow deferral.
//!
//! Every sender identity gets its own quota. Within an identity, eligible
//! steps are ordered by prospect id then step ordinal; the first
//! `max_per_hour` are planned with a fixed spacing between sends and the
//! rest are deferred to the next slot.
//!
//! This is FIFO by discovery order, not a fair queue: a prospect whose id
//! always sorts last for a busy identity can be deferred tick after tick
//! while new work keeps arriving ahead of it.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::sequence::{Prospect, StepKey, TimeSlot};

/// Cap and spacing applied to each sender identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_per_hour: usize,
    pub delay_between_sends: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_per_hour: 10,
            delay_between_sends: Duration::from_secs(90),
        }
    }
}

/// An eligible step tagged with its owning prospect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCandidate {
    pub prospect_id: String,
    pub recipient: String,
    pub step_key: StepKey,
}

/// A step admitted for this tick. `delay` is the wait before sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSend {
    pub candidate: SendCandidate,
    pub delay: Duration,
}

/// An over-cap step and the slot it moves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferral {
    pub candidate: SendCandidate,
    pub to: TimeSlot,
}

/// Admission result for one sender identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPlan {
    pub identity: String,
    pub sends: Vec<PlannedSend>,
    pub deferred: Vec<Deferral>,
}

impl SendPlan {
    /// Total wait across the plan, excluding send time itself.
    pub fn total_delay(&self) -> Duration {
        self.sends.iter().map(|s| s.delay).sum()
    }
}

/// Group prospects by sender identity. Identities compare case-insensitively
/// and are keyed in lowercase, matching how credentials are looked up. Each
/// group is sorted by prospect id.
pub fn group_by_identity(prospects: &[Prospect]) -> BTreeMap<String, Vec<&Prospect>> {
    let mut groups: BTreeMap<String, Vec<&Prospect>> = BTreeMap::new();
    for prospect in prospects {
        groups
            .entry(prospect.my_email.to_lowercase())
            .or_default()
            .push(prospect);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.id.cmp(&b.id));
    }
    groups
}

/// Build the send plan for one identity.
pub fn plan(
    identity: &str,
    mut candidates: Vec<SendCandidate>,
    slot: TimeSlot,
    policy: AdmissionPolicy,
) -> SendPlan {
    // Stable: equal (prospect, ordinal) pairs keep discovery order.
    candidates.sort_by(|a, b| {
        a.prospect_id
            .cmp(&b.prospect_id)
            .then_with(|| a.step_key.cmp(&b.step_key))
    });

    let overflow = if candidates.len() > policy.max_per_hour {
        candidates.split_off(policy.max_per_hour)
    } else {
        Vec::new()
    };

    let sends = candidates
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| PlannedSend {
            candidate,
            delay: if i == 0 {
                Duration::ZERO
            } else {
                policy.delay_between_sends
            },
        })
        .collect();

    let to = slot.next();
    let deferred = overflow
        .into_iter()
        .map(|candidate| Deferral { candidate, to })
        .collect();

    SendPlan {
        identity: identity.to_string(),
        sends,
        deferred,
    }
}
