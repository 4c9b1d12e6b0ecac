// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Conflict resolution policies.
//!
//! All five policies are pure over their candidate set and deterministic:
//! given the same candidate multiset, every peer computes the same winner
//! and the same byte-identical resolved payload.
//!
//! Ordering invariant (last-write-wins): candidates order ascending by
//! (tick, seq); at equal (tick, seq) the lexicographically smallest origin
//! id wins, so it sorts last in apply order.

use serde::{Deserialize, Serialize};
use tether_proto::{payload_digest, Digest, MergeRule, MergeTable, Payload, Value};

use crate::ident::{EntityId, PeerId, TickNumber};

/// Selectable conflict policy, global or per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Greatest (tick, seq); origin id breaks ties.
    LastWriteWins,
    /// The host's candidate wins when present; losers are echoed a conflict.
    HostAuthority,
    /// Per-field combination governed by the merge table.
    Merge,
    /// Restore history at the conflict tick, apply the earliest candidate,
    /// replay buffered inbound.
    Rollback,
    /// Majority by payload digest with a quorum floor.
    Vote,
}

impl PolicyKind {
    /// Canonical wire/report name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::LastWriteWins => "last_write_wins",
            PolicyKind::HostAuthority => "host_authority",
            PolicyKind::Merge => "merge",
            PolicyKind::Rollback => "rollback",
            PolicyKind::Vote => "vote",
        }
    }

    /// Parses a wire/report name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "last_write_wins" => PolicyKind::LastWriteWins,
            "host_authority" => PolicyKind::HostAuthority,
            "merge" => PolicyKind::Merge,
            "rollback" => PolicyKind::Rollback,
            "vote" => PolicyKind::Vote,
            _ => return None,
        })
    }
}

/// One candidate write competing for an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Originating peer.
    pub origin: PeerId,
    /// Tick the write was tagged with.
    pub tick: TickNumber,
    /// Origin-local sequence number of the carrying message.
    pub seq: u32,
    /// Writer-claimed version.
    pub version: u64,
    /// Candidate payload.
    pub payload: Payload,
}

/// Resolution outcome for observers and the echoed conflict message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictReport {
    /// Contested entity.
    pub entity: EntityId,
    /// Winning origin.
    pub winner: PeerId,
    /// Resolved payload the store converged on.
    pub payload: Payload,
    /// Tick the resolution applied at.
    pub applied_tick: TickNumber,
    /// Policy that produced the outcome (after any degradation).
    pub policy: PolicyKind,
    /// True when the selected policy degraded (rollback out of window,
    /// vote below quorum).
    pub degraded: bool,
}

/// How the controller commits the resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyPlan {
    /// Apply every candidate in the given index order; the last one lands
    /// the final payload. Each application is an accepted write.
    Ordered(Vec<usize>),
    /// Apply only the indexed candidate.
    Single(usize),
    /// Apply this combined payload once, attributed to the winner.
    Merged(Payload),
}

/// Full resolution: plan plus reporting metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Policy that actually ran (after degradation).
    pub policy: PolicyKind,
    /// True when the requested policy could not run.
    pub degraded: bool,
    /// Restore target for the rollback policy.
    pub rollback_to: Option<TickNumber>,
    /// Commit plan.
    pub apply: ApplyPlan,
    /// Index of the winning candidate.
    pub winner: usize,
    /// Candidates to echo a conflict message to.
    pub rejected: Vec<usize>,
}

/// Inputs a resolution may consult besides the candidates.
#[derive(Debug)]
pub struct ResolveCtx<'a> {
    /// Current host, if any (host-authority and degradations).
    pub host: Option<&'a PeerId>,
    /// Field merge rules for the merge policy.
    pub merge_table: &'a MergeTable,
    /// Oldest tick the history buffer can still restore.
    pub oldest_restorable: Option<TickNumber>,
}

/// Indices of `candidates` in ascending last-write-wins order (winner last).
#[must_use]
pub fn lww_order(candidates: &[Candidate]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        let (ca, cb) = (&candidates[a], &candidates[b]);
        (ca.tick, ca.seq)
            .cmp(&(cb.tick, cb.seq))
            // Larger origin id loses: it sorts earlier so the smaller id
            // lands last.
            .then_with(|| cb.origin.cmp(&ca.origin))
    });
    order
}

/// Index of the last-write-wins winner.
#[must_use]
pub fn lww_winner(candidates: &[Candidate]) -> usize {
    lww_order(candidates).last().copied().unwrap_or(0)
}

/// Votes required for a majority of `voters`.
#[must_use]
pub fn quorum(voters: usize) -> usize {
    voters / 2 + 1
}

/// Resolves `candidates` under `policy`.
///
/// Degradations are encoded in the outcome: rollback outside the history
/// window and vote below quorum both fall back to host authority with
/// `degraded` set.
#[must_use]
pub fn resolve(policy: PolicyKind, candidates: &[Candidate], ctx: &ResolveCtx<'_>) -> Outcome {
    match policy {
        PolicyKind::LastWriteWins => {
            let order = lww_order(candidates);
            let winner = order.last().copied().unwrap_or(0);
            Outcome {
                policy,
                degraded: false,
                rollback_to: None,
                apply: ApplyPlan::Ordered(order),
                winner,
                rejected: Vec::new(),
            }
        }
        PolicyKind::HostAuthority => host_authority(candidates, ctx, false),
        PolicyKind::Merge => {
            let order = lww_order(candidates);
            let winner = order.last().copied().unwrap_or(0);
            let merged = merge_candidates(candidates, &order, ctx.merge_table);
            Outcome {
                policy,
                degraded: false,
                rollback_to: None,
                apply: ApplyPlan::Merged(merged),
                winner,
                rejected: Vec::new(),
            }
        }
        PolicyKind::Rollback => {
            let conflict_tick = candidates.iter().map(|c| c.tick).min().unwrap_or(0);
            let in_window = ctx
                .oldest_restorable
                .is_some_and(|oldest| conflict_tick >= oldest);
            if !in_window {
                let mut out = host_authority(candidates, ctx, true);
                out.degraded = true;
                return out;
            }
            // Earliest (tick, seq) candidate is applied on the restored
            // state; ties break toward the smaller origin id.
            let earliest = (0..candidates.len())
                .min_by(|&a, &b| {
                    let (ca, cb) = (&candidates[a], &candidates[b]);
                    (ca.tick, ca.seq, &ca.origin).cmp(&(cb.tick, cb.seq, &cb.origin))
                })
                .unwrap_or(0);
            Outcome {
                policy,
                degraded: false,
                rollback_to: Some(conflict_tick),
                apply: ApplyPlan::Single(earliest),
                winner: earliest,
                rejected: Vec::new(),
            }
        }
        PolicyKind::Vote => vote(candidates, ctx),
    }
}

fn host_authority(candidates: &[Candidate], ctx: &ResolveCtx<'_>, degraded: bool) -> Outcome {
    let host_candidates: Vec<usize> = ctx.host.map_or_else(Vec::new, |host| {
        (0..candidates.len())
            .filter(|&i| &candidates[i].origin == host)
            .collect()
    });
    if host_candidates.is_empty() {
        // No host candidate: fall back to last_write_wins wholesale.
        let order = lww_order(candidates);
        let winner = order.last().copied().unwrap_or(0);
        return Outcome {
            policy: PolicyKind::LastWriteWins,
            degraded,
            rollback_to: None,
            apply: ApplyPlan::Ordered(order),
            winner,
            rejected: Vec::new(),
        };
    }
    // Several host writes at the same tick resolve among themselves by
    // last-write-wins.
    let winner = if host_candidates.len() == 1 {
        host_candidates[0]
    } else {
        let subset: Vec<Candidate> = host_candidates
            .iter()
            .map(|&i| candidates[i].clone())
            .collect();
        host_candidates[lww_winner(&subset)]
    };
    let rejected = (0..candidates.len()).filter(|&i| i != winner).collect();
    Outcome {
        policy: PolicyKind::HostAuthority,
        degraded,
        rollback_to: None,
        apply: ApplyPlan::Single(winner),
        winner,
        rejected,
    }
}

fn vote(candidates: &[Candidate], ctx: &ResolveCtx<'_>) -> Outcome {
    let digests: Vec<Digest> = candidates.iter().map(|c| payload_digest(&c.payload)).collect();
    // Tally per digest, tracking each group's members in index order.
    let mut groups: Vec<(Digest, Vec<usize>)> = Vec::new();
    for (i, digest) in digests.iter().enumerate() {
        if let Some(group) = groups.iter_mut().find(|(d, _)| d == digest) {
            group.1.push(i);
        } else {
            groups.push((*digest, vec![i]));
        }
    }
    let needed = quorum(candidates.len());
    let top = groups.iter().map(|(_, members)| members.len()).max().unwrap_or(0);
    if top < needed {
        let mut out = host_authority(candidates, ctx, true);
        out.degraded = true;
        return out;
    }
    // Tied leading digests resolve by last-write-wins across their members.
    let leaders: Vec<&(Digest, Vec<usize>)> =
        groups.iter().filter(|(_, m)| m.len() == top).collect();
    let winning_members: &Vec<usize> = if leaders.len() == 1 {
        &leaders[0].1
    } else {
        let tied: Vec<usize> = leaders.iter().flat_map(|(_, m)| m.iter().copied()).collect();
        let subset: Vec<Candidate> = tied.iter().map(|&i| candidates[i].clone()).collect();
        let overall = tied[lww_winner(&subset)];
        let winning_digest = digests[overall];
        groups
            .iter()
            .find(|(d, _)| *d == winning_digest)
            .map_or(&leaders[0].1, |(_, m)| m)
    };
    // Members of the winning group carry identical payload bytes; pick the
    // lowest (origin, tick, seq) for a stable report.
    let winner = winning_members
        .iter()
        .copied()
        .min_by(|&a, &b| {
            let (ca, cb) = (&candidates[a], &candidates[b]);
            (&ca.origin, ca.tick, ca.seq).cmp(&(&cb.origin, cb.tick, cb.seq))
        })
        .unwrap_or(0);
    Outcome {
        policy: PolicyKind::Vote,
        degraded: false,
        rollback_to: None,
        apply: ApplyPlan::Single(winner),
        winner,
        rejected: Vec::new(),
    }
}

/// Folds candidate payloads in ascending last-write-wins order under the
/// merge table. Fields absent from the table take the latest value.
fn merge_candidates(
    candidates: &[Candidate],
    order: &[usize],
    table: &MergeTable,
) -> Payload {
    let mut iter = order.iter();
    let Some(&first) = iter.next() else {
        return Payload::new();
    };
    let mut acc = candidates[first].payload.clone();
    for &idx in iter {
        for (field, incoming) in &candidates[idx].payload {
            let rule = table.get(field).copied().unwrap_or(MergeRule::TakeLatest);
            let merged = match acc.get(field) {
                Some(current) => merge_field(rule, current, incoming),
                None => incoming.clone(),
            };
            acc.insert(field.clone(), merged);
        }
    }
    acc
}

fn merge_field(rule: MergeRule, current: &Value, incoming: &Value) -> Value {
    match rule {
        MergeRule::TakeLatest => incoming.clone(),
        MergeRule::TakeMin => pick_by(current, incoming, |a, b| a <= b),
        MergeRule::TakeMax => pick_by(current, incoming, |a, b| a >= b),
        MergeRule::Interpolate(alpha) => interpolate(current, incoming, alpha),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn pick_by(current: &Value, incoming: &Value, keep_current: impl Fn(f64, f64) -> bool) -> Value {
    match (numeric(current), numeric(incoming)) {
        (Some(a), Some(b)) if keep_current(a, b) => current.clone(),
        // Non-numeric fields degrade to take-latest.
        _ => incoming.clone(),
    }
}

fn interpolate(current: &Value, incoming: &Value, alpha: f64) -> Value {
    match (current, incoming) {
        (Value::Int(a), Value::Int(b)) => {
            let blended = (*a as f64).mul_add(1.0 - alpha, *b as f64 * alpha);
            Value::Int(blended.round() as i64)
        }
        _ => match (numeric(current), numeric(incoming)) {
            (Some(a), Some(b)) => Value::Float(a.mul_add(1.0 - alpha, b * alpha)),
            _ => incoming.clone(),
        },
    }
}
