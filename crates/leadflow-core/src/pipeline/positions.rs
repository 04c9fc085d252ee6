//! Sparse step positions.
//!
//! Steps are ordered by plain integers with gaps (10, 20, 30, ...). New steps
//! take the smallest free integers next to an anchor; when the gap is used
//! up the whole run is renumbered to multiples of [`POSITION_STRIDE`]
//! (order preserved) and the search is retried once.

use std::collections::BTreeSet;

use leadflow_types::id::StepId;
use leadflow_types::run::RunStep;
use thiserror::Error;

/// Spacing between consecutive positions after planning or renumbering.
pub const POSITION_STRIDE: i64 = 10;

/// Gap assumed after the last step when inserting behind it.
pub const TAIL_GAP: i64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("anchor step {0} is not part of the run")]
    AnchorMissing(StepId),

    #[error("no room for {needed} steps next to position {position} even after renumbering")]
    Exhausted { position: i64, needed: usize },
}

/// Where new steps go relative to an existing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    After(StepId),
    Before(StepId),
}

/// Positions for the new steps plus any renumbering that must be applied first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertionPlan {
    pub renumber: Vec<(StepId, i64)>,
    pub positions: Vec<i64>,
}

/// Choose `count` positions adjacent to `anchor`, ascending.
pub fn plan_insertion(
    steps: &[RunStep],
    anchor: Anchor,
    count: usize,
) -> Result<InsertionPlan, PositionError> {
    let mut ordered: Vec<(StepId, i64)> = steps.iter().map(|s| (s.id, s.position)).collect();
    ordered.sort_by_key(|(_, position)| *position);

    if let Some(positions) = slots_near(&ordered, anchor, count)? {
        return Ok(InsertionPlan {
            renumber: Vec::new(),
            positions,
        });
    }

    let renumbered = renumber(&ordered);
    match slots_near(&renumbered, anchor, count)? {
        Some(positions) => Ok(InsertionPlan {
            renumber: renumbered
                .into_iter()
                .zip(ordered.iter())
                .filter(|((_, new), (_, old))| new != old)
                .map(|(entry, _)| entry)
                .collect(),
            positions,
        }),
        None => {
            let position = anchor_position(&renumbered, anchor)?;
            Err(PositionError::Exhausted {
                position,
                needed: count,
            })
        }
    }
}

/// Position for a step appended after every existing step.
pub fn append_position(steps: &[RunStep]) -> i64 {
    steps.iter().map(|s| s.position).max().unwrap_or(0) + POSITION_STRIDE
}

/// Renumber ordered `(id, position)` pairs to 10, 20, 30, ...
pub fn renumber(ordered: &[(StepId, i64)]) -> Vec<(StepId, i64)> {
    ordered
        .iter()
        .enumerate()
        .map(|(idx, (id, _))| (*id, (idx as i64 + 1) * POSITION_STRIDE))
        .collect()
}

fn anchor_position(ordered: &[(StepId, i64)], anchor: Anchor) -> Result<i64, PositionError> {
    let id = match anchor {
        Anchor::After(id) | Anchor::Before(id) => id,
    };
    ordered
        .iter()
        .find(|(step_id, _)| *step_id == id)
        .map(|(_, position)| *position)
        .ok_or(PositionError::AnchorMissing(id))
}

fn slots_near(
    ordered: &[(StepId, i64)],
    anchor: Anchor,
    count: usize,
) -> Result<Option<Vec<i64>>, PositionError> {
    let position = anchor_position(ordered, anchor)?;
    let (lower, upper) = match anchor {
        Anchor::After(_) => {
            let next = ordered
                .iter()
                .map(|(_, p)| *p)
                .find(|p| *p > position)
                .unwrap_or(position + TAIL_GAP);
            (position, next)
        }
        Anchor::Before(_) => {
            let prev = ordered
                .iter()
                .map(|(_, p)| *p)
                .filter(|p| *p < position)
                .max()
                .unwrap_or(0);
            (prev, position)
        }
    };

    let used: BTreeSet<i64> = ordered.iter().map(|(_, p)| *p).collect();
    let free: Vec<i64> = ((lower + 1)..upper)
        .filter(|p| !used.contains(p))
        .take(count)
        .collect();

    Ok((free.len() == count).then_some(free))
}
