// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Reduce a weave into bot state.
//!
//! Every bot touched by a batch of inserts is recomputed from the weave
//! rather than patched, so the result is the same whatever order the atoms
//! arrived in:
//!
//! - a bot exists while at least one of its create-record atoms is visible
//! - a tag takes the visible set-value with the greatest
//!   `(seq, site, priority)` across every visible field of that name
//! - fields with a space reduce into that space's masks the same way

use std::cmp::Ordering;

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::bot::Bot;
use crate::bot::PartitionState;
use crate::bot::StateDiff;
use crate::bot::TagValue;
use super::atom::AtomOp;
use super::primitives::AtomId;
use super::weave::InsertResult;
use super::weave::Weave;

/// A field atom and the value currently winning on it.
#[derive(Clone, Debug)]
pub struct LiveField<'a> {
    pub field: &'a AtomId,
    pub value: Option<(&'a AtomId, &'a TagValue)>,
}

/// Visible fields of a bot, by (space, tag name).
pub fn live_fields<'a>(weave: &'a Weave, bot_id: &str) -> FxHashMap<(Option<&'a str>, &'a str), Vec<LiveField<'a>>> {
    let mut fields: FxHashMap<(Option<&'a str>, &'a str), Vec<LiveField<'a>>> = FxHashMap::default();
    for record in weave.record_atoms(bot_id) {
        if !weave.is_visible(record) {
            continue;
        }
        for field_id in weave.children(record) {
            let Some(field) = weave.get(field_id) else { continue };
            let AtomOp::CreateField { name, space } = &field.value else { continue };
            if weave.is_deleted(field_id) {
                continue;
            }
            let mut best: Option<(&AtomId, &TagValue)> = None;
            for value_id in weave.children(field_id) {
                if weave.is_deleted(value_id) {
                    continue;
                }
                let Some(atom) = weave.get(value_id) else { continue };
                let AtomOp::SetValue { value } = &atom.value else { continue };
                best = match best {
                    Some((id, _)) if id.recency_cmp(value_id) == Ordering::Greater => best,
                    _ => Some((&atom.id, value)),
                };
            }
            fields
                .entry((space.as_deref(), name.as_str()))
                .or_default()
                .push(LiveField { field: &field.id, value: best });
        }
    }
    return fields;
}

/// Compute one bot from the weave. `None` when no record is visible.
pub fn reduce_bot(weave: &Weave, bot_id: &str, space: Option<&str>) -> Option<Bot> {
    if !weave.record_atoms(bot_id).iter().any(|record| weave.is_visible(record)) {
        return None;
    }
    let mut bot = Bot::new(bot_id);
    bot.space = space.map(str::to_string);
    for ((mask_space, name), fields) in live_fields(weave, bot_id) {
        let winner = fields
            .iter()
            .filter_map(|field| field.value)
            .max_by(|(a, _), (b, _)| a.recency_cmp(b));
        let Some((_, value)) = winner else { continue };
        if value.is_null() {
            continue;
        }
        match mask_space {
            Some(mask_space) => {
                bot.masks.entry(mask_space.to_string()).or_default().insert(name.to_string(), value.clone());
            }
            None => {
                bot.tags.insert(name.to_string(), value.clone());
            }
        }
    }
    return Some(bot);
}

/// Build a full snapshot of every visible bot.
pub fn reduce_all(weave: &Weave, space: Option<&str>) -> PartitionState {
    let bots = weave.record_ids().filter_map(|id| reduce_bot(weave, id, space));
    return PartitionState::from_bots(bots);
}

/// Apply a batch of insert results to `prior`.
///
/// Returns the new snapshot and what visibly changed, listing bots in the
/// order their atoms landed.
pub fn reduce(weave: &Weave, prior: &PartitionState, delta: &[InsertResult]) -> (PartitionState, StateDiff) {
    return reduce_in_space(weave, prior, delta, None);
}

/// Like `reduce`, stamping bots with the partition space.
pub fn reduce_in_space(
    weave: &Weave,
    prior: &PartitionState,
    delta: &[InsertResult],
    space: Option<&str>,
) -> (PartitionState, StateDiff) {
    let mut seen = FxHashSet::default();
    let mut touched = Vec::new();
    for result in delta {
        if matches!(result, InsertResult::Duplicate { .. }) {
            continue;
        }
        if let Some(bot_id) = weave.bot_of(result.id()) {
            if seen.insert(bot_id) {
                touched.push(bot_id);
            }
        }
    }

    let mut next = prior.clone();
    let mut diff = StateDiff::default();
    for bot_id in touched {
        let after = reduce_bot(weave, bot_id, space);
        diff.push(bot_id, prior.get(bot_id), after.as_ref());
        match after {
            Some(bot) => next.insert(bot),
            None => {
                next.remove(bot_id);
            }
        }
    }
    return (next, diff);
}
