//! Request weighting for price calls.
//!
//! The exchange charges every `listMarketBook` call `cost(fields) * markets`
//! and rejects calls above [`MAX_REQUEST_WEIGHT`]. Some projections are
//! cheaper when requested together than their individual weights suggest.

use std::collections::BTreeSet;

pub const MAX_REQUEST_WEIGHT: u32 = 200;

/// Weight charged for a projection the table does not know.
pub const UNKNOWN_FIELD_WEIGHT: u32 = 2;

/// Weight used when the request carries no weighted projection at all.
pub const NULL_PROJECTION_WEIGHT: u32 = 2;

const FIELD_WEIGHTS: &[(&str, u32)] = &[
    ("EX_BEST_OFFERS", 5),
    ("EX_ALL_OFFERS", 17),
    ("EX_TRADED", 17),
    ("SP_AVAILABLE", 3),
    ("SP_TRADED", 7),
];

const COMBINED_WEIGHTS: &[(&[&str], u32)] = &[
    (&["EX_BEST_OFFERS", "EX_TRADED"], 20),
    (&["EX_ALL_OFFERS", "EX_TRADED"], 32),
];

pub fn field_weight(field: &str) -> u32 {
    FIELD_WEIGHTS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, w)| *w)
        .unwrap_or(UNKNOWN_FIELD_WEIGHT)
}

fn sum_weights<'a>(fields: impl Iterator<Item = &'a str>) -> u32 {
    fields.map(field_weight).sum()
}

/// Cost of one market under the requested projections.
///
/// When the request covers a known combination, the combination's weight
/// replaces its members; the cheapest matching combination wins.
pub fn request_cost<S: AsRef<str>>(fields: &[S]) -> u32 {
    let requested: BTreeSet<&str> = fields.iter().map(|f| f.as_ref()).collect();

    let combo_cost = COMBINED_WEIGHTS
        .iter()
        .filter(|(members, _)| members.iter().all(|m| requested.contains(m)))
        .map(|(members, weight)| {
            let rest = requested.iter().copied().filter(|f| !members.contains(f));
            weight + sum_weights(rest)
        })
        .min();

    let total = combo_cost.unwrap_or_else(|| sum_weights(requested.iter().copied()));
    if total == 0 {
        NULL_PROJECTION_WEIGHT
    } else {
        total
    }
}

/// Maximum number of markets per price call for the given projections. Never zero.
pub fn batch_size<S: AsRef<str>>(fields: &[S]) -> usize {
    let cost = request_cost(fields);
    ((MAX_REQUEST_WEIGHT / cost) as usize).max(1)
}
