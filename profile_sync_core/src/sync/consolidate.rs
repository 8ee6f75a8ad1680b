//! Collapse a page of contact-preference changes to one entry per person.

use crate::sync::data_types::PersonContactPreference;
use crate::sync::models::DecodedChange;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

type Recency = [Option<DateTime<Utc>>; 5];

// Field order is the tie-break order.
fn recency(p: &PersonContactPreference) -> Recency {
    [
        p.email_last_changed,
        p.email_last_verified,
        p.mobile_last_changed,
        p.mobile_last_verified,
        p.language_last_changed,
    ]
}

/// Keep the most recent change per person.
///
/// Recency compares the email changed, email verified, mobile changed, mobile
/// verified, and language changed timestamps in that order. A missing
/// timestamp is older than any present one. Full ties keep the earliest entry.
/// Survivors stay in input order, so the function is idempotent.
pub fn consolidate(
    entries: Vec<DecodedChange<PersonContactPreference>>,
) -> Vec<DecodedChange<PersonContactPreference>> {
    let mut winners: HashMap<String, (usize, Recency)> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        let key = entry.payload.person_key();
        let candidate = recency(&entry.payload);
        winners
            .entry(key)
            .and_modify(|best| {
                if candidate > best.1 {
                    *best = (idx, candidate);
                }
            })
            .or_insert((idx, candidate));
    }

    let mut keep = vec![false; entries.len()];
    for (idx, _) in winners.into_values() {
        keep[idx] = true;
    }
    entries
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, kept)| kept.then_some(entry))
        .collect()
}
