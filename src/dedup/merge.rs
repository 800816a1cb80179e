use std::collections::HashMap;

use itertools::Itertools;
use serde_json::{Map, Value};

use crate::record::{is_empty, keys, Record};

/// How values of one field combine when the same entity is seen again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeRule {
    /// Set union, capped.
    List,
    /// Key-wise union, later write wins.
    Map,
    /// Highest number.
    Max,
    /// Longest string.
    Longest,
    /// Most frequently seen value, ties to the first one seen.
    Majority,
}

const LIST_KEYS: &[&str] = &[
    keys::PHONE_NUMBERS,
    keys::EMAILS,
    keys::SOCIAL_LINKS,
    keys::PHOTOS,
    keys::RECENT_REVIEWS,
    keys::AMENITIES,
];

/// Rule for `key`; fields outside the reserved set are classified by shape.
pub fn rule_for(key: &str, value: &Value) -> MergeRule {
    match key {
        k if LIST_KEYS.contains(&k) => MergeRule::List,
        keys::SOCIAL_MEDIA => MergeRule::Map,
        keys::RATING => MergeRule::Max,
        keys::DESCRIPTION => MergeRule::Longest,
        keys::PLACE_ID
        | keys::PHONE
        | keys::NAME
        | keys::ADDRESS
        | keys::WEBSITE
        | keys::COORDINATES
        | keys::CATEGORY
        | keys::PRICE_RANGE => MergeRule::Majority,
        _ => match value {
            Value::Array(_) => MergeRule::List,
            Value::Object(_) => MergeRule::Map,
            _ => MergeRule::Majority,
        },
    }
}

/// Tally of every value seen for the majority-vote fields of one entity,
/// kept in first-seen order so ties resolve to the earliest value.
#[derive(Debug, Default, Clone)]
pub struct Votes {
    fields: HashMap<String, Vec<(Value, usize)>>,
}

impl Votes {
    pub fn cast(&mut self, key: &str, value: &Value) {
        let tally = self.fields.entry(key.to_string()).or_default();
        match tally.iter_mut().find(|(seen, _)| seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value.clone(), 1)),
        }
    }

    pub fn winner(&self, key: &str) -> Option<&Value> {
        let tally = self.fields.get(key)?;
        let mut best: Option<&(Value, usize)> = None;
        for entry in tally {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(value, _)| value)
    }

    /// Seed tallies from the first sighting of an entity.
    pub fn seed(record: &Record) -> Self {
        let mut votes = Votes::default();
        for (key, value) in &record.fields {
            if !is_empty(value) && rule_for(key, value) == MergeRule::Majority {
                votes.cast(key, value);
            }
        }
        votes
    }
}

/// Fold `incoming` into `base`, returning the merged record. `votes` must
/// describe every earlier sighting folded into `base`.
pub fn merge_into(base: &Record, incoming: &Record, votes: &mut Votes, list_cap: usize) -> Record {
    let mut merged = base.clone();
    if merged.fingerprint.is_none() {
        merged.fingerprint = incoming.fingerprint.clone();
    }

    for (key, value) in &incoming.fields {
        if is_empty(value) {
            continue;
        }
        let current = base.fields.get(key).filter(|v| !is_empty(v));
        let rule = rule_for(key, current.unwrap_or(value));
        let next = match (rule, current) {
            (MergeRule::Majority, _) => {
                votes.cast(key, value);
                votes.winner(key).cloned()
            }
            (MergeRule::List, None) => Some(union_list(&Value::Array(Vec::new()), value, list_cap)),
            (_, None) => Some(value.clone()),
            (MergeRule::List, Some(current)) => Some(union_list(current, value, list_cap)),
            (MergeRule::Map, Some(current)) => Some(union_map(current, value)),
            (MergeRule::Max, Some(current)) => Some(max_number(current, value)),
            (MergeRule::Longest, Some(current)) => Some(longest(current, value)),
        };
        if let Some(next) = next {
            merged.fields.insert(key.clone(), next);
        }
    }
    merged
}

fn as_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| !is_empty(v)).cloned().collect(),
        other => vec![other.clone()],
    }
}

fn union_list(current: &Value, incoming: &Value, cap: usize) -> Value {
    let items = as_items(current)
        .into_iter()
        .chain(as_items(incoming))
        .unique_by(|v| v.to_string())
        .take(cap)
        .collect();
    Value::Array(items)
}

fn union_map(current: &Value, incoming: &Value) -> Value {
    match (current, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out: Map<String, Value> = a.clone();
            for (k, v) in b {
                if !is_empty(v) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        (Value::Object(_), _) => current.clone(),
        _ => incoming.clone(),
    }
}

fn max_number(current: &Value, incoming: &Value) -> Value {
    match (current.as_f64(), incoming.as_f64()) {
        (Some(a), Some(b)) if b > a => incoming.clone(),
        (None, Some(_)) => incoming.clone(),
        _ => current.clone(),
    }
}

fn longest(current: &Value, incoming: &Value) -> Value {
    let len = |v: &Value| v.as_str().map_or(0, |s| s.chars().count());
    if len(incoming) > len(current) {
        incoming.clone()
    } else {
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn merge(a: &Record, b: &Record) -> Record {
        let mut votes = Votes::seed(a);
        merge_into(a, b, &mut votes, 10)
    }

    fn sorted(v: &Value) -> Vec<String> {
        let mut out: Vec<String> = v.as_array().unwrap().iter().map(|x| x.to_string()).collect();
        out.sort();
        out
    }

    #[test]
    fn list_union_commutes() {
        let a = Record::new().with(keys::EMAILS, json!(["a@x.com", "b@x.com"]));
        let b = Record::new().with(keys::EMAILS, json!(["b@x.com", "c@x.com"]));
        let ab = merge(&a, &b);
        let ba = merge(&b, &a);
        assert_eq!(sorted(&ab.fields[keys::EMAILS]), sorted(&ba.fields[keys::EMAILS]));
        assert_eq!(ab.fields[keys::EMAILS].as_array().unwrap().len(), 3);
    }

    #[test]
    fn list_capped() {
        let a = Record::new().with(keys::PHOTOS, json!((0..8).collect::<Vec<_>>()));
        let b = Record::new().with(keys::PHOTOS, json!((5..15).collect::<Vec<_>>()));
        let merged = merge(&a, &b);
        assert_eq!(merged.fields[keys::PHOTOS].as_array().unwrap().len(), 10);
    }

    #[test]
    fn list_new_to_base_is_capped_and_deduped() {
        let base = Record::new().with(keys::NAME, "x");
        let photos = Record::new().with(keys::PHOTOS, json!((0..15).collect::<Vec<_>>()));
        assert_eq!(merge(&base, &photos).fields[keys::PHOTOS].as_array().unwrap().len(), 10);

        let emails = Record::new().with(keys::EMAILS, json!(["a@x", "a@x"]));
        assert_eq!(merge(&base, &emails).fields[keys::EMAILS], json!(["a@x"]));
    }

    #[test]
    fn scalar_joins_list() {
        let a = Record::new().with(keys::PHONE_NUMBERS, json!(["555-111-2222"]));
        let b = Record::new().with(keys::PHONE_NUMBERS, "555-333-4444");
        let merged = merge(&a, &b);
        assert_eq!(merged.fields[keys::PHONE_NUMBERS], json!(["555-111-2222", "555-333-4444"]));
    }

    #[test]
    fn map_later_wins() {
        let a = Record::new().with(keys::SOCIAL_MEDIA, json!({"twitter": "@old", "facebook": "fb"}));
        let b = Record::new().with(keys::SOCIAL_MEDIA, json!({"twitter": "@new", "instagram": "ig"}));
        let merged = merge(&a, &b);
        assert_eq!(
            merged.fields[keys::SOCIAL_MEDIA],
            json!({"twitter": "@new", "facebook": "fb", "instagram": "ig"})
        );
    }

    #[test]
    fn rating_takes_max() {
        let a = Record::new().with(keys::RATING, 4.1);
        let b = Record::new().with(keys::RATING, 4.6);
        assert_eq!(merge(&a, &b).fields[keys::RATING], json!(4.6));
        assert_eq!(merge(&b, &a).fields[keys::RATING], json!(4.6));
    }

    #[test]
    fn description_takes_longest() {
        let a = Record::new().with(keys::DESCRIPTION, "Pizza");
        let b = Record::new().with(keys::DESCRIPTION, "Wood-fired pizza since 1975");
        assert_eq!(merge(&a, &b).fields[keys::DESCRIPTION], json!("Wood-fired pizza since 1975"));
    }

    #[test]
    fn majority_with_first_seen_ties() {
        let first = Record::new().with(keys::CATEGORY, "Pizzeria");
        let mut votes = Votes::seed(&first);

        let merged = merge_into(&first, &Record::new().with(keys::CATEGORY, "Restaurant"), &mut votes, 10);
        assert_eq!(merged.fields[keys::CATEGORY], json!("Pizzeria"));

        let merged = merge_into(&merged, &Record::new().with(keys::CATEGORY, "Restaurant"), &mut votes, 10);
        assert_eq!(merged.fields[keys::CATEGORY], json!("Restaurant"));
    }

    #[test]
    fn empty_incoming_keeps_existing() {
        let a = Record::new().with(keys::WEBSITE, "joes.com");
        let b = Record::new().with(keys::WEBSITE, "");
        assert_eq!(merge(&a, &b).fields[keys::WEBSITE], json!("joes.com"));
    }

    #[test]
    fn extension_fields_by_shape() {
        assert_eq!(rule_for("tags", &json!(["a"])), MergeRule::List);
        assert_eq!(rule_for("hours", &json!({"mon": "9-5"})), MergeRule::Map);
        assert_eq!(rule_for("zip_code", &json!("10014")), MergeRule::Majority);
    }
}
