use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field names the fingerprinting and merge logic know about. Anything else
/// lands in the open extension bag and is merged by shape.
pub mod keys {
    pub const ID: &str = "_id";
    pub const PLACE_ID: &str = "place_id";
    pub const PHONE_NUMBERS: &str = "phone_numbers";
    pub const PHONE: &str = "phone";
    pub const NAME: &str = "name";
    pub const ADDRESS: &str = "address";
    pub const WEBSITE: &str = "website";
    pub const COORDINATES: &str = "coordinates";
    pub const RATING: &str = "rating";
    pub const DESCRIPTION: &str = "description";
    pub const EMAILS: &str = "emails";
    pub const SOCIAL_MEDIA: &str = "social_media";
    pub const SOCIAL_LINKS: &str = "social_links";
    pub const PHOTOS: &str = "photos";
    pub const RECENT_REVIEWS: &str = "recent_reviews";
    pub const AMENITIES: &str = "amenities";
    pub const CATEGORY: &str = "category";
    pub const PRICE_RANGE: &str = "price_range";
}

/// Identity of a real-world entity, derived from a record's strongest field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One collected entity. Serializes as a flat JSON object with the
/// fingerprint stored under `_id`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, mostly for sources and tests.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Non-empty string value of `key`, trimmed.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Raw string value of `key`, empty when missing or not a string.
    pub fn raw_text(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !is_empty(v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Python-style truthiness used by the merge and fingerprint cascade:
/// null, empty strings and empty collections count as absent.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
