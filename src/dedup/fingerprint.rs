use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::record::{is_empty, keys, Fingerprint, Record};

/// Identity of `record`, taken from the strongest signal present:
/// external id, phone, name + address, website domain, coordinates, and
/// finally a hash of the raw name and address. Never fails.
pub fn fingerprint(record: &Record) -> Fingerprint {
    by_place_id(record)
        .or_else(|| by_phone(record))
        .or_else(|| by_name_address(record))
        .or_else(|| by_domain(record))
        .or_else(|| by_coordinates(record))
        .map(Fingerprint::new)
        .unwrap_or_else(|| fallback(record))
}

fn by_place_id(record: &Record) -> Option<String> {
    let id = match record.get(keys::PLACE_ID)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then(|| format!("id:{id}"))
}

fn by_phone(record: &Record) -> Option<String> {
    let digits = normalize_phone(primary_phone(record)?)?;
    Some(format!("phone:{digits}"))
}

fn by_name_address(record: &Record) -> Option<String> {
    let name = normalize_text(record.raw_text(keys::NAME));
    let address = normalize_text(record.raw_text(keys::ADDRESS));
    if name.is_empty() || address.is_empty() {
        return None;
    }
    Some(format!("name_addr:{}", md5_hex(&format!("{name}|{address}"))))
}

fn by_domain(record: &Record) -> Option<String> {
    let domain = extract_domain(record.text(keys::WEBSITE)?)?;
    Some(format!("domain:{domain}"))
}

fn by_coordinates(record: &Record) -> Option<String> {
    let coords = record.get(keys::COORDINATES)?.as_object()?;
    let lat = coords.get("lat").and_then(Value::as_f64)?;
    let lng = coords.get("lng").and_then(Value::as_f64)?;
    if lat == 0.0 || lng == 0.0 {
        return None;
    }
    Some(format!("coords:{lat:.4},{lng:.4}"))
}

fn fallback(record: &Record) -> Fingerprint {
    let raw = format!(
        "{}|{}",
        record.raw_text(keys::NAME),
        record.raw_text(keys::ADDRESS)
    );
    Fingerprint::new(md5_hex(&raw))
}

/// First phone number: head of `phone_numbers` (list or string), else `phone`.
fn primary_phone(record: &Record) -> Option<&str> {
    let from_list = match record.get(keys::PHONE_NUMBERS) {
        Some(Value::Array(items)) => items.iter().find(|v| !is_empty(v)).and_then(Value::as_str),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    };
    from_list
        .filter(|s| !s.trim().is_empty())
        .or_else(|| record.text(keys::PHONE))
}

/// Digits only; an 11-digit number with leading country code `1` loses it.
/// Anything shorter than 10 digits is not a usable identity.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let mut digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }
    (digits.len() >= 10).then_some(digits)
}

static PUNCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase, punctuation stripped, whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let stripped = PUNCT_RE.replace_all(&lower, "");
    SPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Host of a website URL without `www.`; bare hosts are accepted.
pub fn extract_domain(website: &str) -> Option<String> {
    let website = website.trim();
    let parsed = Url::parse(website)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("http://{website}")).ok())?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full() -> Record {
        Record::new()
            .with(keys::PLACE_ID, "ChIJ123")
            .with(keys::PHONE_NUMBERS, json!(["+1 (555) 123-4567"]))
            .with(keys::NAME, "Joe's Pizza")
            .with(keys::ADDRESS, "7 Carmine St")
            .with(keys::WEBSITE, "https://www.joespizza.com/menu")
            .with(keys::COORDINATES, json!({"lat": 40.730_612, "lng": -74.002_1}))
    }

    #[test]
    fn deterministic() {
        let r = full();
        assert_eq!(fingerprint(&r), fingerprint(&r));
    }

    #[test]
    fn cascade_order() {
        let mut r = full();
        assert_eq!(fingerprint(&r).as_str(), "id:ChIJ123");

        r.fields.remove(keys::PLACE_ID);
        assert_eq!(fingerprint(&r).as_str(), "phone:5551234567");

        r.fields.remove(keys::PHONE_NUMBERS);
        assert!(fingerprint(&r).as_str().starts_with("name_addr:"));

        r.fields.remove(keys::ADDRESS);
        assert_eq!(fingerprint(&r).as_str(), "domain:joespizza.com");

        r.fields.remove(keys::WEBSITE);
        assert_eq!(fingerprint(&r).as_str(), "coords:40.7306,-74.0021");

        r.fields.remove(keys::COORDINATES);
        assert_eq!(fingerprint(&r).as_str(), md5_hex("Joe's Pizza|"));
    }

    #[test]
    fn empty_record_still_fingerprints() {
        assert_eq!(fingerprint(&Record::new()).as_str(), md5_hex("|"));
    }

    #[test]
    fn phone_rules() {
        assert_eq!(normalize_phone("1-555-123-4567").as_deref(), Some("5551234567"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("442079460958"));
        assert_eq!(normalize_phone("555-1234"), None);
    }

    #[test]
    fn short_phone_falls_through() {
        let r = Record::new()
            .with(keys::PHONE_NUMBERS, json!(["555-1234"]))
            .with(keys::WEBSITE, "example.org");
        assert_eq!(fingerprint(&r).as_str(), "domain:example.org");
    }

    #[test]
    fn phone_field_used_when_list_missing() {
        let r = Record::new().with(keys::PHONE, "(555) 987 6543");
        assert_eq!(fingerprint(&r).as_str(), "phone:5559876543");
    }

    #[test]
    fn name_address_ignores_case_and_punctuation() {
        let a = Record::new().with(keys::NAME, "Joe's  Pizza!").with(keys::ADDRESS, "7 Carmine St.");
        let b = Record::new().with(keys::NAME, "joes pizza").with(keys::ADDRESS, "7 carmine st");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn domain_forms() {
        assert_eq!(extract_domain("http://www.Example.com/a?b").as_deref(), Some("example.com"));
        assert_eq!(extract_domain("shop.example.com").as_deref(), Some("shop.example.com"));
    }

    #[test]
    fn zero_coordinates_ignored() {
        let r = Record::new()
            .with(keys::NAME, "x")
            .with(keys::COORDINATES, json!({"lat": 0.0, "lng": 12.5}));
        assert_eq!(fingerprint(&r).as_str(), md5_hex("x|"));
    }

    #[test]
    fn numeric_place_id() {
        let r = Record::new().with(keys::PLACE_ID, 42);
        assert_eq!(fingerprint(&r).as_str(), "id:42");
    }
}
