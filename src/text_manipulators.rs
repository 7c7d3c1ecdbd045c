use std::sync::LazyLock;

use chrono::{Duration, NaiveDate};
use regex::Regex;
use scraper::ElementRef;

static SHORT_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{1,2})").expect("valid date regex"));
static LEADING_NON_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\D+").expect("valid mark regex"));

/// Visible text of a node, trimmed, with `&nbsp;` folded into spaces.
pub fn extract_text(node: ElementRef) -> String {
    node.text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

/// `dd.mm.yy` as printed in report tables. Years are always 20yy.
pub fn parse_short_date(text: &str) -> Option<NaiveDate> {
    let caps = SHORT_DATE.captures(text)?;
    let day = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
}

/// Average marks come as `Средняя: 4,57`: comma decimals, label in front.
pub fn normalize_mark(text: &str) -> String {
    let text = text.trim().replacen(',', ".", 1);
    LEADING_NON_DIGITS.replace(&text, "").into_owned()
}

pub fn parse_mark(text: &str) -> Option<f64> {
    let normalized = normalize_mark(text);
    if normalized.is_empty() {
        return None;
    }
    normalized.parse().ok()
}

/// Calendar date with overflow carried into the next month, so `31.04`
/// lands on May 1st and `29.02` on March 1st of a common year.
pub fn rolling_date(year: i32, month0: u32, day: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month0 + 1, 1)?;
    first.checked_add_signed(Duration::days(i64::from(day) - 1))
}

/// `YYYY-MM-DD`
pub fn iso_day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Midnight UTC timestamp the portal expects in report filters.
pub fn iso_timestamp(date: NaiveDate) -> String {
    date.format("%Y-%m-%dT00:00:00.000Z").to_string()
}

/// Percent-encodes everything outside the URI-safe set, leaving reserved
/// characters such as `@`, `&` and `=` untouched.
pub fn encode_uri(text: &str) -> String {
    percent_encode(text, b";,/?:@&=+$-_.!~*'()#")
}

/// Percent-encodes everything except unreserved characters, for one query
/// value.
pub fn encode_uri_component(text: &str) -> String {
    percent_encode(text, b"-_.!~*'()")
}

fn percent_encode(text: &str, keep: &[u8]) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || keep.contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Portal ids arrive both as JSON numbers and as strings.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
