use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::{HeaderMap, SET_COOKIE};

// `name=value` at the start of a Set-Cookie line, value ends at the first `;`.
static COOKIE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^=]+)=([^;]+)").expect("valid cookie regex"));

/// Session cookies collected from `Set-Cookie` headers.
///
/// Values are stored exactly as the portal sent them and never expire on our
/// side. Insertion order is kept so the `Cookie` header is stable.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    entries: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every `Set-Cookie` header of a response into the jar.
    pub fn accumulate(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(line) = value.to_str() else {
                continue;
            };
            self.accumulate_line(line);
        }
    }

    pub fn accumulate_line(&mut self, line: &str) {
        let Some(caps) = COOKIE_PAIR.captures(line) else {
            return;
        };
        let (name, value) = (&caps[1], &caps[2]);
        self.set(name, value);
    }

    fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `name=value; name2=value2`
    pub fn header_value(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
