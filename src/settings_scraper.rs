use std::sync::LazyLock;

use chrono::NaiveDate;
use log::debug;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    error::PortalError, literal_parser::parse_literal_prefix, text_manipulators::value_to_string,
};

// Start of `var appContext = ...` or `appContext.field = ...`; the value is
// read by the literal parser from where the match ends.
static APP_CONTEXT_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bappContext(?:\.(\w+))?\s*=\s*").expect("valid appContext regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| labelled_input("E-Mail"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| labelled_input("Мобильный телефон"));
static LAST_NAME: LazyLock<Regex> = LazyLock::new(|| labelled_input("Фамилия"));
static FIRST_NAME: LazyLock<Regex> = LazyLock::new(|| labelled_input("Имя"));
static PATRONYMIC: LazyLock<Regex> = LazyLock::new(|| labelled_input("Отчество"));
static BIRTH_DATE: LazyLock<Regex> = LazyLock::new(|| labelled_input("Дата рождения"));

fn labelled_input(label: &str) -> Regex {
    Regex::new(&format!(r#"{}.+?value="(.*?)""#, regex::escape(label)))
        .expect("valid profile regex")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserProfile {
    pub email: String,
    pub phone: String,
    pub last_name: String,
    pub first_name: String,
    pub patronymic: String,
    pub birth_date: Option<NaiveDate>,
}

/// Reads the account fields off the settings page. Fields that are not on
/// the page stay empty.
pub fn parse_profile(html: &str) -> UserProfile {
    let capture = |regex: &Regex| {
        regex
            .captures(html)
            .map(|caps| caps[1].to_string())
            .unwrap_or_default()
    };
    let birth_date = NaiveDate::parse_from_str(capture(&BIRTH_DATE).trim(), "%d.%m.%Y").ok();
    UserProfile {
        email: capture(&EMAIL),
        phone: capture(&PHONE),
        last_name: capture(&LAST_NAME),
        first_name: capture(&FIRST_NAME),
        patronymic: capture(&PATRONYMIC),
        birth_date,
    }
}

/// The school/year identifiers the portal embeds in its pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppContext {
    pub year_id: i64,
    pub school_id: i64,
    pub current_year: String,
    pub date_format: String,
    pub school_name: String,
    /// Sent back to the portal untouched with every report request.
    pub server_time_zone: Value,
}

/// Collects the `appContext` declaration and its field assignments from
/// inline script and reads them as data.
///
/// The declaration has to be pure literal syntax. A field assignment whose
/// value does not start with a literal (a function, a variable reference) is
/// left out; one that starts as a literal and then breaks is an error.
pub fn parse_app_context_object(html: &str) -> Result<Map<String, Value>, PortalError> {
    let mut context: Option<Map<String, Value>> = None;
    let mut cursor = 0;

    while let Some(caps) = APP_CONTEXT_HEAD.captures(&html[cursor..]) {
        let value_start = cursor + caps.get(0).map_or(0, |head| head.end());
        let source = &html[value_start..];
        cursor = value_start;
        // `==` is a comparison.
        if source.starts_with('=') {
            continue;
        }

        let Some(field) = caps.get(1).map(|field| field.as_str()) else {
            let (value, end) = parse_literal_prefix(source)
                .map_err(|error| PortalError::extraction(format!("appContext: {error}")))?;
            if !statement_ends(&source[end..]) {
                return Err(PortalError::extraction("appContext declaration is not a literal"));
            }
            let Value::Object(map) = value else {
                return Err(PortalError::extraction("appContext is not an object"));
            };
            context = Some(map);
            cursor = value_start + end;
            continue;
        };

        // Assignments before the declaration have nothing to attach to.
        let Some(map) = context.as_mut() else {
            continue;
        };
        if field.starts_with("ya") {
            continue;
        }
        match parse_literal_prefix(source) {
            Ok((value, end)) if statement_ends(&source[end..]) => {
                map.insert(field.to_string(), value);
                cursor = value_start + end;
            }
            Ok(_) => debug!("skipping appContext.{field}: expression"),
            Err(error) if error.position == 0 => debug!("skipping appContext.{field}: {error}"),
            Err(error) => {
                return Err(PortalError::extraction(format!("appContext.{field}: {error}")));
            }
        }
    }

    context.ok_or_else(|| PortalError::extraction("appContext declaration not found"))
}

fn statement_ends(rest: &str) -> bool {
    let rest = rest.trim_start_matches([' ', '\t']);
    rest.is_empty() || rest.starts_with([';', '\n', '\r', '<'])
}

pub fn parse_app_context(html: &str) -> Result<AppContext, PortalError> {
    let map = parse_app_context_object(html)?;
    let int_field = |name: &str| -> Result<i64, PortalError> {
        let value = match map.get(name) {
            Some(Value::Number(number)) => number.as_i64(),
            Some(Value::String(text)) => text.trim().parse().ok(),
            _ => None,
        };
        value.ok_or_else(|| PortalError::extraction(format!("appContext.{name} is missing")))
    };
    let text_field = |name: &str| map.get(name).map(value_to_string).unwrap_or_default();

    Ok(AppContext {
        year_id: int_field("yearId")?,
        school_id: int_field("schoolId")?,
        current_year: text_field("currYear"),
        date_format: text_field("dateFormat"),
        school_name: text_field("fullSchoolName"),
        server_time_zone: map.get("serverTimeZone").cloned().unwrap_or(Value::Null),
    })
}
