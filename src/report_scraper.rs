use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use crate::{
    error::PortalError,
    text_manipulators::{extract_text, parse_mark, parse_short_date, rolling_date},
};

static PRINT_ROWS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.table-print tr").expect("valid row selector"));
static TOTALS_ROW: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("table.table-print tr.totals").expect("valid totals selector")
});
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}").expect("valid year regex"));

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportAssignment {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub date: NaiveDate,
    pub issue_date: NaiveDate,
    pub mark: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectReport {
    pub assignments: Vec<ReportAssignment>,
    pub middle_mark: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalMark {
    pub date: NaiveDate,
    /// Everything the cell holds for that day, e.g. `["5", "4"]` or `["н"]`.
    pub marks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRow {
    pub name: String,
    pub middle_mark: Option<f64>,
    pub assignments: Vec<JournalMark>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Birthday {
    pub date: NaiveDate,
    pub name: String,
    pub role: String,
    #[serde(rename = "class")]
    pub class_name: String,
}

/// Direct `td` children of a row; nested tables are not ours.
fn data_cells(row: ElementRef) -> Vec<ElementRef> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| cell.value().name() == "td")
        .collect()
}

/// Direct `td`/`th` children, for header rows.
fn header_cells(row: ElementRef) -> Vec<ElementRef> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| matches!(cell.value().name(), "td" | "th"))
        .collect()
}

fn span(cell: ElementRef, attr: &str) -> usize {
    cell.value()
        .attr(attr)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(1)
}

/// The subject grades report: header row, one row per assignment, a totals
/// row with the average mark.
pub fn parse_subject_report(html: &str) -> Result<SubjectReport, PortalError> {
    let document = Html::parse_document(html);
    let rows: Vec<_> = document.select(&PRINT_ROWS).collect();
    if rows.len() < 2 {
        return Err(PortalError::extraction("subject report table not found"));
    }

    let mut assignments = vec![];
    for row in &rows[1..rows.len() - 1] {
        let cells: Vec<String> = data_cells(*row).into_iter().map(extract_text).collect();
        let [kind, name, date, issue_date, mark, ..] = cells.as_slice() else {
            return Err(PortalError::extraction(format!(
                "subject report row has {} cells, expected 5",
                cells.len()
            )));
        };
        let parse_date = |text: &str| {
            parse_short_date(text)
                .ok_or_else(|| PortalError::extraction(format!("bad report date {text:?}")))
        };
        assignments.push(ReportAssignment {
            kind: kind.clone(),
            name: name.clone(),
            date: parse_date(date)?,
            issue_date: parse_date(issue_date)?,
            mark: parse_mark(mark),
        });
    }

    let totals = document
        .select(&TOTALS_ROW)
        .next()
        .ok_or_else(|| PortalError::extraction("subject report totals row not found"))?;
    let middle_mark = data_cells(totals)
        .get(2)
        .map(|cell| extract_text(*cell))
        .ok_or_else(|| PortalError::extraction("subject report totals row is too short"))?;

    Ok(SubjectReport {
        assignments,
        middle_mark: parse_mark(&middle_mark),
    })
}

fn month_from_name(name: &str) -> Option<u32> {
    let name = name.trim().to_lowercase();
    let prefix: String = name.chars().take(3).collect();
    let month0 = match prefix.as_str() {
        "янв" => 0,
        "фев" => 1,
        "мар" => 2,
        "апр" => 3,
        "май" | "мая" => 4,
        "июн" => 5,
        "июл" => 6,
        "авг" => 7,
        "сен" => 8,
        "окт" => 9,
        "ноя" => 10,
        "дек" => 11,
        _ => return None,
    };
    Some(month0)
}

/// One date per day column, from the month row (colspans) and the day row.
fn journal_dates(
    month_row: ElementRef,
    day_row: ElementRef,
    period_start: NaiveDate,
) -> Result<Vec<NaiveDate>, PortalError> {
    let days: Vec<String> = header_cells(day_row).into_iter().map(extract_text).collect();
    let mut days = days.iter();
    let mut dates = vec![];

    for cell in header_cells(month_row) {
        // Subject and average columns span both header rows.
        if span(cell, "rowspan") >= 2 {
            continue;
        }
        let title = extract_text(cell);
        let month0 = month_from_name(&title)
            .ok_or_else(|| PortalError::extraction(format!("unknown month {title:?}")))?;
        let year = match YEAR.find(&title).and_then(|year| year.as_str().parse().ok()) {
            Some(year) => year,
            None if month0 >= period_start.month0() => period_start.year(),
            None => period_start.year() + 1,
        };
        for _ in 0..span(cell, "colspan") {
            let day = days
                .next()
                .ok_or_else(|| PortalError::extraction("journal day row is shorter than months"))?;
            let date = day
                .parse()
                .ok()
                .and_then(|day| NaiveDate::from_ymd_opt(year, month0 + 1, day))
                .ok_or_else(|| PortalError::extraction(format!("bad journal day {day:?}")))?;
            dates.push(date);
        }
    }
    Ok(dates)
}

/// The class journal report: a subject per row, a mid-term mark next to the
/// subject name and one cell per day of the period.
pub fn parse_journal(html: &str, period_start: NaiveDate) -> Result<Vec<JournalRow>, PortalError> {
    let document = Html::parse_document(html);
    let rows: Vec<_> = document.select(&PRINT_ROWS).collect();
    let [month_row, day_row, body @ ..] = rows.as_slice() else {
        return Err(PortalError::extraction("journal table header not found"));
    };
    let dates = journal_dates(*month_row, *day_row, period_start)?;

    let mut journal = vec![];
    for row in body {
        let cells: Vec<String> = data_cells(*row).into_iter().map(extract_text).collect();
        let [name, middle_mark, days @ ..] = cells.as_slice() else {
            return Err(PortalError::extraction(format!(
                "journal row has {} cells, expected at least 2",
                cells.len()
            )));
        };
        let assignments = dates
            .iter()
            .zip(days)
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(date, cell)| JournalMark {
                date: *date,
                marks: cell.split_whitespace().map(str::to_string).collect(),
            })
            .collect();
        journal.push(JournalRow {
            name: name.clone(),
            middle_mark: parse_mark(middle_mark),
            assignments,
        });
    }
    Ok(journal)
}

/// The month birthdays list. `year` is the year of the month that was asked
/// for; the table only prints `d.mm`.
pub fn parse_birthdays(html: &str, year: i32) -> Result<Vec<Birthday>, PortalError> {
    let document = Html::parse_document(html);
    let rows: Vec<_> = document.select(&PRINT_ROWS).collect();
    if rows.is_empty() {
        return Err(PortalError::extraction("birthdays table not found"));
    }

    let mut birthdays = vec![];
    for row in rows.iter().skip(1) {
        let cells: Vec<String> = data_cells(*row).into_iter().map(extract_text).collect();
        let [class_name, role, date, name, ..] = cells.as_slice() else {
            return Err(PortalError::extraction(format!(
                "birthday row has {} cells, expected 4",
                cells.len()
            )));
        };
        let date = parse_day_month(date, year)
            .ok_or_else(|| PortalError::extraction(format!("bad birthday date {date:?}")))?;
        birthdays.push(Birthday {
            date,
            name: name.clone(),
            role: role.clone(),
            class_name: class_name.clone(),
        });
    }
    birthdays.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(birthdays)
}

/// `d.mm` in the given year.
fn parse_day_month(text: &str, year: i32) -> Option<NaiveDate> {
    let (day, month) = text.trim().split_once('.')?;
    let day: u32 = day.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    rolling_date(year, month.checked_sub(1)?, day)
}
