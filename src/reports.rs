use chrono::{Datelike, NaiveDate};
use log::info;
use serde_json::{Value, json};

use crate::{
    error::PortalError,
    report_job::{self, JobContext, ReportRequest},
    report_scraper::{
        Birthday, JournalRow, SubjectReport, parse_birthdays, parse_journal, parse_subject_report,
    },
    requests::RequestOptions,
    session::{SessionClient, UserContext},
    text_manipulators::{encode_uri, iso_timestamp},
};

const SUBJECT_QUEUE: &str = "webapi/reports/studentgrades/queue";
const JOURNAL_QUEUE: &str = "webapi/reports/studenttotal/queue";
const TOTAL_MARKS_TITLE: &str = "Итоговые отметки";

/// The fixed params every queued report carries.
fn report_params(context: &UserContext) -> Value {
    json!([
        {"name": "SCHOOLYEARID", "value": context.year_id},
        {"name": "SERVERTIMEZONE", "value": context.server_time_zone},
        {"name": "DATEFORMAT", "value": context.date_format},
        {"name": "FULLSCHOOLNAME", "value": context.school_name},
    ])
}

fn filter(id: &str, value: Value) -> Value {
    json!({"filterId": id, "filterValue": value})
}

fn period_filter(start: NaiveDate, end: NaiveDate) -> Value {
    filter(
        "period",
        Value::from(format!("{} - {}", iso_timestamp(start), iso_timestamp(end))),
    )
}

pub fn subject_report_request(
    context: &UserContext,
    subject_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> ReportRequest {
    ReportRequest {
        queue_path: SUBJECT_QUEUE,
        selected_data: json!([
            filter("SID", Value::from(context.user_id)),
            filter("PCLID_IUP", Value::from(format!("{}_0", context.class_id))),
            filter("SGID", Value::from(subject_id)),
            period_filter(start, end),
        ]),
    }
}

pub fn journal_request(context: &UserContext, start: NaiveDate, end: NaiveDate) -> ReportRequest {
    ReportRequest {
        queue_path: JOURNAL_QUEUE,
        selected_data: json!([
            filter("SID", Value::from(context.user_id)),
            filter("PCLID", Value::from(context.class_id)),
            period_filter(start, end),
        ]),
    }
}

impl SessionClient {
    fn job_context(&self) -> Result<JobContext<'_>, PortalError> {
        let (auth_token, version) = self.auth()?;
        let context = self.require_context()?;
        Ok(JobContext {
            gateway: self.gateway(),
            auth_token,
            version,
            params: report_params(context),
            deadline: self.report_timeout(),
        })
    }

    /// Marks for one subject over `[start, end]`.
    pub async fn subject_report(
        &self,
        subject_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SubjectReport, PortalError> {
        let subject = self.validate_subject(subject_id)?;
        self.validate_period(start, end)?;
        let context = self.require_context()?;

        info!("requesting {} report for {start} - {end}", subject.name);
        let request = subject_report_request(context, subject_id, start, end);
        let html = report_job::run(&self.job_context()?, &request).await?;
        parse_subject_report(&html)
    }

    /// Every subject's day-by-day marks over `[start, end]`.
    pub async fn journal(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<JournalRow>, PortalError> {
        self.validate_period(start, end)?;
        let context = self.require_context()?;

        info!("requesting journal for {start} - {end}");
        let request = journal_request(context, start, end);
        let html = report_job::run(&self.job_context()?, &request).await?;
        parse_journal(&html, start)
    }

    /// Birthdays in the class for the month of `date`.
    pub async fn birthdays(
        &self,
        date: NaiveDate,
        with_parents: bool,
    ) -> Result<Vec<Birthday>, PortalError> {
        let (token, version) = self.auth()?;
        let context = self.require_context()?;
        let (month, year) = (date.month(), date.year());

        let mut form = vec![
            ("LoginType", "0".to_string()),
            ("AT", token.to_string()),
            ("VER", version.to_string()),
            ("MonthYear", format!("{month},{year}")),
            ("ViewType", "1".to_string()),
            ("PCLID_IUP", format!("{}_0", context.class_id)),
        ];
        if with_parents {
            form.push(("Parents", "1".to_string()));
        }
        let html = self
            .gateway()
            .request(
                "/asp/Calendar/MonthBirth.asp",
                RequestOptions::post().form(form),
            )
            .await?
            .text();
        parse_birthdays(&html, year)
    }

    /// The final marks page, as HTML.
    pub async fn total_marks(&self) -> Result<String, PortalError> {
        let (token, version) = self.auth()?;
        let context = self.require_context()?;

        // Opens the report in the portal's page session; only the cookies matter.
        self.gateway()
            .request(
                "/asp/Reports/ReportStudentTotalMarks.asp",
                RequestOptions::post().raw_body(format!(
                    "at={token}&ver={version}&RPTID=StudentTotalMarks&RPNAME={}",
                    encode_uri(TOTAL_MARKS_TITLE)
                )),
            )
            .await?;

        let response = self
            .gateway()
            .request(
                "/asp/Reports/StudentTotalMarks.asp",
                RequestOptions::post()
                    .raw_body(format!(
                        "LoginType=0&AT={token}&VER={version}&SID={}&PCLID={}",
                        context.user_id, context.class_id
                    ))
                    .header("at", token),
            )
            .await?;
        Ok(response.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::logged_in_client;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn subject_request_filters() {
        let client = logged_in_client();
        let context = client.context().unwrap();
        let request = subject_report_request(context, "101", day(2023, 9, 1), day(2023, 10, 1));
        assert_eq!(request.queue_path, "webapi/reports/studentgrades/queue");
        assert_eq!(
            request.selected_data,
            json!([
                {"filterId": "SID", "filterValue": 7},
                {"filterId": "PCLID_IUP", "filterValue": "42_0"},
                {"filterId": "SGID", "filterValue": "101"},
                {"filterId": "period", "filterValue": "2023-09-01T00:00:00.000Z - 2023-10-01T00:00:00.000Z"},
            ])
        );
    }

    #[test]
    fn params_carry_school_context() {
        let client = logged_in_client();
        let params = report_params(client.context().unwrap());
        assert_eq!(params[0], json!({"name": "SCHOOLYEARID", "value": 2041}));
        assert_eq!(params[1], json!({"name": "SERVERTIMEZONE", "value": 3}));
        assert_eq!(params[3]["value"], "МБОУ СОШ №5");
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_request() {
        // The client points at a host that does not exist; reaching the
        // network would surface as a request error instead.
        let client = logged_in_client();
        let error = client
            .subject_report("999", day(2023, 9, 1), day(2023, 10, 1))
            .await
            .unwrap_err();
        assert_eq!(error.code(), 10);

        let error = client
            .subject_report("101", day(2023, 8, 1), day(2023, 10, 1))
            .await
            .unwrap_err();
        assert_eq!(error.code(), 11);

        let error = client.journal(day(2023, 9, 1), day(2024, 7, 1)).await.unwrap_err();
        assert!(matches!(error, PortalError::Validation(_)));
    }
}
