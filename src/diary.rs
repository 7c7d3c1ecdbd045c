use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::PortalError,
    requests::RequestOptions,
    session::SessionClient,
    text_manipulators::iso_day,
};

/// Assignment type the portal uses for homework.
const HOMEWORK_TYPE_ID: i64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LessonMark {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    pub mark: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: i64,
    pub name: String,
    pub room: Option<String>,
    pub homework: String,
    pub number: i64,
    pub start_time: String,
    pub end_time: String,
    pub assignments: Vec<LessonMark>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiaryDay {
    pub date: String,
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentDetail {
    pub date: String,
    pub theme: String,
    pub weight: Value,
    pub teacher: String,
    pub subject: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AssignmentType {
    pub id: i64,
    #[serde(default)]
    pub abbr: String,
    pub name: String,
}

/// Announcements are passed through as the portal sends them.
pub type Announcement = Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDiary {
    #[serde(default)]
    week_days: Vec<RawDay>,
}

#[derive(Debug, Deserialize)]
struct RawDay {
    date: String,
    #[serde(default)]
    lessons: Vec<RawLesson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLesson {
    classmeeting_id: i64,
    subject_name: String,
    room: Option<String>,
    number: i64,
    start_time: String,
    end_time: String,
    #[serde(default)]
    assignments: Vec<RawAssignment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAssignment {
    id: i64,
    type_id: i64,
    #[serde(default)]
    assignment_name: String,
    mark: Option<RawMark>,
}

#[derive(Debug, Deserialize)]
struct RawMark {
    mark: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAssignmentDetail {
    date: String,
    #[serde(default)]
    assignment_name: String,
    #[serde(default)]
    weight: Value,
    teacher: RawTeacher,
    #[serde(default)]
    subject_group: Value,
}

#[derive(Debug, Deserialize)]
struct RawTeacher {
    name: String,
}

impl From<RawLesson> for Lesson {
    fn from(lesson: RawLesson) -> Self {
        let homework = lesson
            .assignments
            .iter()
            .find(|assignment| assignment.type_id == HOMEWORK_TYPE_ID)
            .map(|assignment| assignment.assignment_name.clone())
            .unwrap_or_default();
        let assignments = lesson
            .assignments
            .into_iter()
            .filter_map(|assignment| {
                let mark = assignment.mark?;
                Some(LessonMark {
                    id: assignment.id,
                    kind: assignment.type_id,
                    mark: mark.mark,
                })
            })
            .collect();
        Self {
            id: lesson.classmeeting_id,
            name: lesson.subject_name,
            room: lesson.room,
            homework,
            number: lesson.number,
            start_time: lesson.start_time,
            end_time: lesson.end_time,
            assignments,
        }
    }
}

fn diary_days(raw: RawDiary) -> Vec<DiaryDay> {
    raw.week_days
        .into_iter()
        .map(|day| DiaryDay {
            date: day.date,
            lessons: day.lessons.into_iter().map(Lesson::from).collect(),
        })
        .collect()
}

impl SessionClient {
    /// Lessons between `start` and `end`, both inclusive.
    pub async fn diary(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DiaryDay>, PortalError> {
        let (token, version) = self.auth()?;
        let context = self.require_context()?;
        let raw: RawDiary = self
            .gateway()
            .request(
                &format!(
                    "/webapi/student/diary?vers={version}&yearId={}&studentId={}&weekEnd={}&weekStart={}",
                    context.year_id,
                    context.user_id,
                    iso_day(end),
                    iso_day(start)
                ),
                RequestOptions::get().header("at", token),
            )
            .await?
            .json_as()?;
        Ok(diary_days(raw))
    }

    pub async fn assignment(&self, id: i64) -> Result<AssignmentDetail, PortalError> {
        let (token, _) = self.auth()?;
        let context = self.require_context()?;
        let raw: RawAssignmentDetail = self
            .gateway()
            .request(
                &format!(
                    "/webapi/student/diary/assigns/{id}?studentId={}",
                    context.user_id
                ),
                RequestOptions::get().header("at", token),
            )
            .await?
            .json_as()?;
        Ok(AssignmentDetail {
            date: raw.date,
            theme: raw.assignment_name,
            weight: raw.weight,
            teacher: raw.teacher.name,
            subject: raw.subject_group,
        })
    }

    pub async fn announcements(&self) -> Result<Vec<Announcement>, PortalError> {
        let (token, _) = self.auth()?;
        self.gateway()
            .request(
                "/webapi/announcements?take=-1",
                RequestOptions::get().header("at", token),
            )
            .await?
            .json_as()
    }

    /// Ids of unread mail messages.
    pub async fn unread_messages(&self) -> Result<Vec<Value>, PortalError> {
        let (token, _) = self.auth()?;
        let context = self.require_context()?;
        self.gateway()
            .request(
                &format!("/webapi/mail/messages/unreaded?userId={}", context.user_id),
                RequestOptions::get().header("at", token),
            )
            .await?
            .json_as()
    }

    pub async fn assignment_types(&self) -> Result<Vec<AssignmentType>, PortalError> {
        let (token, _) = self.auth()?;
        self.gateway()
            .request(
                "/webapi/grade/assignment/types?all=false",
                RequestOptions::get().header("at", token),
            )
            .await?
            .json_as()
    }

    /// The account photo as the portal serves it.
    pub async fn photo(&self) -> Result<Vec<u8>, PortalError> {
        let (token, version) = self.auth()?;
        let context = self.require_context()?;
        let response = self
            .gateway()
            .request(
                &format!(
                    "/webapi/users/photo?at={token}&ver={version}&userId={}",
                    context.user_id
                ),
                RequestOptions::get().unparsed(),
            )
            .await?;
        Ok(response.bytes())
    }
}
