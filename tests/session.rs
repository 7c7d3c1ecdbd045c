mod common;

use chrono::NaiveDate;
use common::{HubScript, PortalStub, Recorded, Reply, client_config, credentials, portal_router};
use netschool::{PortalError, SessionClient, auth_form, check_host, login_hashes, upload_auth_form};
use serde_json::json;

async fn logged_in(stub: &PortalStub) -> SessionClient {
    let mut client = SessionClient::with_credentials(&stub.host, credentials(), &client_config())
        .expect("client");
    client.login().await.expect("login");
    client
}

#[tokio::test]
async fn check_host_wants_json_from_the_probe() {
    let portal = PortalStub::start(portal_router(|_| None), HubScript::Silent).await;
    assert!(check_host(&portal.host, &client_config()).await.unwrap());

    let html = PortalStub::start(|_: &Recorded| Reply::html("<html></html>"), HubScript::Silent).await;
    assert!(!check_host(&html.host, &client_config()).await.unwrap());

    let down = PortalStub::start(|_: &Recorded| Reply::status(503), HubScript::Silent).await;
    assert!(!check_host(&down.host, &client_config()).await.unwrap());
}

#[tokio::test]
async fn check_host_goes_by_content_type_not_body() {
    let stub = PortalStub::start(
        |_: &Recorded| Reply {
            body: "not-json".into(),
            ..Reply::json(json!(null))
        },
        HubScript::Silent,
    )
    .await;
    assert!(check_host(&stub.host, &client_config()).await.unwrap());
}

#[tokio::test]
async fn login_sends_salted_hashes_and_loads_context() {
    let stub = PortalStub::start(portal_router(|_| None), HubScript::Silent).await;
    let client = logged_in(&stub).await;

    let login = stub.find("/webapi/login").expect("login request");
    let (pw, pw2) = login_hashes("s", "abc");
    assert_eq!(
        login.body,
        format!(
            "LoginType=1&lt=4242&ver=900&cid=2&sid=1&pid=-1&cn=3&sft=2&scid=23&UN=ivanov&PW={pw}&pw2={pw2}"
        )
    );
    assert_eq!(pw.len(), 3);
    assert!(pw2.starts_with(&pw));
    assert_eq!(login.header("cookie"), Some("NSSESSIONID=s1; ESRNSec=e1"));
    assert_eq!(login.header("x-requested-with"), Some("xmlhttprequest"));
    assert_eq!(
        login.header("content-type"),
        Some("application/x-www-form-urlencoded")
    );

    let settings = stub.find("/asp/MySettings/MySettings.asp").expect("settings request");
    assert_eq!(settings.target, "/asp/MySettings/MySettings.asp?at=AT1");
    assert_eq!(settings.body, "AT=AT1&VER=900");
    let filters = stub.find("/webapi/reports/studentgrades").expect("filters request");
    assert_eq!(filters.header("at"), Some("AT1"));

    assert!(!client.need_auth());
    assert!(!client.gateway().is_secure());
    let context = client.context().expect("context");
    assert_eq!((context.user_id, context.class_id), (7, 42));
    assert_eq!((context.year_id, context.school_id), (2041, 89));
    assert_eq!(context.school_name, "МБОУ СОШ №5");
    assert_eq!(context.subjects.len(), 2);
    assert_eq!(context.subjects[1].id, "102");
    assert_eq!(context.subjects[1].name, "Физика");
    assert_eq!(
        context.reportable_range.start,
        NaiveDate::from_ymd_opt(2023, 9, 1).unwrap()
    );
    assert_eq!(client.profile().expect("profile").last_name, "Иванов");
}

#[tokio::test]
async fn relogin_keeps_fresh_context_and_pushes_expiry_forward() {
    let stub = PortalStub::start(portal_router(|_| None), HubScript::Silent).await;
    let mut client = logged_in(&stub).await;
    let first_expiry = client.session().expires_at.unwrap();

    client.login().await.unwrap();
    let settings_loads = stub
        .requests()
        .iter()
        .filter(|request| request.path() == "/asp/MySettings/MySettings.asp")
        .count();
    assert_eq!(settings_loads, 1);
    assert!(client.session().expires_at.unwrap() > first_expiry);
}

#[tokio::test]
async fn rejected_login_is_a_fetch_error() {
    let stub = PortalStub::start(
        portal_router(|request| (request.path() == "/webapi/login").then(|| Reply::status(409))),
        HubScript::Silent,
    )
    .await;
    let mut client =
        SessionClient::with_credentials(&stub.host, credentials(), &client_config()).unwrap();
    match client.login().await {
        Err(PortalError::Fetch(error)) => assert!(error.is_auth_problem()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.need_auth());
    assert!(client.context().is_none());
}

#[tokio::test]
async fn logout_clears_session_even_when_rejected() {
    let stub = PortalStub::start(
        portal_router(|request| (request.path() == "/asp/logout.asp").then(|| Reply::status(500))),
        HubScript::Silent,
    )
    .await;
    let mut client = logged_in(&stub).await;

    match client.logout().await {
        Err(PortalError::Fetch(error)) => assert!(error.is_server_down()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.need_auth());
    assert!(client.session().auth_token.is_none());
    assert!(client.session().version.is_none());
    assert_eq!(stub.find("/asp/logout.asp").unwrap().body, "at=AT1&VER=900");
}

#[tokio::test]
async fn diary_maps_lessons() {
    let stub = PortalStub::start(
        portal_router(|request| {
            (request.path() == "/webapi/student/diary").then(|| {
                Reply::json(json!({
                    "weekDays": [{
                        "date": "2023-09-04T00:00:00",
                        "lessons": [{
                            "classmeetingId": 11,
                            "subjectName": "Алгебра",
                            "room": "12",
                            "number": 1,
                            "startTime": "08:30",
                            "endTime": "09:15",
                            "assignments": [
                                {"id": 5, "typeId": 3, "assignmentName": "№ 12"},
                                {"id": 6, "typeId": 1, "assignmentName": "Тест", "mark": {"mark": 4}}
                            ]
                        }]
                    }]
                }))
            })
        }),
        HubScript::Silent,
    )
    .await;
    let client = logged_in(&stub).await;

    let days = client
        .diary(
            NaiveDate::from_ymd_opt(2023, 9, 4).unwrap(),
            NaiveDate::from_ymd_opt(2023, 9, 10).unwrap(),
        )
        .await
        .unwrap();
    let lesson = &days[0].lessons[0];
    assert_eq!(lesson.homework, "№ 12");
    assert_eq!(lesson.assignments.len(), 1);
    assert_eq!(lesson.assignments[0].mark, json!(4));

    let request = stub.find("/webapi/student/diary").unwrap();
    assert_eq!(
        request.target,
        "/webapi/student/diary?vers=900&yearId=2041&studentId=7&weekEnd=2023-09-10&weekStart=2023-09-04"
    );
    assert_eq!(request.header("at"), Some("AT1"));
}

#[tokio::test]
async fn auth_form_fills_selectors_from_prepared_form() {
    let stub = PortalStub::start(
        |request: &Recorded| match request.path() {
            "/webapi/prepareloginform" => Reply::json(json!({
                "cid": 2,
                "sid": 1,
                "scid": [{"id": 23, "name": "Школа №5"}],
            })),
            "/webapi/logindata" => Reply::json(json!({"version": "4.80"})),
            "/vendor/pages/about/templates/loginform.html" => Reply::html(
                r#"<div id="message">
                    <select id="countries" name="CID"></select>
                    <select id="provinces" name="SID"></select>
                    <select id="schools" name="SCID"></select>
                </div>"#,
            ),
            "/webapi/loginform" => Reply::json(json!({"items": [{"id": 1, "name": "Город"}]})),
            _ => Reply::status(404),
        },
        HubScript::Silent,
    )
    .await;

    let selectors = auth_form(&stub.host, &client_config()).await.unwrap();
    assert_eq!(selectors.len(), 3);
    assert_eq!(selectors[0].value, Some(2));
    assert_eq!(selectors[1].value, Some(1));
    assert_eq!(selectors[2].options.len(), 1);
    let template = stub.find("/vendor/pages/about/templates/loginform.html").unwrap();
    assert!(template.target.ends_with("?ver=4.80"));

    let items = upload_auth_form(&stub.host, &client_config(), "cid=2&sid=1", "pid")
        .await
        .unwrap();
    assert_eq!(items, vec![json!({"id": 1, "name": "Город"})]);
    assert_eq!(
        stub.find("/webapi/loginform").unwrap().target,
        "/webapi/loginform?cid=2&sid=1&LASTNAME=pid"
    );
}

#[tokio::test]
async fn auth_form_refuses_unsupported_host() {
    let stub = PortalStub::start(|_: &Recorded| Reply::status(404), HubScript::Silent).await;
    match auth_form(&stub.host, &client_config()).await {
        Err(PortalError::UnsupportedHost(host)) => assert_eq!(host, stub.host),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn birthdays_use_the_month_and_year_asked_for() {
    let stub = PortalStub::start(
        portal_router(|request| {
            (request.path() == "/asp/Calendar/MonthBirth.asp").then(|| {
                Reply::html(
                    r#"<table class="table-print">
                        <tr><td>Класс</td><td>Роль</td><td>Дата</td><td>ФИО</td></tr>
                        <tr><td>9А</td><td>Ученик</td><td>8.06</td><td>Сидоров Иван</td></tr>
                    </table>"#,
                )
            })
        }),
        HubScript::Silent,
    )
    .await;
    let client = logged_in(&stub).await;

    let birthdays = client
        .birthdays(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(), true)
        .await
        .unwrap();
    assert_eq!(birthdays[0].date, NaiveDate::from_ymd_opt(2025, 6, 8).unwrap());

    let request = stub.find("/asp/Calendar/MonthBirth.asp").unwrap();
    assert_eq!(
        request.body,
        "LoginType=0&AT=AT1&VER=900&MonthYear=6%2C2025&ViewType=1&PCLID_IUP=42_0&Parents=1"
    );
}
