use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::{ClientConfig, Credentials, PortalConfig},
    error::{PortalError, ValidationError},
    requests::{RequestGateway, RequestOptions},
    settings_scraper::{UserProfile, parse_app_context, parse_profile},
    text_manipulators::{encode_uri, value_to_string},
};

/// The token is treated as expired this long before the portal drops it.
const EXPIRY_MARGIN_MS: i64 = 1000;
const CONTEXT_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub auth_token: Option<String>,
    pub version: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Survives logout so the next expiry still lands after it.
    last_expiry: Option<DateTime<Utc>>,
}

impl Session {
    /// `now + timeout`, moved past every expiry this session has had.
    fn next_expiry(&self, now: DateTime<Utc>, timeout: TimeDelta) -> DateTime<Utc> {
        let expires_at = now + timeout;
        match self.last_expiry {
            Some(last) if expires_at <= last => last + TimeDelta::milliseconds(1),
            _ => expires_at,
        }
    }

    fn clear(&mut self) {
        self.auth_token = None;
        self.version = None;
        self.expires_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start <= start && start <= end && end <= self.end
    }
}

/// Who is logged in and what the portal lets them report on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: i64,
    pub class_id: i64,
    pub year_id: i64,
    pub school_id: i64,
    pub current_year: String,
    pub date_format: String,
    pub school_name: String,
    pub server_time_zone: Value,
    pub subjects: Vec<Subject>,
    pub reportable_range: DateRange,
    #[serde(skip)]
    pub loaded_at: DateTime<Utc>,
}

impl UserContext {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.loaded_at >= TimeDelta::hours(CONTEXT_MAX_AGE_HOURS)
    }

    pub fn subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id == id)
    }
}

#[derive(Debug, Deserialize)]
struct AuthData {
    lt: Value,
    ver: Value,
    salt: Value,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    at: String,
    #[serde(rename = "timeOut")]
    time_out: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportFilters {
    filter_sources: Vec<FilterSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FilterSource {
    default_value: Value,
    items: Vec<FilterItem>,
    min_value: Option<String>,
    max_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilterItem {
    title: String,
    value: Value,
}

/// `(PW, pw2)`: `md5(salt + md5(password))` in hex, and its prefix as long as
/// the password in UTF-16 units.
pub fn login_hashes(salt: &str, password: &str) -> (String, String) {
    let inner = format!("{:x}", Md5::digest(password.as_bytes()));
    let full = format!("{:x}", Md5::digest(format!("{salt}{inner}").as_bytes()));
    let prefix_len = password.encode_utf16().count().min(full.len());
    (full[..prefix_len].to_string(), full)
}

/// Body of `POST /webapi/login`. The portal wants it pre-encoded, with the
/// selector lower-cased and the login run through `encodeURI`.
pub fn login_body(lt: &str, ver: &str, salt: &str, credentials: &Credentials) -> String {
    let (pw, pw2) = login_hashes(salt, &credentials.password);
    format!(
        "LoginType=1&lt={lt}&ver={ver}&{}&UN={}&PW={pw}&pw2={pw2}",
        credentials.selector.to_lowercase(),
        encode_uri(&credentials.login)
    )
}

/// Report filter dates come as `2023-09-01T00:00:00`.
fn filter_date(text: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text?.get(..10)?, "%Y-%m-%d").ok()
}

fn filter_id(value: &Value) -> Option<i64> {
    value_to_string(value).trim().parse().ok()
}

/// One authenticated account on one portal host.
pub struct SessionClient {
    gateway: RequestGateway,
    credentials: Credentials,
    session: Session,
    context: Option<UserContext>,
    profile: Option<UserProfile>,
    report_timeout: Option<Duration>,
}

impl SessionClient {
    pub fn new(config: &PortalConfig) -> Result<Self, PortalError> {
        Self::with_credentials(&config.host, config.credentials.clone(), &config.client)
    }

    pub fn with_credentials(
        host: &str,
        credentials: Credentials,
        config: &ClientConfig,
    ) -> Result<Self, PortalError> {
        Ok(Self {
            gateway: RequestGateway::new(host, config)?,
            credentials,
            session: Session::default(),
            context: None,
            profile: None,
            report_timeout: config.report_timeout,
        })
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn context(&self) -> Option<&UserContext> {
        self.context.as_ref()
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn report_timeout(&self) -> Option<Duration> {
        self.report_timeout
    }

    /// `(auth_token, version)` of the live session.
    pub(crate) fn auth(&self) -> Result<(&str, &str), PortalError> {
        match (&self.session.auth_token, &self.session.version) {
            (Some(token), Some(version)) => Ok((token.as_str(), version.as_str())),
            _ => Err(PortalError::NotLoggedIn),
        }
    }

    pub(crate) fn require_context(&self) -> Result<&UserContext, PortalError> {
        self.context.as_ref().ok_or(PortalError::NotLoggedIn)
    }

    pub fn need_auth(&self) -> bool {
        self.need_auth_at(Utc::now())
    }

    /// True when there is no token or it expires within a second of `now`.
    /// Nothing logs in again on its own; callers check this and call
    /// [`login`](Self::login).
    pub fn need_auth_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.session.auth_token, self.session.expires_at) {
            (Some(_), Some(expires_at)) => expires_at - now <= TimeDelta::milliseconds(EXPIRY_MARGIN_MS),
            _ => true,
        }
    }

    pub async fn login(&mut self) -> Result<(), PortalError> {
        let landing = self.gateway.request("/", RequestOptions::get()).await?;
        let secure = landing.url.scheme() == "https";
        self.gateway.set_secure(secure);
        debug!("{} answers over {}", self.gateway.host(), landing.url.scheme());

        let auth: AuthData = self
            .gateway
            .request("/webapi/auth/getdata", RequestOptions::post())
            .await?
            .json_as()?;
        let version = value_to_string(&auth.ver);
        self.session.version = Some(version.clone());

        let body = login_body(
            &value_to_string(&auth.lt),
            &version,
            &value_to_string(&auth.salt),
            &self.credentials,
        );
        let reply: LoginReply = self
            .gateway
            .request("/webapi/login", RequestOptions::post().raw_body(body))
            .await?
            .json_as()?;

        let now = Utc::now();
        let expires_at = self
            .session
            .next_expiry(now, TimeDelta::milliseconds(reply.time_out));
        self.session.auth_token = Some(reply.at);
        self.session.expires_at = Some(expires_at);
        self.session.last_expiry = Some(expires_at);
        info!("logged in to {} until {expires_at}", self.gateway.host());

        let fresh = self
            .context
            .as_ref()
            .is_some_and(|context| !context.is_stale(now));
        if !fresh {
            self.load_context().await?;
        }
        Ok(())
    }

    /// Local state is cleared whatever the portal says; a rejected logout is
    /// still reported.
    pub async fn logout(&mut self) -> Result<(), PortalError> {
        let (token, version) = match self.auth() {
            Ok((token, version)) => (token.to_string(), version.to_string()),
            Err(error) => {
                self.session.clear();
                return Err(error);
            }
        };
        self.session.clear();

        let result = self
            .gateway
            .request(
                "/asp/logout.asp",
                RequestOptions::post().raw_body(format!("at={token}&VER={version}")),
            )
            .await;
        match result {
            Ok(_) => {
                info!("logged out of {}", self.gateway.host());
                Ok(())
            }
            Err(error) => {
                warn!("logout was rejected: {error}");
                Err(error)
            }
        }
    }

    async fn load_context(&mut self) -> Result<(), PortalError> {
        let (token, version) = self.auth()?;
        let (token, version) = (token.to_string(), version.to_string());

        let settings = self
            .gateway
            .request(
                &format!("/asp/MySettings/MySettings.asp?at={token}"),
                RequestOptions::post().form([("AT", token.as_str()), ("VER", version.as_str())]),
            )
            .await?
            .text();
        let profile = parse_profile(&settings);
        let app_context = parse_app_context(&settings)?;

        let filters: ReportFilters = self
            .gateway
            .request(
                "/webapi/reports/studentgrades",
                RequestOptions::get().header("at", token.as_str()),
            )
            .await?
            .json_as()?;
        let source = |index: usize| {
            filters.filter_sources.get(index).ok_or_else(|| {
                PortalError::extraction(format!("report filter source {index} is missing"))
            })
        };

        let user_id = filter_id(&source(0)?.default_value)
            .ok_or_else(|| PortalError::extraction("report filters carry no user id"))?;
        let class_id = filter_id(&source(1)?.default_value)
            .ok_or_else(|| PortalError::extraction("report filters carry no class id"))?;
        let subjects = source(2)?
            .items
            .iter()
            .map(|item| Subject {
                id: value_to_string(&item.value),
                name: item.title.clone(),
            })
            .collect();
        let period = source(3)?;
        let reportable_range = match (
            filter_date(period.min_value.as_deref()),
            filter_date(period.max_value.as_deref()),
        ) {
            (Some(start), Some(end)) => DateRange { start, end },
            _ => return Err(PortalError::extraction("report period bounds are missing")),
        };

        let context = UserContext {
            user_id,
            class_id,
            year_id: app_context.year_id,
            school_id: app_context.school_id,
            current_year: app_context.current_year,
            date_format: app_context.date_format,
            school_name: app_context.school_name,
            server_time_zone: app_context.server_time_zone,
            subjects,
            reportable_range,
            loaded_at: Utc::now(),
        };
        info!(
            "loaded context for user {} ({} subjects)",
            context.user_id,
            context.subjects.len()
        );
        self.context = Some(context);
        self.profile = Some(profile);
        Ok(())
    }

    pub(crate) fn validate_subject(&self, id: &str) -> Result<&Subject, PortalError> {
        let context = self.require_context()?;
        context
            .subject(id)
            .ok_or_else(|| ValidationError::InvalidSubject(id.to_string()).into())
    }

    pub(crate) fn validate_period(&self, start: NaiveDate, end: NaiveDate) -> Result<(), PortalError> {
        let context = self.require_context()?;
        if context.reportable_range.contains(start, end) {
            Ok(())
        } else {
            Err(ValidationError::InvalidPeriod.into())
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, session: Session, context: Option<UserContext>) {
        self.session = session;
        self.context = context;
    }
}
