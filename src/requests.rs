use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use reqwest::{
    Client, ClientBuilder, Method, StatusCode, Url,
    header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, REFERER},
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    config::ClientConfig,
    cookies::CookieJar,
    error::{FetchError, PortalError},
    ratelimit::RateLimiter,
};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Serialized as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Sent as is, for bodies the portal expects pre-encoded.
    Raw(String),
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    method: Method,
    body: Option<RequestBody>,
    headers: Vec<(&'static str, String)>,
    unparsed: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: vec![],
            unparsed: false,
        }
    }

    pub fn post() -> Self {
        Self {
            method: Method::POST,
            ..Self::get()
        }
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.body = Some(RequestBody::Form(pairs));
        self
    }

    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    pub fn json_body(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Header override, applied after the base set.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Keep the body as bytes regardless of its content type.
    pub fn unparsed(mut self) -> Self {
        self.unparsed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
pub struct PortalResponse {
    pub status: StatusCode,
    /// Final URL after redirects.
    pub url: Url,
    pub content_type: String,
    pub body: ResponseBody,
}

impl PortalResponse {
    /// The decoded body, or a `FetchError` when the portal did not answer
    /// with JSON.
    pub fn json(self) -> Result<Value, PortalError> {
        match self.body {
            ResponseBody::Json(value) => Ok(value),
            _ => Err(FetchError::new(self.status).into()),
        }
    }

    pub fn json_as<T: DeserializeOwned>(self) -> Result<T, PortalError> {
        Ok(serde_json::from_value(self.json()?)?)
    }

    pub fn text(self) -> String {
        match self.body {
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(text) => text,
            ResponseBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    pub fn bytes(self) -> Vec<u8> {
        match self.body {
            ResponseBody::Json(value) => value.to_string().into_bytes(),
            ResponseBody::Text(text) => text.into_bytes(),
            ResponseBody::Bytes(bytes) => bytes,
        }
    }
}

/// Every outbound call to one portal host goes through here, so the cookie
/// jar sees every response and every request carries the same base headers.
///
/// Cheap to clone: clones share the HTTP client, pacing and cookies.
#[derive(Clone)]
pub struct RequestGateway {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    cookies: Arc<Mutex<CookieJar>>,
    host: String,
    secure: bool,
    accept_invalid_certs: bool,
}

impl RequestGateway {
    pub fn new(host: &str, config: &ClientConfig) -> Result<Self, PortalError> {
        let client = ClientBuilder::new()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        let rate_limiter = RateLimiter::new(config.req_per_sec, config.min_gap);
        Ok(Self {
            client,
            rate_limiter: Arc::new(rate_limiter),
            cookies: Arc::new(Mutex::new(CookieJar::new())),
            host: host.to_string(),
            secure: false,
            accept_invalid_certs: config.accept_invalid_certs,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Whether TLS peers are trusted without a valid certificate. The report
    /// channel's WebSocket follows the same setting as the HTTP client.
    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    /// `http(s)://host`
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    /// `ws(s)://host`
    pub fn ws_base_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}", self.host)
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url())
        } else {
            format!("{}/{path}", self.base_url())
        }
    }

    fn jar(&self) -> MutexGuard<'_, CookieJar> {
        // A panic while holding the lock can't leave the jar half-written.
        self.cookies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cookie_header(&self) -> String {
        self.jar().header_value()
    }

    /// The headers every call carries: cookie, referer, `x-requested-with`.
    pub fn base_headers(&self) -> Result<HeaderMap, PortalError> {
        let mut headers = HeaderMap::new();
        let cookie = self.cookie_header();
        if !cookie.is_empty() {
            headers.insert(COOKIE, header_value(&cookie)?);
        }
        headers.insert(REFERER, header_value(&self.base_url())?);
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("xmlhttprequest"),
        );
        Ok(headers)
    }

    pub async fn request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<PortalResponse, PortalError> {
        let url = self.url_for(path);
        self.request_url(&url, options).await
    }

    pub async fn request_url(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<PortalResponse, PortalError> {
        let mut headers = self.base_headers()?;
        let mut builder = self.client.request(options.method.clone(), url);
        match options.body {
            Some(RequestBody::Form(pairs)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                builder = builder.form(&pairs);
            }
            Some(RequestBody::Raw(body)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                builder = builder.body(body);
            }
            Some(RequestBody::Json(body)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
                builder = builder.body(body.to_string());
            }
            None => {}
        }
        for (name, value) in &options.headers {
            headers.insert(HeaderName::from_static(name), header_value(value)?);
        }

        // Wait (non-blocking) until we're allowed to make a request.
        self.rate_limiter.wait_until_ready().await;

        debug!("{} {url}", options.method);
        let response = builder.headers(headers).send().await?;
        self.jar().accumulate(response.headers());

        let status = response.status();
        if !status.is_success() {
            debug!("{url} answered {status}");
            return Err(FetchError::new(status).into());
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = if options.unparsed {
            ResponseBody::Bytes(response.bytes().await?.to_vec())
        } else if content_type.starts_with("application/json") {
            ResponseBody::Json(response.json().await?)
        } else {
            ResponseBody::Text(response.text().await?)
        };

        Ok(PortalResponse {
            status,
            url: final_url,
            content_type,
            body,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, PortalError> {
    HeaderValue::from_str(value).map_err(|_| PortalError::InvalidHeader(value.to_string()))
}
