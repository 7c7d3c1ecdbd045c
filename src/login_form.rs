use std::sync::LazyLock;

use log::{debug, info};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ClientConfig,
    error::{FetchError, PortalError},
    requests::{RequestGateway, RequestOptions},
    text_manipulators::value_to_string,
};

static FORM_SELECTS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#message select").expect("valid login form selector"));

/// One drop-down of the login form (region, town, school type, school...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginFormSelector {
    pub id: String,
    pub name: String,
    /// Preselected option id.
    pub value: Option<i64>,
    pub options: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    version: Value,
}

#[derive(Debug, Deserialize)]
struct FormPage {
    #[serde(default)]
    items: Vec<Value>,
}

/// True when `host` answers the login form probe with a JSON content type.
/// The body is not looked at. A refusal by status is `false`; a host that
/// can't be reached is an error.
pub async fn check_host(host: &str, config: &ClientConfig) -> Result<bool, PortalError> {
    let gateway = RequestGateway::new(host, config)?;
    match gateway
        .request(
            "/webapi/prepareloginform",
            RequestOptions::get().unparsed(),
        )
        .await
    {
        Ok(response) => Ok(response.content_type.starts_with("application/json")),
        Err(PortalError::Fetch(error)) => {
            debug!("{host} refused the probe: {error}");
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

async fn supported_gateway(host: &str, config: &ClientConfig) -> Result<RequestGateway, PortalError> {
    if !check_host(host, config).await? {
        return Err(PortalError::UnsupportedHost(host.to_string()));
    }
    RequestGateway::new(host, config)
}

/// Selectors from the form template, in page order.
pub fn parse_form_selectors(html: &str) -> Vec<LoginFormSelector> {
    let document = Html::parse_document(html);
    document
        .select(&FORM_SELECTS)
        .map(|select| LoginFormSelector {
            id: select.value().id().unwrap_or_default().to_string(),
            name: select.value().attr("name").unwrap_or_default().to_string(),
            value: None,
            options: vec![],
        })
        .collect()
}

/// Fills selectors from the prepared form: keys match a selector id or name
/// ignoring case, numbers become the preselected value and arrays the options.
pub fn apply_prepared_form(selectors: &mut [LoginFormSelector], prepared: &Value) {
    let Some(fields) = prepared.as_object() else {
        return;
    };
    for (key, value) in fields {
        if key.is_empty() {
            continue;
        }
        let Some(selector) = selectors.iter_mut().find(|selector| {
            selector.id.eq_ignore_ascii_case(key) || selector.name.eq_ignore_ascii_case(key)
        }) else {
            continue;
        };
        match value {
            Value::Number(number) => selector.value = number.as_i64(),
            Value::Array(options) => selector.options = options.clone(),
            _ => {}
        }
    }
}

pub async fn auth_form(host: &str, config: &ClientConfig) -> Result<Vec<LoginFormSelector>, PortalError> {
    let gateway = supported_gateway(host, config).await?;

    let login_data: LoginData = gateway
        .request("/webapi/logindata", RequestOptions::get())
        .await?
        .json_as()?;
    let version = value_to_string(&login_data.version);

    let template = gateway
        .request(
            &format!("/vendor/pages/about/templates/loginform.html?ver={version}"),
            RequestOptions::get(),
        )
        .await?;
    if !template.content_type.starts_with("text/html") {
        return Err(FetchError::new(template.status).into());
    }
    let mut selectors = parse_form_selectors(&template.text());

    let prepared = gateway
        .request("/webapi/prepareloginform", RequestOptions::get())
        .await?
        .json()?;
    apply_prepared_form(&mut selectors, &prepared);

    info!("{host} login form has {} selectors", selectors.len());
    Ok(selectors)
}

/// Options of the next selector once `last_selected` has been picked.
/// `all_selected` is the query string of every choice made so far.
pub async fn upload_auth_form(
    host: &str,
    config: &ClientConfig,
    all_selected: &str,
    last_selected: &str,
) -> Result<Vec<Value>, PortalError> {
    let gateway = supported_gateway(host, config).await?;
    let page: FormPage = gateway
        .request(
            &format!("/webapi/loginform?{all_selected}&LASTNAME={last_selected}"),
            RequestOptions::get(),
        )
        .await?
        .json_as()?;
    Ok(page.items)
}
