mod cookies;
mod error;
mod literal_parser;
mod ratelimit;
mod requests;
mod settings_scraper;
mod text_manipulators;

pub mod config;
pub mod diary;
pub mod login_form;
pub mod report_job;
pub mod report_scraper;
pub mod reports;
pub mod session;

pub use cookies::CookieJar;
pub use error::{FetchError, PortalError, ProtocolFailure, ValidationError};
pub use literal_parser::{LiteralError, parse_literal};
pub use login_form::{LoginFormSelector, auth_form, check_host, upload_auth_form};
pub use requests::{PortalResponse, RequestGateway, RequestOptions, ResponseBody};
pub use session::{DateRange, Session, SessionClient, Subject, UserContext, login_hashes};
pub use settings_scraper::{AppContext, UserProfile, parse_app_context, parse_profile};
