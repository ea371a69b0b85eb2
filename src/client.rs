//! Blocking HTTP client for the heating cloud API.
//!
//! - Blocking client using `ureq` (no async); callers run it off the bridge
//!   thread.
//! - Responses are read as raw JSON and handed to `crate::parse`, so a
//!   malformed payload surfaces as a named `ParseError` rather than a serde
//!   failure on the first unexpected field.
//! - Token lifecycle (which grant to use, when, and by whom) is owned by
//!   `crate::session`; this module only performs the grants.
//!
//! Endpoints used, relative to the API base URL:
//! - `GET  /installations`
//! - `GET  /installations/{id}`
//! - `GET  /installations/{id}/live`
//! - `GET  /referential`
//! - `POST /installations/{id}/zones/{zone}/commands`

use chrono::Utc;
use http::StatusCode;
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::extract::ParseError;
use crate::models::cloud::{InstallationId, InstallationSnapshot, InstallationSummary, LiveSnapshot};
use crate::parse;
use crate::referential::{ReferentialError, ReferentialTable};
use crate::session::{AccessToken, Credentials, Session};
use crate::translator::{CloudAction, CloudCommand};

pub const DEFAULT_BASE_URL: &str = "https://smarthome.heatzone.cloud/api/v1";
pub const DEFAULT_AUTH_URL: &str = "https://auth.heatzone.cloud/realms/heatzone/protocol/openid-connect/token";
pub const DEFAULT_CLIENT_ID: &str = "app-front";
const USER_AGENT: &str = concat!("heatzone-bridge/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum CloudError {
    /// Connection, DNS, TLS or timeout failure.
    Transport(String),
    Http { status: u16, message: String },
    /// The access token was refused (HTTP 401).
    Unauthorized,
    /// Full login rejected: the configured credentials are wrong.
    Auth(String),
    /// The refresh token itself is no longer accepted.
    RefreshExpired(String),
    Json(serde_json::Error),
    Parse(ParseError),
    Decode(String),
}

impl CloudError {
    /// Failures expected to go away on their own (NetworkError).
    pub fn is_network(&self) -> bool {
        match self {
            CloudError::Transport(_) => true,
            CloudError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl core::fmt::Display for CloudError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CloudError::Transport(s) => write!(f, "transport error: {}", s),
            CloudError::Http { status, message } => write!(f, "http {}: {}", status, message),
            CloudError::Unauthorized => write!(f, "access token rejected (http 401)"),
            CloudError::Auth(e) => write!(f, "login rejected: {}", e),
            CloudError::RefreshExpired(e) => write!(f, "refresh token expired: {}", e),
            CloudError::Json(e) => write!(f, "json error: {}", e),
            CloudError::Parse(e) => write!(f, "unexpected payload {}", e),
            CloudError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CloudError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CloudError::Json(e) => Some(e),
            CloudError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(value: serde_json::Error) -> Self {
        CloudError::Json(value)
    }
}

impl From<ParseError> for CloudError {
    fn from(value: ParseError) -> Self {
        CloudError::Parse(value)
    }
}

impl From<ReferentialError> for CloudError {
    fn from(value: ReferentialError) -> Self {
        CloudError::Decode(value.to_string())
    }
}

impl From<ureq::Error> for CloudError {
    fn from(value: ureq::Error) -> Self {
        CloudError::Transport(value.to_string())
    }
}

/// Everything the bridge needs from the cloud. Implemented by [`CloudClient`];
/// tests substitute scripted fakes.
pub trait CloudApi: Send + Sync {
    fn login(&self, credentials: &Credentials) -> Result<Session, CloudError>;
    fn refresh(&self, refresh_token: &str) -> Result<Session, CloudError>;
    fn list_installations(&self, token: &AccessToken) -> Result<Vec<InstallationSummary>, CloudError>;
    fn fetch_installation(&self, token: &AccessToken, id: &InstallationId)
    -> Result<InstallationSnapshot, CloudError>;
    fn fetch_live_data(&self, token: &AccessToken, id: &InstallationId) -> Result<LiveSnapshot, CloudError>;
    fn fetch_referential(&self, token: &AccessToken) -> Result<ReferentialTable, CloudError>;
    fn send_command(&self, token: &AccessToken, command: &CloudCommand) -> Result<(), CloudError>;
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub timeout: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Password,
    Refresh,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
}

type Response = http::Response<ureq::Body>;

pub struct CloudClient {
    agent: ureq::Agent,
    base_url: String,
    auth_url: String,
    client_id: String,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        CloudClient {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.clone(),
            client_id: config.client_id.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn token_grant(&self, grant: Grant, form: &[(&str, &str)]) -> Result<Session, CloudError> {
        let mut resp = self
            .agent
            .post(&self.auth_url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .send_form(form.iter().copied())?;

        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        if status.is_success() {
            let de = &mut serde_json::Deserializer::from_str(&body);
            let TokenResponse {
                access_token,
                expires_in,
                refresh_token,
                refresh_expires_in,
            } = serde_path_to_error::deserialize(de)
                .map_err(|e| CloudError::Decode(format!("token response at {}: {}", e.path(), e.inner())))?;
            return Ok(Session::new(
                access_token,
                Duration::from_secs(expires_in),
                refresh_token,
                refresh_expires_in.map(Duration::from_secs),
            ));
        }

        let message = oauth_error_message(&body);
        match (grant, status) {
            (_, s) if s.is_server_error() => Err(CloudError::Http {
                status: s.as_u16(),
                message,
            }),
            (Grant::Password, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) => Err(CloudError::Auth(message)),
            (Grant::Refresh, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) => {
                Err(CloudError::RefreshExpired(message))
            }
            (_, s) => Err(CloudError::Http {
                status: s.as_u16(),
                message,
            }),
        }
    }

    fn check(mut resp: Response) -> Result<Response, CloudError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(CloudError::Unauthorized);
        }
        let message = resp
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(CloudError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn get(&self, token: &AccessToken, path: &str) -> Result<Response, CloudError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let resp = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("Authorization", &format!("Bearer {}", token.secret()))
            .call()?;
        Self::check(resp)
    }

    fn get_json(&self, token: &AccessToken, path: &str) -> Result<Value, CloudError> {
        let mut resp = self.get(token, path)?;
        let body = resp.body_mut().read_to_string()?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl CloudApi for CloudClient {
    fn login(&self, credentials: &Credentials) -> Result<Session, CloudError> {
        self.token_grant(
            Grant::Password,
            &[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ],
        )
    }

    fn refresh(&self, refresh_token: &str) -> Result<Session, CloudError> {
        self.token_grant(
            Grant::Refresh,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ],
        )
    }

    fn list_installations(&self, token: &AccessToken) -> Result<Vec<InstallationSummary>, CloudError> {
        let body = self.get_json(token, "/installations")?;
        Ok(parse::parse_installation_list(&body)?)
    }

    fn fetch_installation(
        &self,
        token: &AccessToken,
        id: &InstallationId,
    ) -> Result<InstallationSnapshot, CloudError> {
        let body = self.get_json(token, &format!("/installations/{}", path_segment(&id.0)))?;
        Ok(parse::parse_installation(&body, Utc::now())?)
    }

    fn fetch_live_data(&self, token: &AccessToken, id: &InstallationId) -> Result<LiveSnapshot, CloudError> {
        let body = self.get_json(token, &format!("/installations/{}/live", path_segment(&id.0)))?;
        Ok(parse::parse_live_data(id, &body, Utc::now())?)
    }

    fn fetch_referential(&self, token: &AccessToken) -> Result<ReferentialTable, CloudError> {
        let mut resp = self.get(token, "/referential")?;
        let bytes = resp.body_mut().read_to_vec()?;
        Ok(ReferentialTable::decode(&bytes)?)
    }

    fn send_command(&self, token: &AccessToken, command: &CloudCommand) -> Result<(), CloudError> {
        let url = self.url(&format!(
            "/installations/{}/zones/{}/commands",
            path_segment(&command.installation_id.0),
            path_segment(&command.zone_id.0)
        ));
        let body = match command.action {
            CloudAction::Setpoint(raw) => json!({ "setpoint": raw }),
            CloudAction::Mode(code) => json!({ "mode": code }),
        };
        debug!("POST {} {}", url, body);
        let resp = self
            .agent
            .post(&url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("Authorization", &format!("Bearer {}", token.secret()))
            .send_json(&body)?;
        Self::check(resp).map(|_| ())
    }
}

fn oauth_error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(v) => {
            let code = v.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            match v.get("error_description").and_then(Value::as_str) {
                Some(desc) => format!("{}: {}", code, desc),
                None => code.to_string(),
            }
        }
        Err(_) if body.trim().is_empty() => String::from("<no body>"),
        Err(_) => body.trim().chars().take(200).collect(),
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
