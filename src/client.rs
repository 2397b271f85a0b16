//! Blocking HTTP client for the Mars Hydro cloud API.
//!
//! - Every call is a JSON `POST`; the vendor answers with a `{code, msg, data}` envelope.
//! - Uses models in `crate::models::marshydro`.
//! - Device listing only ever requests page 0; the vendor paginates but accounts
//!   with more than one page of devices have not been observed.
//!
//! Authentication
//! - E-mail/password login yields an opaque token, held in a [`Session`] and reused
//!   until it ages out of the freshness window.
//! - A token-expired reply triggers one re-login and one retry of the same request.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::marshydro::*;
use crate::session::{Credentials, DEFAULT_FRESHNESS, Session};
use crate::transport::{Transport, UreqTransport};

pub const BASE_URL: &str = "https://api.lgledsolutions.com/api/android";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const LOGIN_PATH: &str = "/ulogin/mailLogin/v1";
const DEVICE_LIST_PATH: &str = "/udm/getDeviceList/v1";
const DEVICE_DETAIL_PATH: &str = "/udm/getDeviceDetail/v1";
const ADJUST_LIGHT_PATH: &str = "/udm/adjustLight/v1";
const LAMP_SWITCH_PATH: &str = "/udm/lampSwitch/v1";

/// Lowest brightness/speed percentage the vendor accepts.
pub const BRIGHTNESS_MIN: u8 = 25;
pub const BRIGHTNESS_MAX: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Authentication(String),
    Transport(String),
    Protocol(String),
    Validation(String),
    NotFound(DeviceId),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Authentication(s) => write!(f, "authentication error: {}", s),
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Protocol(s) => write!(f, "protocol error: {}", s),
            ClientError::Validation(s) => write!(f, "validation error: {}", s),
            ClientError::NotFound(id) => write!(f, "device {} not found", id),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Protocol(value.to_string())
    }
}

impl ClientError {
    /// Whether the next scheduled poll may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Protocol(_))
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub freshness: Duration,
    pub timeout: Duration,
    pub profile: ClientProfile,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            base_url: BASE_URL.to_string(),
            freshness: DEFAULT_FRESHNESS,
            timeout: DEFAULT_TIMEOUT,
            profile: ClientProfile::default(),
        }
    }
}

enum Reply {
    Data(Value),
    TokenExpired,
}

pub struct MarsHydroClient<T: Transport = UreqTransport> {
    transport: T,
    base_url: String,
    profile: ClientProfile,
    session: Mutex<Session>,
}

impl MarsHydroClient<UreqTransport> {
    pub fn new(credentials: Credentials, options: ClientOptions) -> Self {
        let transport = UreqTransport::new(options.timeout);
        MarsHydroClient::with_transport(transport, credentials, options)
    }
}

/// One-shot credential check with a throwaway client, as a setup form would do.
/// `Ok(false)` means the vendor rejected the credentials.
pub fn validate_credentials(credentials: Credentials, options: ClientOptions) -> Result<bool, ClientError> {
    MarsHydroClient::new(credentials, options).check_credentials()
}

impl<T: Transport> MarsHydroClient<T> {
    pub fn with_transport(transport: T, credentials: Credentials, options: ClientOptions) -> Self {
        MarsHydroClient {
            transport,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            profile: options.profile,
            session: Mutex::new(Session::new(credentials, options.freshness)),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a usable token, logging in first when none is held or it went stale.
    /// Within the freshness window this makes no network call.
    pub fn login(&self) -> Result<String, ClientError> {
        let mut session = self.session();
        if let Some(token) = session.fresh_token(Instant::now()) {
            debug!("Token still fresh; skipping login");
            return Ok(token.to_string());
        }
        self.authenticate(&mut session)
    }

    pub fn ensure_valid_token(&self) -> Result<String, ClientError> {
        self.login()
    }

    pub fn check_credentials(&self) -> Result<bool, ClientError> {
        match self.login() {
            Ok(_) => Ok(true),
            Err(ClientError::Authentication(msg)) => {
                warn!("Credentials rejected: {}", msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // Runs with the session lock held so concurrent callers never log in twice.
    fn authenticate(&self, session: &mut Session) -> Result<String, ClientError> {
        let creds = session.credentials();
        let body = serde_json::to_value(LoginRequest {
            email: &creds.username,
            password: &creds.password,
            login_method: "1",
        })?;
        let data = match self.post_once(LOGIN_PATH, None, &body, None)? {
            Reply::Data(data) => data,
            Reply::TokenExpired => {
                return Err(ClientError::Authentication("login answered with token-expired".into()));
            }
        };
        let LoginData { token } = decode(data, "login")?;
        session.store(token.clone(), Instant::now());
        info!("Logged in to Mars Hydro cloud as {}", session.credentials().username);
        Ok(token)
    }

    fn post_once(
        &self,
        path: &str,
        device_id: Option<DeviceId>,
        body: &Value,
        token: Option<&str>,
    ) -> Result<Reply, ClientError> {
        let system_data = serde_json::to_string(&SystemData::build(Utc::now(), token, device_id, &self.profile))?;
        let url = self.url(path);
        debug!("POST {}", url);
        let raw = self.transport.post_json(&url, &system_data, body)?;
        decode_envelope(&raw)
    }

    fn call(&self, path: &str, device_id: Option<DeviceId>, body: &impl Serialize) -> Result<Value, ClientError> {
        let body = serde_json::to_value(body)?;
        let token = self.ensure_valid_token()?;
        match self.post_once(path, device_id, &body, Some(&token))? {
            Reply::Data(data) => return Ok(data),
            Reply::TokenExpired => warn!("Token rejected by {}; logging in again", path),
        }

        let token = {
            let mut session = self.session();
            session.invalidate_if(&token);
            match session.fresh_token(Instant::now()) {
                // another caller already replaced the rejected token
                Some(t) => t.to_string(),
                None => self.authenticate(&mut session)?,
            }
        };

        match self.post_once(path, device_id, &body, Some(&token))? {
            Reply::Data(data) => Ok(data),
            Reply::TokenExpired => Err(ClientError::Authentication(format!(
                "token rejected again by {} after re-login",
                path
            ))),
        }
    }

    /// Lists the account's devices (page 0 only). Records that fail validation are
    /// skipped with a warning; unsupported product types are returned as-is.
    pub fn list_devices(&self) -> Result<Vec<Device>, ClientError> {
        let data = self.call(DEVICE_LIST_PATH, None, &DeviceListRequest { current_page: 0 })?;
        let page: DeviceListPage = decode(data, "device list")?;
        let mut devices = Vec::with_capacity(page.list.len());
        for value in &page.list {
            match Device::from_value(value, None) {
                Ok(d) => devices.push(d),
                Err(e) => warn!("Skipping device list entry: {}", e),
            }
        }
        debug!("Device list: {} entries, {} usable", page.list.len(), devices.len());
        Ok(devices)
    }

    pub fn get_device_detail(&self, id: DeviceId) -> Result<Device, ClientError> {
        let data = self.call(DEVICE_DETAIL_PATH, Some(id), &DeviceDetailRequest { device_id: id })?;
        let empty = match &data {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            _ => false,
        };
        if empty {
            return Err(ClientError::NotFound(id));
        }
        let device = Device::from_value(&data, Some(id)).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if device.id != id {
            warn!("Detail request for device {} answered with device {}", id, device.id);
            return Err(ClientError::NotFound(id));
        }
        Ok(device)
    }

    /// Sets light brightness (or fan speed) in percent. Rejected locally outside 25..=100.
    pub fn set_brightness(&self, id: DeviceId, percentage: u8) -> Result<(), ClientError> {
        if !(BRIGHTNESS_MIN..=BRIGHTNESS_MAX).contains(&percentage) {
            return Err(ClientError::Validation(format!(
                "brightness {}% outside {}..={}",
                percentage, BRIGHTNESS_MIN, BRIGHTNESS_MAX
            )));
        }
        let body = AdjustLightRequest {
            light: percentage,
            device_id: id,
            group_id: None,
        };
        self.call(ADJUST_LIGHT_PATH, Some(id), &body)?;
        info!("Device {} brightness set to {}%", id, percentage);
        Ok(())
    }

    /// `closed = true` switches the device off.
    pub fn toggle_power(&self, id: DeviceId, closed: bool) -> Result<(), ClientError> {
        let body = LampSwitchRequest {
            is_close: closed,
            device_id: id,
            group_id: None,
        };
        self.call(LAMP_SWITCH_PATH, Some(id), &body)?;
        info!("Device {} switched {}", id, if closed { "off" } else { "on" });
        Ok(())
    }
}

fn decode_envelope(raw: &str) -> Result<Reply, ClientError> {
    let mut de = serde_json::Deserializer::from_str(raw);
    let resp: ApiResponse = serde_path_to_error::deserialize(&mut de).map_err(|e| {
        ClientError::Protocol(format!("malformed response at `{}`: {}", e.path(), e.inner()))
    })?;
    let msg = resp.msg.unwrap_or_default();
    match resp.code {
        ResponseCode::Success => Ok(Reply::Data(resp.data.unwrap_or(Value::Null))),
        ResponseCode::TokenExpired => Ok(Reply::TokenExpired),
        ResponseCode::InvalidCredentials => Err(ClientError::Authentication(msg)),
        ResponseCode::Other(code) => Err(ClientError::Protocol(format!("unexpected code {}: {}", code, msg))),
    }
}

fn decode<D: DeserializeOwned>(data: Value, what: &str) -> Result<D, ClientError> {
    serde_path_to_error::deserialize(data)
        .map_err(|e| ClientError::Protocol(format!("{}: invalid value at `{}`: {}", what, e.path(), e.inner())))
}
