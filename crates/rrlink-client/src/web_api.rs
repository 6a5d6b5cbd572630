//! Cloud REST Client
//!
//! Account endpoints (login, verification codes, home id, products,
//! plugin downloads) live on
//! the regional account server, are identified by a `header_clientid` and
//! answer `{"code": 200, "data": ...}`. Device endpoints (homes, rooms,
//! scenes, device pairing) live on the account's IoT endpoint, carry a
//! Hawk `Authorization` header and answer `{"success": true, "result": ...}`.
//!
//! Logins and home data requests pass through the process-wide
//! [`RateLimiter`] before any network traffic.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use reqwest::{Client, Method, RequestBuilder};
use rrlink_common::auth::{self, Params, SigningCredential};
use rrlink_common::protocol::{Result, RrError};
use rrlink_common::rate_limit::{RateLimiter, HOME_DATA_RATES, LOGIN_RATES};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Account server used to discover the regional base URL.
pub const DEFAULT_ACCOUNT_URL: &str = "https://euiot.roborock.com";

/// Default timeout for REST calls (30 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Limiter category for logins and verification codes.
pub const LOGIN_CATEGORY: &str = "login";

/// Limiter category for home data requests.
pub const HOME_DATA_CATEGORY: &str = "home_data";

/// Plugin API level and type sent to the plugin endpoints.
const PLUGIN_API_LEVEL: u32 = 99999;
const PLUGIN_TYPE: u32 = 2;

/// Limiter shared by every client in the process.
pub fn shared_limiter() -> &'static RateLimiter {
    static LIMITER: OnceLock<RateLimiter> = OnceLock::new();
    LIMITER.get_or_init(|| {
        RateLimiter::new()
            .with_category(LOGIN_CATEGORY, &LOGIN_RATES)
            .with_category(HOME_DATA_CATEGORY, &HOME_DATA_RATES)
    })
}

/// Endpoint reference inside [`Rriot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RriotReference {
    #[serde(default)]
    pub r: Option<String>,
    /// REST endpoint for signed calls
    pub a: String,
    /// Broker URL
    #[serde(default)]
    pub m: Option<String>,
    #[serde(default)]
    pub l: Option<String>,
}

/// IoT key material returned at login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rriot {
    pub u: String,
    pub s: String,
    pub h: String,
    pub k: String,
    pub r: RriotReference,
}

impl std::fmt::Debug for Rriot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rriot")
            .field("u", &self.u)
            .field("s", &self.s)
            .field("h", &"*****")
            .field("k", &"*****")
            .field("r", &self.r)
            .finish()
    }
}

/// Login result. Fields other than the token and key material are kept
/// as-is in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub token: String,
    pub rriot: Rriot,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl UserData {
    /// Credential for signing device endpoint calls.
    pub fn credential(&self) -> SigningCredential {
        SigningCredential::new(
            self.rriot.u.clone(),
            self.rriot.s.clone(),
            self.rriot.h.clone(),
            self.rriot.r.a.clone(),
        )
    }
}

/// Home data endpoint revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomeDataVersion {
    #[default]
    V1,
    V2,
    V3,
}

impl HomeDataVersion {
    fn path(self, home_id: i64) -> String {
        match self {
            HomeDataVersion::V1 => format!("/user/homes/{}", home_id),
            HomeDataVersion::V2 => format!("/v2/user/homes/{}", home_id),
            HomeDataVersion::V3 => format!("/v3/user/homes/{}", home_id),
        }
    }
}

impl std::str::FromStr for HomeDataVersion {
    type Err = RrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "v1" => Ok(HomeDataVersion::V1),
            "2" | "v2" => Ok(HomeDataVersion::V2),
            "3" | "v3" => Ok(HomeDataVersion::V3),
            other => Err(RrError::InvalidRequest(format!(
                "unknown home data version '{}'",
                other
            ))),
        }
    }
}

/// Client for the cloud REST API of one account.
pub struct WebApiClient {
    http: Client,
    timeout: Duration,
    username: String,
    account_url: String,
    base_url: Mutex<Option<String>>,
    device_identifier: String,
    limiter: RateLimiter,
}

impl WebApiClient {
    /// Creates a client for `username` (the account email).
    pub fn new(username: impl Into<String>) -> Result<Self> {
        Self::with_timeout(username, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(username: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RrError::Http(format!("Failed to create HTTP client: {}", e)))?;

        let mut identifier = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut identifier);

        Ok(Self {
            http,
            timeout,
            username: username.into(),
            account_url: DEFAULT_ACCOUNT_URL.to_string(),
            base_url: Mutex::new(None),
            device_identifier: URL_SAFE_NO_PAD.encode(identifier),
            limiter: shared_limiter().clone(),
        })
    }

    /// Overrides the discovery server.
    pub fn with_account_url(mut self, url: impl Into<String>) -> Self {
        self.account_url = url.into();
        self
    }

    /// Presets the regional base URL, skipping discovery.
    pub fn with_base_url(self, url: impl Into<String>) -> Self {
        *self.base_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.into());
        self
    }

    /// Uses a dedicated limiter instead of the process-wide one.
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn client_id(&self) -> String {
        auth::client_id_header(&self.username, &self.device_identifier)
    }

    /// Regional account server for this user, discovered once and cached.
    pub async fn base_url(&self) -> Result<String> {
        let cached = self
            .base_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(url) = cached {
            return Ok(url);
        }

        let params = [
            ("email", self.username.as_str()),
            ("needtwostepauth", "false"),
        ];
        let request = self
            .http
            .post(format!("{}/api/v1/getUrlByEmail", self.account_url))
            .query(&params);
        let data = account_data(self.send_json(request).await?)?;

        let url = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| RrError::InvalidResponse("getUrlByEmail response has no url".to_string()))?
            .to_string();

        tracing::debug!("base url for {} is {}", self.username, url);
        *self.base_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        Ok(url)
    }

    /// Asks the server to email a login code.
    pub async fn request_code(&self) -> Result<()> {
        self.limiter.try_acquire(LOGIN_CATEGORY)?;
        let base_url = self.base_url().await?;

        let params = [("username", self.username.as_str()), ("type", "auth")];
        let request = self
            .http
            .post(format!("{}/api/v1/sendEmailCode", base_url))
            .header("header_clientid", self.client_id())
            .query(&params);
        account_data(self.send_json(request).await?)?;

        tracing::info!("login code requested for {}", self.username);
        Ok(())
    }

    /// Logs in with the account password.
    pub async fn pass_login(&self, password: &str) -> Result<UserData> {
        self.limiter.try_acquire(LOGIN_CATEGORY)?;
        let base_url = self.base_url().await?;

        let params = [
            ("username", self.username.as_str()),
            ("password", password),
            ("needtwostepauth", "false"),
        ];
        let request = self
            .http
            .post(format!("{}/api/v1/login", base_url))
            .header("header_clientid", self.client_id())
            .query(&params);
        let data = account_data(self.send_json(request).await?)?;

        tracing::info!("logged in as {}", self.username);
        parse_user_data(data)
    }

    /// Logs in with a code from [`request_code`](Self::request_code).
    pub async fn code_login(&self, code: &str) -> Result<UserData> {
        let base_url = self.base_url().await?;

        let params = [
            ("username", self.username.as_str()),
            ("verifycode", code),
            ("verifycodetype", "AUTH_EMAIL_CODE"),
        ];
        let request = self
            .http
            .post(format!("{}/api/v1/loginWithCode", base_url))
            .header("header_clientid", self.client_id())
            .query(&params);
        let data = account_data(self.send_json(request).await?)?;

        tracing::info!("logged in as {} with email code", self.username);
        parse_user_data(data)
    }

    /// Id of the user's home.
    pub async fn home_id(&self, user: &UserData) -> Result<i64> {
        let base_url = self.base_url().await?;

        let request = self
            .http
            .get(format!("{}/api/v1/getHomeDetail", base_url))
            .header("header_clientid", self.client_id())
            .header("Authorization", user.token.as_str());
        let data = account_data(self.send_json(request).await?)?;

        data.get("rrHomeId")
            .and_then(Value::as_i64)
            .ok_or_else(|| RrError::InvalidResponse("home detail has no rrHomeId".to_string()))
    }

    /// Devices, products and rooms of the user's home.
    pub async fn home_data(&self, user: &UserData, version: HomeDataVersion) -> Result<Value> {
        self.limiter.try_acquire(HOME_DATA_CATEGORY)?;
        let home_id = self.home_id(user).await?;
        self.signed(user, Method::GET, &version.path(home_id), None, None)
            .await
    }

    pub async fn rooms(&self, user: &UserData, home_id: Option<i64>) -> Result<Value> {
        let home_id = match home_id {
            Some(id) => id,
            None => self.home_id(user).await?,
        };
        let path = format!("/user/homes/{}/rooms", home_id);
        self.signed(user, Method::GET, &path, None, None).await
    }

    /// Scenes (routines) attached to a device.
    pub async fn scenes(&self, user: &UserData, device_id: &str) -> Result<Value> {
        let path = format!("/user/scene/device/{}", device_id);
        self.signed(user, Method::GET, &path, None, None).await
    }

    pub async fn execute_scene(&self, user: &UserData, scene_id: i64) -> Result<()> {
        let path = format!("/user/scene/{}/execute", scene_id);
        self.signed(user, Method::POST, &path, None, None).await?;
        tracing::info!("scene {} executed", scene_id);
        Ok(())
    }

    /// Product catalogue for the account.
    pub async fn products(&self, user: &UserData) -> Result<Value> {
        let base_url = self.base_url().await?;

        let request = self
            .http
            .get(format!("{}/api/v4/product", base_url))
            .header("header_clientid", self.client_id())
            .header("Authorization", user.token.as_str());
        account_data(self.send_json(request).await?)
    }

    /// Download URL of the app plugin for `product_id`.
    pub async fn download_code(&self, user: &UserData, product_id: i64) -> Result<String> {
        let base_url = self.base_url().await?;

        let request = self
            .http
            .post(format!("{}/api/v1/appplugin", base_url))
            .header("header_clientid", self.client_id())
            .header("Authorization", user.token.as_str())
            .json(&serde_json::json!({
                "apilevel": PLUGIN_API_LEVEL,
                "productids": [product_id],
                "type": PLUGIN_TYPE,
            }));
        let data = account_data(self.send_json(request).await?)?;

        data.get(0)
            .and_then(|plugin| plugin.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                RrError::InvalidResponse(format!("no plugin url for product {}", product_id))
            })
    }

    /// Plugin download URLs keyed by device category.
    pub async fn download_category_code(&self, user: &UserData) -> Result<HashMap<String, String>> {
        let base_url = self.base_url().await?;

        let request = self
            .http
            .get(format!("{}/api/v1/plugins", base_url))
            .query(&[
                ("apiLevel", PLUGIN_API_LEVEL.to_string()),
                ("type", PLUGIN_TYPE.to_string()),
            ])
            .header("header_clientid", self.client_id())
            .header("Authorization", user.token.as_str());
        let data = account_data(self.send_json(request).await?)?;

        let plugins = data
            .get("categoryPluginList")
            .and_then(Value::as_array)
            .ok_or_else(|| RrError::InvalidResponse("missing categoryPluginList".to_string()))?;

        plugins
            .iter()
            .map(|plugin| {
                let category = plugin.get("category").and_then(Value::as_str);
                let url = plugin.get("url").and_then(Value::as_str);
                match (category, url) {
                    (Some(category), Some(url)) => Ok((category.to_string(), url.to_string())),
                    _ => Err(RrError::InvalidResponse(format!("malformed plugin entry: {}", plugin))),
                }
            })
            .collect()
    }

    /// Pairing parameters for adding a device to the home.
    pub async fn nc_prepare(&self, user: &UserData, timezone: &str) -> Result<Value> {
        let home_id = self.home_id(user).await?;

        let mut form = Params::new();
        form.insert("hid".to_string(), home_id.to_string());
        form.insert("tzid".to_string(), timezone.to_string());
        self.signed(user, Method::POST, "/nc/prepare", None, Some(&form))
            .await
    }

    /// Registers a freshly paired device.
    pub async fn add_device(&self, user: &UserData, s: &str, t: &str) -> Result<Value> {
        let mut query = Params::new();
        query.insert("s".to_string(), s.to_string());
        query.insert("t".to_string(), t.to_string());
        self.signed(user, Method::GET, "/user/devices/newadd", Some(&query), None)
            .await
    }

    async fn signed(
        &self,
        user: &UserData,
        method: Method,
        path: &str,
        query: Option<&Params>,
        form: Option<&Params>,
    ) -> Result<Value> {
        let credential = user.credential();
        let header = auth::sign(&credential, path, query, form)?;
        let url = format!("{}{}", credential.endpoint.trim_end_matches('/'), path);

        tracing::debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", header);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        iot_result(self.send_json(request).await?)
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        serde_json::from_slice(&body).map_err(|e| {
            RrError::InvalidResponse(format!("HTTP {} with non-JSON body: {}", status, e))
        })
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> RrError {
        if err.is_timeout() {
            RrError::Timeout(self.timeout.as_millis() as u64)
        } else {
            RrError::Http(err.to_string())
        }
    }
}

impl std::fmt::Debug for WebApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApiClient")
            .field("username", &self.username)
            .field("account_url", &self.account_url)
            .finish()
    }
}

/// Unwraps `{"code": 200, "data": ...}`.
fn account_data(response: Value) -> Result<Value> {
    let code = response.get("code").and_then(Value::as_i64);
    if code != Some(200) {
        let msg = response
            .get("msg")
            .or_else(|| response.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();
        return Err(RrError::from_api_code(code.unwrap_or(-1), msg));
    }
    Ok(response.get("data").cloned().unwrap_or(Value::Null))
}

/// Unwraps `{"success": true, "result": ...}`.
fn iot_result(response: Value) -> Result<Value> {
    if response.get("success").and_then(Value::as_bool) != Some(true) {
        let code = response.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let msg = response
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();
        return Err(RrError::RequestFailed { code, msg });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn parse_user_data(data: Value) -> Result<UserData> {
    serde_json::from_value(data)
        .map_err(|e| RrError::InvalidResponse(format!("unexpected login data: {}", e)))
}
