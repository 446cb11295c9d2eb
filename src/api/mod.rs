use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::Instant};

const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Typed client for the coordinating server's REST surface.
///
/// All calls are bearer-authenticated. Failures are surfaced to the caller;
/// whether they are fatal is the caller's decision (heartbeat failures are
/// logged, for instance, while a failed ready handshake aborts startup).
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    bearer: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, bearer: impl Into<String>) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        let bearer = bearer.into();
        if bearer.trim().is_empty() {
            return Err(ApiError::Config("bearer token must not be empty"));
        }

        let mut parsed =
            Url::parse(base_url.trim()).map_err(|err| ApiError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ApiError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            bearer,
        })
    }

    /// Posts a heartbeat and returns the measured round-trip time in ms.
    pub async fn heartbeat(&self, ping: u32, current_game: &str) -> Result<u32, ApiError> {
        let req = self.build_heartbeat_request(ping, current_game)?;
        let start = Instant::now();
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let rtt_ms = start.elapsed().as_millis().min(u32::MAX as u128) as u32;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        Ok(rtt_ms)
    }

    /// Completes the ready handshake and returns the server's assigned game
    /// and scheduled phase.
    pub async fn ready(&self) -> Result<ReadyResponse, ApiError> {
        let req = self.build_request(Method::POST, "api/ready", None::<&()>)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        if !status.is_success() {
            return Err(ApiError::Api { status, body });
        }
        serde_json::from_str(&body).map_err(ApiError::Json)
    }

    pub async fn swap_complete(&self, round_number: u32) -> Result<(), ApiError> {
        let payload = SwapCompleteRequest { round_number };
        let req = self.build_request(Method::POST, "api/swap-complete", Some(&payload))?;
        self.execute_expect_success(req).await
    }

    pub async fn game_started(&self, current_game: &str) -> Result<(), ApiError> {
        let payload = GameStartedRequest {
            current_game: current_game.to_string(),
        };
        let req = self.build_request(Method::POST, "api/game-started", Some(&payload))?;
        self.execute_expect_success(req).await
    }

    pub async fn game_stopped(&self) -> Result<(), ApiError> {
        let req = self.build_request(Method::POST, "api/game-stopped", None::<&()>)?;
        self.execute_expect_success(req).await
    }

    /// Resolves an asset path (e.g. `api/roms/<file>`) against the base URL.
    pub fn asset_url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|err| ApiError::Url(err.to_string()))
    }

    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    async fn execute_expect_success(&self, req: Request) -> Result<(), ApiError> {
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        Ok(())
    }

    pub fn build_heartbeat_request(
        &self,
        ping: u32,
        current_game: &str,
    ) -> Result<Request, ApiError> {
        let payload = HeartbeatRequest {
            ping,
            current_game: current_game.to_string(),
        };
        self.build_request(Method::POST, "api/heartbeat", Some(&payload))
    }

    fn build_request<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&T>,
    ) -> Result<Request, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| ApiError::Url(err.to_string()))?;
        let mut builder = self.http.request(method, url).headers(self.common_headers()?);
        if let Some(payload) = payload {
            let body = serde_json::to_vec(payload).map_err(ApiError::Json)?;
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }
        builder.build().map_err(ApiError::Http)
    }

    fn common_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.bearer))
                .map_err(ApiError::InvalidHeaderValue)?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    InvalidHeaderValue(reqwest::header::InvalidHeaderValue),
    Api { status: StatusCode, body: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::InvalidHeaderValue(err) => write!(f, "invalid header value: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Serialize)]
struct HeartbeatRequest {
    ping: u32,
    current_game: String,
}

#[derive(Debug, Clone, Serialize)]
struct SwapCompleteRequest {
    round_number: u32,
}

#[derive(Debug, Clone, Serialize)]
struct GameStartedRequest {
    current_game: String,
}

/// Server's answer to the ready handshake: the assigned game file plus the
/// currently scheduled phase and its effective epoch time.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyResponse {
    #[serde(default)]
    pub game_file: Option<String>,
    pub state: String,
    pub state_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn client() -> ApiClient {
        ApiClient::new("http://shuffler.test:8080", "tok-123").unwrap()
    }

    #[test]
    fn rejects_empty_bearer() {
        let err = ApiClient::new("http://shuffler.test", "   ").unwrap_err();
        assert!(format!("{err}").contains("bearer"));
    }

    #[test]
    fn heartbeat_request_carries_auth_and_json_body() {
        let req = client().build_heartbeat_request(42, "smb3.nes").unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "http://shuffler.test:8080/api/heartbeat");
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("Bearer tok-123")
        );
        assert_eq!(
            req.headers().get(ACCEPT).unwrap(),
            &HeaderValue::from_static("application/json")
        );
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/json")
        );

        let body = req.body().unwrap().as_bytes().unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["ping"], 42);
        assert_eq!(json["current_game"], "smb3.nes");
    }

    #[test]
    fn bodyless_posts_skip_content_type() {
        let req = client()
            .build_request::<()>(Method::POST, "api/game-stopped", None)
            .unwrap();
        assert_eq!(req.url().as_str(), "http://shuffler.test:8080/api/game-stopped");
        assert!(req.headers().get(CONTENT_TYPE).is_none());
        assert!(req.body().is_none());
    }

    #[test]
    fn base_url_gains_trailing_slash_for_joins() {
        let client = ApiClient::new("http://shuffler.test:8080/prefix", "tok").unwrap();
        let url = client.asset_url("api/roms/smb3.nes").unwrap();
        assert_eq!(url.as_str(), "http://shuffler.test:8080/prefix/api/roms/smb3.nes");
    }

    #[test]
    fn ready_response_tolerates_missing_game_file() {
        let resp: ReadyResponse =
            serde_json::from_str(r#"{"state":"start","state_at":1700000000}"#).unwrap();
        assert!(resp.game_file.is_none());
        assert_eq!(resp.state, "start");
        assert_eq!(resp.state_at, 1_700_000_000);
    }
}
