//! GitHub App client.
//!
//! The app authenticates with a short-lived RS256 JWT, exchanges it for installation tokens and
//! uses those to request just-in-time runner configurations. Installation tokens are cached
//! until shortly before they expire.
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Map;
use crate::common::clock::ClockRef;
use crate::common::config::GithubConfig;
use crate::common::timeutils::to_chrono;
use crate::upstream::{
    Connectivity, InstallationToken, RegistrationRequest, UpstreamClient, UpstreamError,
};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RUNNER_WORK_FOLDER: &str = "_work";

#[derive(Serialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct JitConfigRequest<'a> {
    name: &'a str,
    runner_group_id: u64,
    labels: &'a [String],
    work_folder: &'a str,
}

#[derive(Deserialize)]
struct JitConfigResponse {
    encoded_jit_config: String,
}

#[derive(Deserialize)]
struct AppResponse {
    slug: Option<String>,
}

pub struct GitHubAppClient {
    http: reqwest::Client,
    api_url: String,
    app_id: String,
    key: EncodingKey,
    runner_group_id: u64,
    refresh_margin: chrono::Duration,
    clock: ClockRef,
    tokens: Mutex<Map<u64, InstallationToken>>,
}

impl GitHubAppClient {
    pub fn new(
        config: &GithubConfig,
        app_id: &str,
        private_key: &str,
        clock: ClockRef,
    ) -> Result<Self, UpstreamError> {
        let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| UpstreamError::Auth(format!("Invalid app private key: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("spotrunner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            key,
            runner_group_id: config.runner_group_id,
            refresh_margin: to_chrono(config.token_refresh_margin),
            clock,
            tokens: Default::default(),
        })
    }

    /// Creates the client if the app credentials are configured.
    pub fn from_config(config: &GithubConfig, clock: ClockRef) -> crate::Result<Option<Self>> {
        let Some(app_id) = config.app_id.as_deref().filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        let Some(private_key) = config.load_private_key()? else {
            return Ok(None);
        };
        let client = Self::new(config, app_id, &private_key, clock)
            .map_err(|e| crate::Error::ConfigError(e.to_string()))?;
        Ok(Some(client))
    }

    fn app_jwt(&self) -> Result<String, UpstreamError> {
        let now = self.clock.now().timestamp();
        let claims = Claims {
            // Allow for clock drift between us and GitHub
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| UpstreamError::Auth(format!("Cannot sign app token: {e}")))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_url))
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header(API_VERSION_HEADER, API_VERSION)
    }

    fn is_fresh(&self, token: &InstallationToken) -> bool {
        self.clock.now() + self.refresh_margin < token.expires_at
    }

    async fn fetch_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<InstallationToken, UpstreamError> {
        let jwt = self.app_jwt()?;
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/app/installations/{installation_id}/access_tokens"),
            )
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(transport_error)?;
        let response: AccessTokenResponse = check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        Ok(InstallationToken {
            token: response.token,
            expires_at: response.expires_at,
        })
    }

    async fn get_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<InstallationToken, UpstreamError> {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&installation_id) {
            if self.is_fresh(token) {
                return Ok(token.clone());
            }
        }
        log::debug!("Requesting a new token of installation {installation_id}");
        let token = self.fetch_installation_token(installation_id).await?;
        tokens.insert(installation_id, token.clone());
        Ok(token)
    }

    async fn request_registration_config(
        &self,
        token: &InstallationToken,
        request: &RegistrationRequest,
    ) -> Result<String, UpstreamError> {
        let body = JitConfigRequest {
            name: &request.runner_name,
            runner_group_id: self.runner_group_id,
            labels: &request.labels,
            work_folder: RUNNER_WORK_FOLDER,
        };
        let response = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/repos/{}/actions/runners/generate-jitconfig",
                    request.repo_full_name
                ),
            )
            .bearer_auth(&token.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response: JitConfigResponse = check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        if response.encoded_jit_config.is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "Empty runner configuration".to_string(),
            ));
        }
        Ok(response.encoded_jit_config)
    }

    async fn app_identity(&self) -> Result<AppResponse, UpstreamError> {
        let jwt = self.app_jwt()?;
        let response = self
            .request(reqwest::Method::GET, "/app")
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(error.to_string())
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(UpstreamError::Auth(message))
    } else {
        Err(UpstreamError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Sorts the outcome of the identity handshake into the categories shown to operators.
pub fn categorize(result: Result<Option<String>, UpstreamError>) -> Connectivity {
    match result {
        Ok(app_slug) => Connectivity::Connected { app_slug },
        Err(UpstreamError::Auth(_)) | Err(UpstreamError::Http { status: 403, .. }) => {
            Connectivity::AuthenticationError(
                "GitHub rejected the app credentials".to_string(),
            )
        }
        Err(UpstreamError::NotConfigured) => Connectivity::AuthenticationError(
            "GitHub app credentials are not configured".to_string(),
        ),
        Err(UpstreamError::Transport(_)) => {
            Connectivity::Unreachable("Cannot reach the GitHub API".to_string())
        }
        Err(UpstreamError::Http { status, .. }) => {
            Connectivity::UnexpectedError(format!("GitHub API returned status {status}"))
        }
        Err(UpstreamError::InvalidResponse(_)) => {
            Connectivity::UnexpectedError("Unexpected response from the GitHub API".to_string())
        }
    }
}

impl UpstreamClient for GitHubAppClient {
    fn installation_token(
        &self,
        installation_id: u64,
    ) -> BoxFuture<'_, Result<InstallationToken, UpstreamError>> {
        Box::pin(self.get_installation_token(installation_id))
    }

    fn registration_config<'a>(
        &'a self,
        token: &'a InstallationToken,
        request: &'a RegistrationRequest,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(self.request_registration_config(token, request))
    }

    fn check_connectivity(&self) -> BoxFuture<'_, Connectivity> {
        Box::pin(async move {
            let result = self.app_identity().await.map(|app| app.slug);
            if let Err(error) = &result {
                log::warn!("GitHub connectivity check failed: {error}");
            }
            categorize(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::{Clock, ManualClock};
    use chrono::TimeZone;
    use jsonwebtoken::{DecodingKey, Validation};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{bearer_token, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/github-app-test-key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/github-app-test-key.pub.pem");

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap(),
        ))
    }

    fn client(server: &MockServer, clock: Arc<ManualClock>) -> GitHubAppClient {
        let config = GithubConfig {
            api_url: format!("{}/", server.uri()),
            ..Default::default()
        };
        GitHubAppClient::new(&config, "1234", PRIVATE_KEY, clock).unwrap()
    }

    fn token_response(token: &str, expires_at: DateTime<Utc>) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({
            "token": token,
            "expires_at": expires_at.to_rfc3339(),
            "permissions": {"administration": "write"}
        }))
    }

    #[derive(Deserialize)]
    struct DecodedClaims {
        iat: i64,
        exp: i64,
        iss: String,
    }

    #[tokio::test]
    async fn exchange_installation_token() {
        let server = MockServer::start().await;
        let clock = clock();
        Mock::given(method("POST"))
            .and(path("/app/installations/77/access_tokens"))
            .and(header("accept", ACCEPT))
            .and(header("x-github-api-version", API_VERSION))
            .respond_with(token_response("ghs_first", clock.now() + chrono::Duration::hours(1)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, clock.clone());
        let token = client.installation_token(77).await.unwrap();
        assert_eq!(token.token, "ghs_first");

        let requests = server.received_requests().await.unwrap();
        let authorization = requests[0]
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap();
        let jwt = authorization.strip_prefix("Bearer ").unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        let claims = jsonwebtoken::decode::<DecodedClaims>(
            jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap()
        .claims;
        assert_eq!(claims.iss, "1234");
        assert_eq!(claims.iat, clock.now().timestamp() - 60);
        assert_eq!(claims.exp, clock.now().timestamp() + 600);
    }

    #[tokio::test]
    async fn cache_token_until_refresh_margin() {
        let server = MockServer::start().await;
        let clock = clock();
        let expires_at = clock.now() + chrono::Duration::hours(1);
        Mock::given(method("POST"))
            .and(path("/app/installations/77/access_tokens"))
            .respond_with(token_response("ghs_cached", expires_at))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server, clock.clone());
        client.installation_token(77).await.unwrap();
        clock.advance(chrono::Duration::minutes(54));
        client.installation_token(77).await.unwrap();
        // Less than five minutes before expiry
        clock.advance(chrono::Duration::minutes(2));
        client.installation_token(77).await.unwrap();
    }

    #[tokio::test]
    async fn request_jit_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/widgets/actions/runners/generate-jitconfig"))
            .and(bearer_token("ghs_token"))
            .and(body_partial_json(json!({
                "name": "linux-42",
                "runner_group_id": 1,
                "labels": ["spotrunner/linux", "linux"],
                "work_folder": "_work"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "runner": {"id": 23, "name": "linux-42"},
                "encoded_jit_config": "ZW5jb2RlZA=="
            })))
            .expect(1)
            .mount(&server)
            .await;

        let clock = clock();
        let client = client(&server, clock.clone());
        let token = InstallationToken {
            token: "ghs_token".to_string(),
            expires_at: clock.now() + chrono::Duration::hours(1),
        };
        let request = RegistrationRequest {
            repo_full_name: "octo/widgets".to_string(),
            runner_name: "linux-42".to_string(),
            labels: vec!["spotrunner/linux".to_string(), "linux".to_string()],
        };
        let config = client.registration_config(&token, &request).await.unwrap();
        assert_eq!(config, "ZW5jb2RlZA==");
    }

    #[tokio::test]
    async fn report_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/77/access_tokens"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;
        let client = client(&server, clock());
        assert_eq!(
            client.installation_token(77).await.unwrap_err(),
            UpstreamError::Http {
                status: 404,
                message: "Not Found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn connectivity_connected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 1234, "slug": "spot-app"})),
            )
            .mount(&server)
            .await;
        let client = client(&server, clock());
        assert_eq!(
            client.check_connectivity().await,
            Connectivity::Connected {
                app_slug: Some("spot-app".to_string())
            }
        );
    }

    #[tokio::test]
    async fn connectivity_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;
        let client = client(&server, clock());
        assert!(matches!(
            client.check_connectivity().await,
            Connectivity::AuthenticationError(_)
        ));
    }

    #[tokio::test]
    async fn connectivity_unreachable() {
        let config = GithubConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let client = GitHubAppClient::new(&config, "1234", PRIVATE_KEY, clock()).unwrap();
        assert!(matches!(
            client.check_connectivity().await,
            Connectivity::Unreachable(_)
        ));
    }

    #[test]
    fn categorize_outcomes() {
        assert!(matches!(
            categorize(Err(UpstreamError::Http {
                status: 500,
                message: String::new()
            })),
            Connectivity::UnexpectedError(_)
        ));
        assert!(matches!(
            categorize(Err(UpstreamError::Http {
                status: 403,
                message: String::new()
            })),
            Connectivity::AuthenticationError(_)
        ));
    }

    #[test]
    fn reject_invalid_key() {
        let result = GitHubAppClient::new(&GithubConfig::default(), "1", "not a key", clock());
        assert!(matches!(result, Err(UpstreamError::Auth(_))));
    }

    #[test]
    fn missing_credentials() {
        let config = GithubConfig {
            app_id: Some("1".to_string()),
            ..Default::default()
        };
        assert!(GitHubAppClient::from_config(&config, clock()).unwrap().is_none());
    }
}
