//! Legacy Docker Registry API v1 client.
//!
//! v1 splits across an "index" (session/token authority) and a "registry"
//! (image data). Session continuity rides on an `X-Docker-Token` header
//! turned into `Authorization: Token …`, plus cookies, which the HTTP
//! client's cookie store handles. There is no content digest scheme:
//! layer downloads resolve redirects but perform no verification, the
//! pre-v2 trust model.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::USER_AGENT;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::reference::{Reference, parse_repo_and_ref};
use crate::registry::auth::basic_auth_header;
use crate::registry::quirks;
use crate::registry::transport::{self, ResponseInfo};

/// Index endpoint for repositories on the official index.
pub const DEFAULT_INDEX_URL: &str = "https://index.docker.io";

/// Registry endpoint for repositories on the official index.
pub const DEFAULT_V1_REGISTRY_URL: &str = "https://registry-1.docker.io";

const DEFAULT_USER_AGENT: &str = concat!("docker-image-puller/", env!("CARGO_PKG_VERSION"));

/// An entry from `GET /v1/repositories/<name>/images`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoImage {
    pub id: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// `GET /v1/search` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub num_results: Option<u64>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Session state from the index token handshake. Owned by the client and
/// consulted by every registry-side operation.
#[derive(Debug, Default)]
struct LegacySession {
    /// Whether the registry runs without Hub token auth. `None` until the
    /// ping (or a quirk) decides.
    standalone: Option<bool>,
    /// Complete `Authorization: Token …` header value.
    token_header: Option<String>,
    /// Registry endpoints advertised via `X-Docker-Endpoints`.
    endpoints: Vec<String>,
}

/// Builder for [`LegacyRegistryClient`].
#[derive(Debug, Clone)]
pub struct LegacyRegistryClientBuilder {
    name: String,
    username: Option<String>,
    password: Option<String>,
    insecure: bool,
    standalone: Option<bool>,
    user_agent: Option<String>,
}

impl LegacyRegistryClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: None,
            password: None,
            insecure: false,
            standalone: None,
            user_agent: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Skip standalone detection and pin the answer.
    pub fn with_standalone(mut self, standalone: bool) -> Self {
        self.standalone = Some(standalone);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self) -> Result<LegacyRegistryClient> {
        let repo = parse_repo_and_ref(&self.name)?;

        let (index_url, registry_url) = if repo.index.official {
            (
                DEFAULT_INDEX_URL.to_string(),
                DEFAULT_V1_REGISTRY_URL.to_string(),
            )
        } else {
            // Like docker itself, prefer plain http for localhost
            // registries rather than probing https first.
            let scheme = repo.index.scheme.clone().unwrap_or_else(|| {
                if repo.index.is_localhost() {
                    "http".to_string()
                } else {
                    "https".to_string()
                }
            });
            let url = format!("{scheme}://{}", repo.index.name);
            (url.clone(), url)
        };

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true);
        if self.insecure {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let http = builder.build()?;

        let basic_header = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(basic_auth_header(username, password)),
            _ => None,
        };

        // The official index always delegates token auth to itself.
        let standalone = self
            .standalone
            .or(if repo.index.official { Some(false) } else { None });

        Ok(LegacyRegistryClient {
            repo,
            index_url,
            registry_url,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            basic_header,
            http: Some(http),
            session: Mutex::new(LegacySession {
                standalone,
                ..LegacySession::default()
            }),
        })
    }
}

/// Docker Registry API v1 client for a single repository.
pub struct LegacyRegistryClient {
    repo: Reference,
    index_url: String,
    registry_url: String,
    user_agent: String,
    basic_header: Option<String>,
    http: Option<Client>,
    session: Mutex<LegacySession>,
}

impl LegacyRegistryClient {
    pub fn builder(name: impl Into<String>) -> LegacyRegistryClientBuilder {
        LegacyRegistryClientBuilder::new(name)
    }

    pub fn new(name: &str) -> Result<Self> {
        LegacyRegistryClientBuilder::new(name).build()
    }

    pub fn repo(&self) -> &Reference {
        &self.repo
    }

    /// Registry endpoints advertised by the index, once a session exists.
    pub async fn endpoints(&self) -> Vec<String> {
        self.session.lock().await.endpoints.clone()
    }

    /// Release the HTTP connection pool. Idempotent.
    pub fn close(&mut self) {
        self.http = None;
    }

    fn http(&self) -> Result<&Client> {
        self.http.as_ref().ok_or(RegistryError::Closed)
    }

    fn request(&self, method: Method, url: &str, auth: Option<&str>) -> Result<reqwest::RequestBuilder> {
        let mut request = self
            .http()?
            .request(method, url)
            .header(USER_AGENT, &self.user_agent);
        if let Some(header) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        Ok(request)
    }

    /// `GET /v1/_ping` against the index.
    ///
    /// Decides `standalone` from the `X-Docker-Registry-Standalone` header
    /// (`1`/`true` means standalone) unless the quirks table pins it.
    pub async fn ping(&self) -> Result<Value> {
        let mut session = self.session.lock().await;
        self.ping_locked(&mut session).await
    }

    async fn ping_locked(&self, session: &mut LegacySession) -> Result<Value> {
        let url = format!("{}/v1/_ping", self.index_url);
        let response = self.request(Method::GET, &url, None)?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }

        let standalone_header = response
            .headers()
            .get("x-docker-registry-standalone")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if session.standalone.is_none() {
            let standalone = match quirks::quirks_for_host(&self.repo.index.name)
                .and_then(|quirk| quirk.standalone)
            {
                Some(pinned) => {
                    trace!(host = %self.repo.index.name, standalone = pinned, "standalone pinned by quirk, ignoring header");
                    pinned
                }
                None => standalone_header
                    .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true"))
                    .unwrap_or(false),
            };
            session.standalone = Some(standalone);
            trace!(standalone, "set standalone from ping response");
        }

        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Hit `listRepoImgs` with `X-Docker-Token: true`, capturing the
    /// session token and endpoint list from the response headers.
    async fn repo_imgs_request(&self, session: &mut LegacySession) -> Result<Vec<RepoImage>> {
        let url = format!(
            "{}/v1/repositories/{}/images",
            self.index_url, self.repo.remote_name
        );
        let response = self
            .request(Method::GET, &url, self.basic_header.as_deref())?
            .header("x-docker-token", "true")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }

        if let Some(endpoints) = response
            .headers()
            .get("x-docker-endpoints")
            .and_then(|v| v.to_str().ok())
        {
            let proto = Url::parse(&self.index_url)
                .map(|u| u.scheme().to_string())
                .unwrap_or_else(|_| "https".to_string());
            session.endpoints = endpoints
                .split(',')
                .map(|e| format!("{proto}://{}", e.trim()))
                .collect();
        }
        if let Some(token) = response
            .headers()
            .get("x-docker-token")
            .and_then(|v| v.to_str().ok())
        {
            session.token_header = Some(format!("Token {token}"));
            debug!(index = %self.repo.index.name, "session token acquired");
        }

        Ok(response.json().await?)
    }

    /// Detect standalone (ping) and acquire a session token when the index
    /// requires one, then hand back the auth header registry calls should
    /// carry.
    async fn ensure_session(&self) -> Result<Option<String>> {
        let mut session = self.session.lock().await;
        if session.standalone.is_none() {
            self.ping_locked(&mut session).await?;
        }
        if session.standalone == Some(false) && session.token_header.is_none() {
            self.repo_imgs_request(&mut session).await?;
        }
        Ok(session
            .token_header
            .clone()
            .or_else(|| self.basic_header.clone()))
    }

    /// `GET /v1/search?q=<term>` against the index.
    pub async fn search(&self, term: &str) -> Result<SearchResults> {
        let url = format!("{}/v1/search", self.index_url);
        let response = self
            .request(Method::GET, &url, self.basic_header.as_deref())?
            .query(&[("q", term)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `GET /v1/repositories/<name>/images`. Also captures the session
    /// token like the lazy handshake does.
    pub async fn list_repo_imgs(&self) -> Result<Vec<RepoImage>> {
        let mut session = self.session.lock().await;
        self.repo_imgs_request(&mut session).await
    }

    /// `GET /v1/repositories/<name>/tags` — tag name to image id.
    pub async fn list_repo_tags(&self) -> Result<HashMap<String, String>> {
        let auth = self.ensure_session().await?;
        let url = format!(
            "{}/v1/repositories/{}/tags",
            self.registry_url, self.repo.remote_name
        );
        let response = self.request(Method::GET, &url, auth.as_deref())?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `GET /v1/repositories/<name>/tags/<tag>` — the image id for a tag.
    pub async fn get_img_id(&self, tag: &str) -> Result<String> {
        let auth = self.ensure_session().await?;
        let url = format!(
            "{}/v1/repositories/{}/tags/{}",
            self.registry_url, self.repo.remote_name, tag
        );
        let response = self.request(Method::GET, &url, auth.as_deref())?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `GET /v1/images/<id>/ancestry` — all layer ids this image needs.
    pub async fn get_img_ancestry(&self, img_id: &str) -> Result<Vec<String>> {
        let auth = self.ensure_session().await?;
        let url = format!("{}/v1/images/{}/ancestry", self.registry_url, img_id);
        let response = self.request(Method::GET, &url, auth.as_deref())?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `GET /v1/images/<id>/json` — the image metadata. The response info
    /// is returned too: `X-Docker-Size` lives there.
    pub async fn get_img_json(&self, img_id: &str) -> Result<(Value, ResponseInfo)> {
        let auth = self.ensure_session().await?;
        let url = format!("{}/v1/images/{}/json", self.registry_url, img_id);
        let response = self.request(Method::GET, &url, auth.as_deref())?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        let info = ResponseInfo::from_response(&response);
        Ok((response.json().await?, info))
    }

    /// `GET /v1/images/<id>/layer` as a raw byte stream, resolving up to
    /// three redirects. No digest verification exists in v1.
    pub async fn get_img_layer_stream(
        &self,
        img_id: &str,
    ) -> Result<(BoxStream<'static, Result<Bytes>>, Vec<ResponseInfo>)> {
        let auth = self.ensure_session().await?;
        let url = Url::parse(&format!(
            "{}/v1/images/{}/layer",
            self.registry_url, img_id
        ))?;
        let (response, chain) = transport::follow_redirects(
            self.http()?,
            Method::GET,
            url,
            auth.as_deref(),
            &self.user_agent,
        )
        .await?;
        let stream = response
            .bytes_stream()
            .map_err(RegistryError::from)
            .boxed();
        Ok((stream, chain))
    }
}
