//! Docker Registry API v2 client.
//!
//! One client is one session against one repository: it owns the auth
//! state (anonymous → challenged → authenticated) and the HTTP connection
//! pool. Login is lazy and single-flight: the first authenticated
//! operation pings `/v2/`, captures the challenge from a 401, and for
//! Bearer fetches a token scoped to the repository. The auth header is
//! only ever observed complete — never half-written — by concurrent
//! operations.

use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::reference::{Reference, parse_repo_and_ref};
use crate::registry::auth::{self, AuthChallenge, AuthScheme};
use crate::registry::manifest::{self, Manifest, ManifestEnvelope};
use crate::registry::transport::{self, BlobStream, ResponseInfo};

/// Registry endpoint used for repositories on the official index.
pub const DEFAULT_V2_REGISTRY_URL: &str = "https://registry-1.docker.io";

const DEFAULT_USER_AGENT: &str = concat!("docker-image-puller/", env!("CARGO_PKG_VERSION"));

// Pings gate every first operation; they must fail fast, not sit out a
// long transfer timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryClientBuilder {
    name: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    insecure: bool,
    scheme: Option<String>,
    user_agent: Option<String>,
    write_access: bool,
}

impl RegistryClientBuilder {
    /// `name` is a repository reference, e.g. `busybox:latest` or
    /// `localhost:5000/blarg@sha256:…`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: None,
            password: None,
            token: None,
            insecure: false,
            scheme: None,
            user_agent: None,
            write_access: false,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Use a pre-acquired bearer token instead of negotiating one.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Accept invalid TLS certificates and allow http token realms.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Force `http` or `https` instead of the localhost/https default.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Request `pull,push` token scope instead of `pull`.
    ///
    /// Scope is fixed for the client's lifetime; a client that later needs
    /// wider scope must be rebuilt, which makes re-negotiation explicit
    /// rather than silently reusing a stale narrower token.
    pub fn with_write_access(mut self, write_access: bool) -> Self {
        self.write_access = write_access;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let repo = parse_repo_and_ref(&self.name)?;

        // Like docker itself, prefer plain http for localhost registries
        // rather than probing https first.
        let scheme = self
            .scheme
            .clone()
            .or_else(|| repo.index.scheme.clone())
            .unwrap_or_else(|| {
                if repo.index.is_localhost() {
                    "http".to_string()
                } else {
                    "https".to_string()
                }
            });
        let base_url = if repo.index.official {
            DEFAULT_V2_REGISTRY_URL.to_string()
        } else {
            format!("{}://{}", scheme, repo.index.name)
        };

        let mut builder = Client::builder().redirect(reqwest::redirect::Policy::none());
        if self.insecure {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let http = builder.build()?;

        let auth_header = match (&self.username, &self.password, &self.token) {
            (Some(username), Some(password), _) => {
                Some(auth::basic_auth_header(username, password))
            }
            (_, _, Some(token)) => Some(format!("Bearer {token}")),
            _ => None,
        };

        Ok(RegistryClient {
            repo,
            base_url,
            insecure: self.insecure,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            scope_actions: if self.write_access {
                &["pull", "push"]
            } else {
                &["pull"]
            },
            username: self.username,
            password: self.password,
            http: Some(http),
            state: Mutex::new(AuthState {
                auth_header,
                ..AuthState::default()
            }),
        })
    }
}

#[derive(Debug, Default)]
struct AuthState {
    logged_in: bool,
    /// Complete `Authorization` header value; written atomically under the
    /// state lock.
    auth_header: Option<String>,
    challenge: Option<AuthChallenge>,
    /// Rendered ping failure, replayed when a Basic challenge means the
    /// already-sent credentials were rejected.
    auth_error: Option<String>,
}

struct PingOutcome {
    status: u16,
    api_version: Option<String>,
}

/// Tag listing response (`GET /v2/<name>/tags/list`).
#[derive(Debug, Clone, Deserialize)]
pub struct TagList {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Options for [`RegistryClient::get_manifest`].
#[derive(Debug, Clone)]
pub struct GetManifestOptions {
    /// Tag or digest to fetch. Defaults to the tag/digest the client was
    /// built with.
    pub reference: Option<String>,
    /// Highest manifest schema version the caller is prepared to handle.
    pub max_schema_version: u32,
    /// Whether a manifest list (multi-platform index) may be returned.
    pub accept_manifest_lists: bool,
}

impl Default for GetManifestOptions {
    fn default() -> Self {
        Self {
            reference: None,
            max_schema_version: 2,
            accept_manifest_lists: false,
        }
    }
}

impl GetManifestOptions {
    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::default()
        }
    }
}

/// Options for [`RegistryClient::put_manifest`].
#[derive(Debug, Clone, Default)]
pub struct PutManifestOptions {
    /// Tag or digest to publish under. Defaults to the client reference's.
    pub reference: Option<String>,
    /// Explicit content type; sniffed from the manifest body when absent.
    pub media_type: Option<String>,
}

/// Result of a manifest upload.
#[derive(Debug, Clone)]
pub struct PutManifestResult {
    pub digest: Option<String>,
    pub location: Option<String>,
}

/// Options for [`RegistryClient::blob_upload`].
#[derive(Debug, Clone)]
pub struct BlobUploadOptions {
    /// Digest of the bytes being uploaded.
    pub digest: String,
    pub content_length: u64,
}

/// Docker Registry API v2 client for a single repository.
pub struct RegistryClient {
    repo: Reference,
    base_url: String,
    insecure: bool,
    user_agent: String,
    scope_actions: &'static [&'static str],
    username: Option<String>,
    password: Option<String>,
    http: Option<Client>,
    state: Mutex<AuthState>,
}

impl RegistryClient {
    pub fn builder(name: impl Into<String>) -> RegistryClientBuilder {
        RegistryClientBuilder::new(name)
    }

    /// Build a client with default options for `name`.
    pub fn new(name: &str) -> Result<Self> {
        RegistryClientBuilder::new(name).build()
    }

    /// The reference this client was built for.
    pub fn repo(&self) -> &Reference {
        &self.repo
    }

    /// Registry base URL, e.g. `https://registry-1.docker.io`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Release the HTTP connection pool. Idempotent; later operations fail
    /// with [`RegistryError::Closed`]. Must not be called while blob
    /// streams from this client are still being consumed.
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
            request = request.header(AUTHORIZATION, header);
        }
        Ok(request)
    }

    /// `GET /v2/` without retry. Side effects on the locked state: 200
    /// marks the session logged in, 401 stores the parsed challenge and
    /// the failure for later replay.
    async fn ping_locked(&self, state: &mut AuthState) -> Result<PingOutcome> {
        let url = format!("{}/v2/", self.base_url);
        let response = self
            .request(Method::GET, &url, state.auth_header.as_deref())?
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let api_version = response
            .headers()
            .get("docker-distribution-api-version")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        trace!(url = %url, status = status.as_u16(), "ping");

        match status {
            StatusCode::OK => {
                state.logged_in = true;
                Ok(PingOutcome {
                    status: 200,
                    api_version,
                })
            }
            StatusCode::UNAUTHORIZED => {
                if let Some(header) = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                {
                    match auth::parse_www_authenticate(header) {
                        Ok(challenge) => state.challenge = Some(challenge),
                        Err(err) => debug!(%err, "ignoring unparseable WWW-Authenticate header"),
                    }
                }
                let err = transport::error_from_response(response).await;
                state.auth_error = Some(err.to_string());
                Ok(PingOutcome {
                    status: 401,
                    api_version,
                })
            }
            _ => Err(transport::error_from_response(response).await),
        }
    }

    /// Probe `GET /v2/`. `Ok(())` means no auth is required for this
    /// client's scope right now; a 401 surfaces as an authentication error
    /// (and primes the challenge for [`login`](Self::login)).
    pub async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let outcome = self.ping_locked(&mut state).await?;
        if outcome.status == StatusCode::UNAUTHORIZED.as_u16() {
            return Err(RegistryError::Authentication(
                state
                    .auth_error
                    .clone()
                    .unwrap_or_else(|| format!("{} requires authentication", self.base_url)),
            ));
        }
        Ok(())
    }

    /// Whether the registry advertises `Docker-Distribution-Api-Version:
    /// registry/2.0`. Both 200 and 401 pings count as support.
    pub async fn supports_v2(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let outcome = self.ping_locked(&mut state).await?;
        Ok(outcome
            .api_version
            .map(|header| header.split_whitespace().any(|v| v == "registry/2.0"))
            .unwrap_or(false))
    }

    /// Idempotent lazy login; invoked by every authenticated operation.
    pub async fn login(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state).await
    }

    async fn login_locked(&self, state: &mut AuthState) -> Result<()> {
        if state.logged_in {
            return Ok(());
        }

        if state.challenge.is_none() {
            self.ping_locked(state).await?;
            if state.logged_in {
                trace!("registry requires no auth for this scope");
                return Ok(());
            }
        }
        let Some(challenge) = state.challenge.clone() else {
            return Err(RegistryError::Authentication(state.auth_error.clone().unwrap_or_else(
                || format!("{} did not provide a usable WWW-Authenticate challenge", self.base_url),
            )));
        };

        match challenge.scheme {
            AuthScheme::Basic => {
                // Basic credentials, if supplied, already rode along on the
                // ping and were rejected; there is no second handshake.
                Err(RegistryError::Authentication(
                    state
                        .auth_error
                        .clone()
                        .unwrap_or_else(|| "basic credentials rejected".to_string()),
                ))
            }
            AuthScheme::Bearer => {
                let realm = challenge.realm.as_deref().ok_or_else(|| {
                    RegistryError::Authentication(
                        "bearer challenge did not include a realm".to_string(),
                    )
                })?;
                let scope = auth::repo_scope(&self.repo.remote_name, self.scope_actions);
                let token = auth::fetch_token(
                    self.http()?,
                    &auth::TokenParams {
                        realm,
                        service: challenge.service.as_deref(),
                        scopes: &[scope],
                        username: self.username.as_deref(),
                        password: self.password.as_deref(),
                        index_name: &self.repo.index.name,
                        insecure: self.insecure,
                    },
                )
                .await?;
                state.auth_header = Some(format!("Bearer {token}"));
                state.logged_in = true;
                debug!(index = %self.repo.index.name, "login: bearer token set");
                Ok(())
            }
            AuthScheme::Other(scheme) => Err(RegistryError::UnsupportedAuthScheme(scheme)),
        }
    }

    /// Login if needed and return the complete auth header to attach.
    async fn authorized_header(&self) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state).await?;
        Ok(state.auth_header.clone())
    }

    /// `GET /v2/<name>/tags/list`.
    pub async fn list_tags(&self) -> Result<TagList> {
        let auth = self.authorized_header().await?;
        let url = format!("{}/v2/{}/tags/list", self.base_url, self.repo.remote_name);
        let response = self.request(Method::GET, &url, auth.as_deref())?.send().await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetch and verify a manifest. An envelope is only returned after the
    /// schema-appropriate verification passed (§ content digest for schema
    /// 2, full detached-JWS verification for schema 1).
    pub async fn get_manifest(&self, options: &GetManifestOptions) -> Result<ManifestEnvelope> {
        let reference = options
            .reference
            .as_deref()
            .or_else(|| self.repo.tag_or_digest())
            .ok_or_else(|| {
                RegistryError::InvalidReference(
                    "no tag or digest to fetch a manifest for".to_string(),
                )
            })?;
        let auth = self.authorized_header().await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repo.remote_name, reference
        );
        let accept =
            manifest::manifest_accept(options.max_schema_version, options.accept_manifest_lists);
        let response = self
            .request(Method::GET, &url, auth.as_deref())?
            .header(ACCEPT, accept)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }

        let content_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let raw = response.bytes().await?.to_vec();

        let parsed = manifest::parse_manifest(&raw, media_type.as_deref())?;
        if parsed.schema_version() > options.max_schema_version {
            return Err(RegistryError::InvalidContent(format!(
                "unsupported schema version {} in {}:{} manifest",
                parsed.schema_version(),
                self.repo.local_name,
                reference
            )));
        }

        match &parsed {
            Manifest::Schema1(m) => manifest::verify_schema1(
                m,
                &raw,
                content_digest.as_deref(),
                &self.repo.local_name,
                reference,
            )?,
            Manifest::Schema2(_) | Manifest::List(_) => match content_digest.as_deref() {
                Some(header) => manifest::verify_content_digest(&raw, header)?,
                None => warn!(
                    url = %url,
                    "manifest response had no Docker-Content-Digest header; skipping digest check"
                ),
            },
        }

        Ok(ManifestEnvelope {
            manifest: parsed,
            raw,
            media_type,
            content_digest,
        })
    }

    /// `PUT /v2/<name>/manifests/<ref>`. The caller provides the exact
    /// bytes; the response carries the registry's digest and location.
    pub async fn put_manifest(
        &self,
        manifest_bytes: &[u8],
        options: &PutManifestOptions,
    ) -> Result<PutManifestResult> {
        let reference = options
            .reference
            .as_deref()
            .or_else(|| self.repo.tag_or_digest())
            .ok_or_else(|| {
                RegistryError::InvalidReference(
                    "no tag or digest to publish the manifest under".to_string(),
                )
            })?;
        let media_type = match &options.media_type {
            Some(media_type) => media_type.clone(),
            None => manifest::manifest_media_type(manifest_bytes)?,
        };

        let auth = self.authorized_header().await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repo.remote_name, reference
        );
        let response = self
            .request(Method::PUT, &url, auth.as_deref())?
            .header(CONTENT_TYPE, media_type)
            .body(manifest_bytes.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(PutManifestResult {
            digest: header("docker-content-digest"),
            location: header("location"),
        })
    }

    async fn blob_request(
        &self,
        method: Method,
        digest: &str,
    ) -> Result<(reqwest::Response, Vec<ResponseInfo>)> {
        let auth = self.authorized_header().await?;
        let url = Url::parse(&format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, self.repo.remote_name, digest
        ))?;
        transport::follow_redirects(
            self.http()?,
            method,
            url,
            auth.as_deref(),
            &self.user_agent,
        )
        .await
    }

    /// `HEAD /v2/<name>/blobs/<digest>`, resolving up to three redirects.
    /// Returns the response chain; the first entry holds
    /// `Docker-Content-Digest`, the last the payload headers.
    pub async fn head_blob(&self, digest: &str) -> Result<Vec<ResponseInfo>> {
        Digest::parse(digest)?;
        let (_, chain) = self.blob_request(Method::HEAD, digest).await?;
        Ok(chain)
    }

    /// `GET /v2/<name>/blobs/<digest>` as a verified byte stream.
    ///
    /// Every chunk feeds a running hash keyed by the requested digest's
    /// algorithm; when the transfer ends the byte count is checked against
    /// `Content-Length` and the hash against the digest. Either mismatch
    /// is delivered as the stream's final item.
    pub async fn create_blob_read_stream(
        &self,
        digest: &str,
    ) -> Result<(BlobStream, Vec<ResponseInfo>)> {
        let expected = Digest::parse(digest)?;
        let (response, chain) = self.blob_request(Method::GET, digest).await?;

        if let Some(header) = chain
            .first()
            .and_then(|info| info.header("docker-content-digest"))
        {
            if header != digest {
                return Err(RegistryError::BadDigest(format!(
                    "Docker-Content-Digest header, {header}, does not match requested digest, {digest}"
                )));
            }
        }
        let expected_len = chain.last().and_then(|info| info.content_length());

        let inner = response
            .bytes_stream()
            .map_err(RegistryError::from)
            .boxed();
        Ok((BlobStream::new(inner, expected, expected_len), chain))
    }

    /// Monolithic blob upload: `POST /v2/<name>/blobs/uploads/` to open a
    /// session, then `PUT <location>?digest=<digest>` with the bytes.
    pub async fn blob_upload(
        &self,
        body: impl Into<reqwest::Body>,
        options: &BlobUploadOptions,
    ) -> Result<()> {
        Digest::parse(&options.digest)?;
        let auth = self.authorized_header().await?;

        let start_url = format!("{}/v2/{}/blobs/uploads/", self.base_url, self.repo.remote_name);
        let response = self
            .request(Method::POST, &start_url, auth.as_deref())?
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RegistryError::InvalidContent(format!(
                    "no Location header in blob upload response from {start_url}"
                ))
            })?;
        let location = if location.starts_with('/') {
            format!("{}{}", self.base_url, location)
        } else {
            location.to_string()
        };
        let upload_url = if location.contains('?') {
            format!("{location}&digest={}", options.digest)
        } else {
            format!("{location}?digest={}", options.digest)
        };

        let response = self
            .request(Method::PUT, &upload_url, auth.as_deref())?
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, options.content_length)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(transport::error_from_response(response).await);
        }
        debug!(digest = %options.digest, "blob uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_index_uses_default_registry_url() {
        let client = RegistryClient::new("busybox").unwrap();
        assert_eq!(client.base_url(), DEFAULT_V2_REGISTRY_URL);
        assert_eq!(client.repo().remote_name, "library/busybox");
    }

    #[test]
    fn test_localhost_prefers_http() {
        let client = RegistryClient::new("localhost:5000/blarg").unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");
    }

    #[test]
    fn test_other_indexes_default_to_https() {
        let client = RegistryClient::new("quay.io/coreos/etcd").unwrap();
        assert_eq!(client.base_url(), "https://quay.io");
    }

    #[test]
    fn test_scheme_override() {
        let client = RegistryClient::builder("registry.example.com/foo/bar")
            .with_scheme("http")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://registry.example.com");
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        assert!(matches!(
            RegistryClient::new("https://docker.io/busybox"),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let mut client = RegistryClient::new("localhost:5000/blarg").unwrap();
        client.close();
        client.close();
        assert!(matches!(client.ping().await, Err(RegistryError::Closed)));
        assert!(matches!(client.list_tags().await, Err(RegistryError::Closed)));
    }
}
