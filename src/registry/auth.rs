//! Authentication negotiation: `WWW-Authenticate` challenge parsing and
//! bearer token acquisition.
//!
//! The v2 flow is challenge-driven: an unauthenticated ping either succeeds
//! outright or answers 401 with a challenge naming the scheme. Basic
//! credentials ride along on every request once supplied; Bearer requires a
//! token fetched from the challenge realm, scoped to the repository.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use crate::error::{RegistryError, Result};

/// Auth scheme named by a `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
    Other(String),
}

/// A parsed `WWW-Authenticate` challenge.
///
/// Captured on the first 401 and held by the owning client; re-derived only
/// if a later request unexpectedly 401s again.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub scheme: AuthScheme,
    pub realm: Option<String>,
    pub service: Option<String>,
}

/// Parse a header like:
///
/// ```text
/// Bearer realm="https://auth.docker.io/token",service="registry.docker.io"
/// ```
///
/// Multiple challenges in one header are not handled; registries in the
/// wild send exactly one.
pub fn parse_www_authenticate(header: &str) -> Result<AuthChallenge> {
    let header = header.trim();
    let (scheme, params_str) = match header.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme, rest),
        None => (header, ""),
    };
    if scheme.is_empty() {
        return Err(RegistryError::Authentication(format!(
            "could not parse WWW-Authenticate header: \"{header}\""
        )));
    }

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "basic" => AuthScheme::Basic,
        "bearer" => AuthScheme::Bearer,
        _ => AuthScheme::Other(scheme.to_string()),
    };

    let mut realm = None;
    let mut service = None;
    for param in params_str.split(',') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(AuthChallenge {
        scheme,
        realm,
        service,
    })
}

/// Build a token scope string, e.g. `repository:library/busybox:pull`.
pub fn repo_scope(remote_name: &str, actions: &[&str]) -> String {
    format!("repository:{}:{}", remote_name, actions.join(","))
}

/// Pre-built `Authorization: Basic …` header value.
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[derive(Debug)]
pub(crate) struct TokenParams<'a> {
    pub realm: &'a str,
    pub service: Option<&'a str>,
    pub scopes: &'a [String],
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// Used for error messages only.
    pub index_name: &'a str,
    pub insecure: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Fetch a bearer token from the challenge realm.
///
/// `GET <realm>?service=<svc>&scope=<scope>…[&account=<user>]`, with Basic
/// auth when credentials were supplied. No retry: login latency is bounded.
pub(crate) async fn fetch_token(client: &reqwest::Client, params: &TokenParams<'_>) -> Result<String> {
    let realm = params.realm;
    let token_url = if realm.contains("://") {
        realm.to_string()
    } else {
        let scheme = if params.insecure { "http" } else { "https" };
        format!("{scheme}://{realm}")
    };
    let mut url = Url::parse(&token_url)?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(RegistryError::Authentication(format!(
                "unsupported scheme for WWW-Authenticate realm \"{realm}\": \"{other}\""
            )));
        }
    }

    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = params.service {
            query.append_pair("service", service);
        }
        for scope in params.scopes {
            query.append_pair("scope", scope);
        }
        if let Some(username) = params.username {
            query.append_pair("account", username);
        }
    }
    trace!(url = %url, "requesting bearer token");

    let mut request = client.get(url.clone());
    if let Some(username) = params.username {
        request = request.basic_auth(username, params.password);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(RegistryError::Authentication(format!(
            "token auth attempt for {}: {} request failed with status {}",
            params.index_name,
            url,
            status.as_u16()
        )));
    }

    let body: TokenResponse = response.json().await?;
    let token = body.token.or(body.access_token).ok_or_else(|| {
        RegistryError::Authentication(
            "authorization server did not include a token in the response".to_string(),
        )
    })?;
    debug!(index = params.index_name, "bearer token acquired");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_www_authenticate(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        )
        .unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Bearer);
        assert_eq!(challenge.realm.as_deref(), Some("https://auth.docker.io/token"));
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
    }

    #[test]
    fn test_parse_basic_challenge() {
        let challenge = parse_www_authenticate("Basic realm=\"Registry Realm\"").unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Basic);
        assert_eq!(challenge.realm.as_deref(), Some("Registry Realm"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn test_parse_unknown_scheme() {
        let challenge = parse_www_authenticate("Negotiate").unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Other("Negotiate".to_string()));
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let challenge = parse_www_authenticate("bearer realm=\"r\"").unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Bearer);
    }

    #[test]
    fn test_repo_scope() {
        assert_eq!(
            repo_scope("library/busybox", &["pull"]),
            "repository:library/busybox:pull"
        );
        assert_eq!(
            repo_scope("blarg", &["pull", "push"]),
            "repository:blarg:pull,push"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        // RFC 7617 example credentials.
        assert_eq!(
            basic_auth_header("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
