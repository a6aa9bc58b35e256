//! Repository reference parsing and normalization.
//!
//! Turns user-typed strings like `busybox`, `quay.io/coreos/etcd:v3` or
//! `localhost:5000/blarg@sha256:cafebabe` into a normalized [`Reference`].
//! The grammar is `[INDEX/]NAMESPACE/NAME[:TAG|@DIGEST]`; the leading
//! segment is only treated as an index host when it contains a `.`, a `:`
//! or equals `localhost`.

use std::fmt;
use std::str::FromStr;

use crate::error::{RegistryError, Result};

/// Index name used when a reference does not carry one.
pub const DEFAULT_INDEX_NAME: &str = "docker.io";

/// Tag used when a reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Namespace assumed for single-segment names on the official index.
pub const DEFAULT_NAMESPACE: &str = "library";

// `docker login` passes this URL when no server is given.
const DEFAULT_LOGIN_SERVER: &str = "https://index.docker.io/v1/";

/// A normalized index (registry host) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Host name, possibly with a port, e.g. `docker.io` or `localhost:5000`.
    pub name: String,
    /// Whether this is the default ("official") index.
    pub official: bool,
    /// Explicit scheme, when one was given. `None` means "pick a default".
    pub scheme: Option<String>,
}

impl Index {
    pub(crate) fn default_index() -> Self {
        Index {
            name: DEFAULT_INDEX_NAME.to_string(),
            official: true,
            scheme: None,
        }
    }

    /// Base URL for this index, defaulting to https when no scheme was given.
    pub fn url(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or("https");
        format!("{}://{}", scheme, self.name)
    }

    /// True when the index host is a loopback name.
    pub fn is_localhost(&self) -> bool {
        let host = self.name.split(':').next().unwrap_or(&self.name);
        matches!(host, "localhost" | "127.0.0.1" | "::1")
    }
}

/// A parsed, normalized repository reference.
///
/// After [`parse_repo_and_ref`] exactly one of `tag`/`digest` is set.
/// After [`parse_repo`] both are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub index: Index,
    /// True for `library/*` repos on the official index.
    pub official: bool,
    /// Name as the registry knows it, e.g. `library/busybox` or `blarg`.
    pub remote_name: String,
    /// Name as a local user would type it, e.g. `busybox` or
    /// `localhost:5000/blarg`.
    pub local_name: String,
    /// Fully qualified name including the index, e.g. `docker.io/busybox`.
    pub canonical_name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// The tag or digest to use when addressing a manifest, if one was parsed.
    pub fn tag_or_digest(&self) -> Option<&str> {
        self.digest.as_deref().or(self.tag.as_deref())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")
        } else if let Some(tag) = &self.tag {
            write!(f, ":{tag}")
        } else {
            Ok(())
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        parse_repo_and_ref(s)
    }
}

/// Parse an index name (`docker.io`, `quay.io`, `localhost:5000`) or URL
/// (`https://quay.io`).
pub fn parse_index(arg: &str) -> Result<Index> {
    if arg.is_empty() || arg == DEFAULT_INDEX_NAME || arg == DEFAULT_LOGIN_SERVER {
        return Ok(Index::default_index());
    }

    let (scheme, rest) = match arg.split_once("://") {
        Some((scheme, rest)) => {
            if scheme != "http" && scheme != "https" {
                return Err(RegistryError::InvalidReference(format!(
                    "invalid index scheme, must be \"http\" or \"https\": {arg}"
                )));
            }
            (Some(scheme.to_string()), rest)
        }
        None => (None, arg),
    };

    if rest.is_empty() {
        return Err(RegistryError::InvalidReference(format!(
            "invalid index, empty host: {arg}"
        )));
    }

    // Tolerate a trailing '/' as produced by URL builders.
    let name = rest.strip_suffix('/').unwrap_or(rest);
    if name.contains('/') {
        return Err(RegistryError::InvalidReference(format!(
            "invalid index, cannot contain a repo path: {arg}"
        )));
    }
    if !name.contains('.') && !name.contains(':') && name != "localhost" {
        return Err(RegistryError::InvalidReference(format!(
            "invalid index, \"{name}\" does not look like a valid host: {arg}"
        )));
    }

    // Per docker's ValidateIndexName.
    let name = canonical_index_name(name);
    let official = name == DEFAULT_INDEX_NAME;
    if official && scheme.as_deref() == Some("http") {
        return Err(RegistryError::InvalidReference(format!(
            "disallowed scheme \"http\" for official index: {arg}"
        )));
    }

    Ok(Index {
        name: name.to_string(),
        official,
        scheme,
    })
}

/// Parse a repository string without a tag/digest, against the default index.
pub fn parse_repo(arg: &str) -> Result<Reference> {
    parse_repo_with_index(arg, None)
}

/// Parse a repository string without a tag/digest. `default_index` is used
/// when the string does not name an index itself.
pub fn parse_repo_with_index(arg: &str, default_index: Option<&Index>) -> Result<Reference> {
    if arg.contains("://") {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository name, cannot include a protocol scheme: {arg}"
        )));
    }

    // Optional leading `INDEX/`. The first segment is only an index host
    // when it could not be a namespace.
    let (index, remote) = match arg.split_once('/') {
        Some((first, rest)) if looks_like_index_host(first) => {
            let name = canonical_index_name(first);
            let index = Index {
                name: name.to_string(),
                official: name == DEFAULT_INDEX_NAME,
                scheme: None,
            };
            (index, rest)
        }
        _ => {
            let index = default_index.cloned().unwrap_or_else(Index::default_index);
            (index, arg)
        }
    };

    let (ns, name) = match remote.split_once('/') {
        Some((ns, name)) => {
            validate_namespace(ns)?;
            (Some(ns), name)
        }
        None => (None, remote),
    };
    validate_name(name)?;

    let mut reference = Reference {
        index,
        official: false,
        remote_name: String::new(),
        local_name: String::new(),
        canonical_name: String::new(),
        tag: None,
        digest: None,
    };

    if reference.index.official {
        let ns = ns.unwrap_or(DEFAULT_NAMESPACE);
        reference.remote_name = format!("{ns}/{name}");
        if ns == DEFAULT_NAMESPACE {
            reference.official = true;
            reference.local_name = name.to_string();
        } else {
            reference.local_name = reference.remote_name.clone();
        }
        reference.canonical_name = format!("{DEFAULT_INDEX_NAME}/{}", reference.local_name);
    } else {
        reference.remote_name = match ns {
            Some(ns) => format!("{ns}/{name}"),
            None => name.to_string(),
        };
        reference.local_name = format!("{}/{}", reference.index.name, reference.remote_name);
        reference.canonical_name = reference.local_name.clone();
    }

    Ok(reference)
}

/// Parse a repository string with an optional `:TAG` or `@DIGEST` suffix,
/// against the default index. When neither is present the tag defaults to
/// [`DEFAULT_TAG`].
pub fn parse_repo_and_ref(arg: &str) -> Result<Reference> {
    parse_repo_and_ref_with_index(arg, None)
}

/// [`parse_repo_and_ref`] with an explicit default index.
pub fn parse_repo_and_ref_with_index(arg: &str, default_index: Option<&Index>) -> Result<Reference> {
    // The digest marker wins over a tag; a ':' only delimits a tag when it
    // comes after the last '/' (otherwise it is an index port).
    let (repo, tag, digest) = match arg.rfind('@') {
        Some(at) => (&arg[..at], None, non_empty(&arg[at + 1..])),
        None => {
            let colon = arg.rfind(':');
            let slash = arg.rfind('/');
            match colon {
                Some(colon) if slash.is_none_or(|slash| colon > slash) => {
                    (&arg[..colon], non_empty(&arg[colon + 1..]), None)
                }
                _ => (arg, None, None),
            }
        }
    };

    let mut reference = parse_repo_with_index(repo, default_index)?;
    if digest.is_some() {
        reference.digest = digest;
    } else if tag.is_some() {
        reference.tag = tag;
    } else {
        reference.tag = Some(DEFAULT_TAG.to_string());
    }
    Ok(reference)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn looks_like_index_host(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

fn canonical_index_name(name: &str) -> &str {
    if name == "index.docker.io" {
        DEFAULT_INDEX_NAME
    } else {
        name
    }
}

fn validate_namespace(ns: &str) -> Result<()> {
    if ns.len() < 2 || ns.len() > 255 {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository namespace, must be between 2 and 255 characters: {ns}"
        )));
    }
    if !ns
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository namespace, may only contain [a-z0-9_-] characters: {ns}"
        )));
    }
    if ns.starts_with('-') && ns.ends_with('-') {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository namespace, cannot start or end with a hyphen: {ns}"
        )));
    }
    if ns.contains("--") {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository namespace, cannot contain consecutive hyphens: {ns}"
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RegistryError::InvalidReference(
            "invalid repository name, cannot be empty".to_string(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(RegistryError::InvalidReference(format!(
            "invalid repository name, may only contain [a-z0-9_.-] characters: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn official_index() -> Index {
        Index {
            name: "docker.io".to_string(),
            official: true,
            scheme: None,
        }
    }

    #[test]
    fn test_parse_repo_official_shorthand() {
        let r = parse_repo("busybox").unwrap();
        assert_eq!(r.index, official_index());
        assert!(r.official);
        assert_eq!(r.remote_name, "library/busybox");
        assert_eq!(r.local_name, "busybox");
        assert_eq!(r.canonical_name, "docker.io/busybox");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_repo_official_with_namespace() {
        let r = parse_repo("google/python").unwrap();
        assert_eq!(r.index, official_index());
        assert!(!r.official);
        assert_eq!(r.remote_name, "google/python");
        assert_eq!(r.local_name, "google/python");
        assert_eq!(r.canonical_name, "docker.io/google/python");
    }

    #[test]
    fn test_parse_repo_explicit_official_index() {
        let r = parse_repo("docker.io/ubuntu").unwrap();
        assert_eq!(r.index, official_index());
        assert!(r.official);
        assert_eq!(r.remote_name, "library/ubuntu");
        assert_eq!(r.local_name, "ubuntu");
        assert_eq!(r.canonical_name, "docker.io/ubuntu");
    }

    #[test]
    fn test_parse_repo_index_docker_io_canonicalizes() {
        let r = parse_repo("index.docker.io/ubuntu").unwrap();
        assert_eq!(r.canonical_name, "docker.io/ubuntu");
        assert!(r.index.official);
    }

    #[test]
    fn test_parse_repo_private_index() {
        let r = parse_repo("localhost:5000/blarg").unwrap();
        assert_eq!(r.index.name, "localhost:5000");
        assert!(!r.index.official);
        assert!(!r.official);
        assert_eq!(r.remote_name, "blarg");
        assert_eq!(r.local_name, "localhost:5000/blarg");
        assert_eq!(r.canonical_name, "localhost:5000/blarg");
    }

    #[test]
    fn test_parse_repo_with_alternate_default_index() {
        let index = parse_index("https://myreg.example.com:1234").unwrap();
        let r = parse_repo_with_index("foo/bar", Some(&index)).unwrap();
        assert_eq!(r.index.name, "myreg.example.com:1234");
        assert_eq!(r.index.scheme.as_deref(), Some("https"));
        assert!(!r.index.official);
        assert_eq!(r.remote_name, "foo/bar");
        assert_eq!(r.local_name, "myreg.example.com:1234/foo/bar");
        assert_eq!(r.canonical_name, "myreg.example.com:1234/foo/bar");
    }

    #[test]
    fn test_parse_repo_rejects_scheme() {
        assert!(matches!(
            parse_repo("https://docker.io/busybox"),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_parse_repo_rejects_bad_namespace() {
        assert!(parse_repo("registry.example.com/user@name/repo").is_err());
        assert!(parse_repo("a/b").is_err()); // namespace too short
        assert!(parse_repo("bad--ns/repo").is_err());
        assert!(parse_repo("-badns-/repo").is_err());
        assert!(parse_repo("UPPER/repo").is_err());
    }

    #[test]
    fn test_parse_repo_rejects_bad_name() {
        assert!(parse_repo("ns-ok/UPPER").is_err());
        assert!(parse_repo("docker.io/").is_err());
    }

    #[test]
    fn test_parse_repo_and_ref_defaults_tag() {
        let r = parse_repo_and_ref("busybox").unwrap();
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_repo_and_ref_tag() {
        let r = parse_repo_and_ref("localhost:5000/blarg:mytag").unwrap();
        assert_eq!(r.index.name, "localhost:5000");
        assert_eq!(r.remote_name, "blarg");
        assert_eq!(r.tag.as_deref(), Some("mytag"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_repo_and_ref_digest() {
        let r = parse_repo_and_ref("localhost:5000/blarg@sha256:cafebabe").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:cafebabe"));
    }

    #[test]
    fn test_parse_repo_and_ref_port_is_not_a_tag() {
        let r = parse_repo_and_ref("localhost:5000/blarg").unwrap();
        assert_eq!(r.index.name, "localhost:5000");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_reparse_of_canonical_form_is_idempotent() {
        for arg in [
            "busybox",
            "google/python",
            "docker.io/ubuntu",
            "localhost:5000/blarg",
            "localhost:5000/ns2/blarg:mytag",
            "quay.io/coreos/etcd@sha256:cafebabe",
        ] {
            let first = parse_repo_and_ref(arg).unwrap();
            let second = parse_repo_and_ref(&first.to_string()).unwrap();
            assert_eq!(first, second, "reparse of {arg}");
        }
    }

    #[test]
    fn test_display() {
        let r = parse_repo_and_ref("busybox").unwrap();
        assert_eq!(r.to_string(), "docker.io/busybox:latest");
        let r = parse_repo_and_ref("ns2/name@sha256:cafebabe").unwrap();
        assert_eq!(r.to_string(), "docker.io/ns2/name@sha256:cafebabe");
    }

    #[test]
    fn test_parse_index_basics() {
        let index = parse_index("docker.io").unwrap();
        assert_eq!(index, official_index());
        assert_eq!(parse_index("index.docker.io").unwrap(), official_index());

        let index = parse_index("quay.io").unwrap();
        assert_eq!(index.name, "quay.io");
        assert!(!index.official);
        assert_eq!(index.scheme, None);

        let index = parse_index("localhost:5000").unwrap();
        assert_eq!(index.name, "localhost:5000");
        assert!(index.is_localhost());
    }

    #[test]
    fn test_parse_index_schemes() {
        let index = parse_index("https://docker.io").unwrap();
        assert!(index.official);
        assert_eq!(index.scheme.as_deref(), Some("https"));

        let index = parse_index("http://quay.io").unwrap();
        assert_eq!(index.scheme.as_deref(), Some("http"));
        assert_eq!(index.url(), "http://quay.io");

        // http is disallowed against the official index.
        assert!(parse_index("http://docker.io").is_err());
        assert!(parse_index("ftp://quay.io").is_err());
    }

    #[test]
    fn test_parse_index_rejects_non_hosts() {
        assert!(parse_index("https://").is_err());
        assert!(parse_index("https://foo").is_err());
        assert!(parse_index("foo").is_err());
        assert!(parse_index("docker.io/foo").is_err());
    }

    #[test]
    fn test_parse_index_tolerates_trailing_slash() {
        assert_eq!(parse_index("docker.io/").unwrap(), official_index());
    }

    #[test]
    fn test_parse_index_login_server_special_case() {
        assert_eq!(
            parse_index("https://index.docker.io/v1/").unwrap(),
            official_index()
        );
    }
}
