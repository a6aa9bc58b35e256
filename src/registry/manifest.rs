//! Manifest types and verification.
//!
//! Schema-version-2 manifests are verified by hashing the raw response
//! bytes against the `Docker-Content-Digest` header. Schema-version-1
//! manifests carry a detached JWS: the signed payload is not embedded but
//! reconstructed from the raw body using a byte offset (`formatLength`)
//! and suffix (`formatTail`) stored in each signature's protected header —
//! the bytes of the document with the `signatures` key and everything
//! after it replaced by the tail. Both the digest header and every
//! signature are verified against that reconstruction before a manifest is
//! handed to the caller.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{RegistryError, Result};

pub const MEDIATYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIATYPE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIATYPE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIATYPE_SIGNED_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIATYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIATYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// A legacy schema-1 manifest, signed with a detached JWS.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestV1 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<V1History>,
    #[serde(default)]
    pub signatures: Vec<JwsSignature>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwsSignature {
    pub header: JwsHeader,
    pub signature: String,
    pub protected: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Vec<String>>,
}

/// A schema-2 manifest: digest-addressed config and layers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestV2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// A manifest list (multi-platform index).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub manifests: Vec<ManifestListEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestListEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A parsed manifest of any supported schema.
#[derive(Debug, Clone)]
pub enum Manifest {
    Schema1(ManifestV1),
    Schema2(ManifestV2),
    List(ManifestList),
}

impl Manifest {
    pub fn schema_version(&self) -> u32 {
        match self {
            Manifest::Schema1(m) => m.schema_version,
            Manifest::Schema2(m) => m.schema_version,
            Manifest::List(m) => m.schema_version,
        }
    }
}

/// A verified manifest response: parsed form plus the raw bytes it was
/// parsed from and the response's content metadata. Never constructed for
/// a manifest that failed verification.
#[derive(Debug, Clone)]
pub struct ManifestEnvelope {
    pub manifest: Manifest,
    pub raw: Vec<u8>,
    pub media_type: Option<String>,
    /// `Docker-Content-Digest` response header, when the registry sent one.
    pub content_digest: Option<String>,
}

impl ManifestEnvelope {
    pub fn schema_version(&self) -> u32 {
        self.manifest.schema_version()
    }
}

#[derive(Debug, Deserialize)]
struct Probe {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

/// Parse raw manifest bytes into the schema named by the body (falling back
/// to the response content type to tell manifests from manifest lists).
pub(crate) fn parse_manifest(raw: &[u8], content_type: Option<&str>) -> Result<Manifest> {
    let probe: Probe = serde_json::from_slice(raw)?;
    match probe.schema_version {
        1 => Ok(Manifest::Schema1(serde_json::from_slice(raw)?)),
        2 => {
            let media_type = probe
                .media_type
                .as_deref()
                .or(content_type)
                .unwrap_or(MEDIATYPE_MANIFEST_V2);
            if media_type == MEDIATYPE_MANIFEST_LIST_V2 || media_type == MEDIATYPE_OCI_INDEX {
                Ok(Manifest::List(serde_json::from_slice(raw)?))
            } else {
                Ok(Manifest::Schema2(serde_json::from_slice(raw)?))
            }
        }
        version => Err(RegistryError::InvalidContent(format!(
            "unsupported manifest schema version {version}"
        ))),
    }
}

/// Content type to upload manifest bytes under: the embedded `mediaType`
/// when present, otherwise inferred from the schema version.
pub(crate) fn manifest_media_type(raw: &[u8]) -> Result<String> {
    let probe: Probe = serde_json::from_slice(raw)?;
    if let Some(media_type) = probe.media_type {
        return Ok(media_type);
    }
    match probe.schema_version {
        1 => Ok(MEDIATYPE_SIGNED_MANIFEST_V1.to_string()),
        2 => Ok(MEDIATYPE_MANIFEST_V2.to_string()),
        version => Err(RegistryError::InvalidContent(format!(
            "unsupported manifest schema version {version}"
        ))),
    }
}

/// Accept header for manifest GETs, shaped by what the caller can handle.
pub(crate) fn manifest_accept(max_schema_version: u32, accept_manifest_lists: bool) -> String {
    let mut types = Vec::new();
    if max_schema_version >= 2 {
        types.push(MEDIATYPE_MANIFEST_V2);
        types.push(MEDIATYPE_OCI_MANIFEST);
        if accept_manifest_lists {
            types.push(MEDIATYPE_MANIFEST_LIST_V2);
            types.push(MEDIATYPE_OCI_INDEX);
        }
    }
    types.push(MEDIATYPE_SIGNED_MANIFEST_V1);
    types.push(MEDIATYPE_MANIFEST_V1);
    types.join(", ")
}

/// Verify the `Docker-Content-Digest` header against the bytes that it
/// covers (the reconstructed payload for schema 1, the raw body for
/// schema 2).
pub(crate) fn verify_content_digest(payload: &[u8], header: &str) -> Result<()> {
    let digest = Digest::parse(header).map_err(|_| {
        RegistryError::BadDigest(format!(
            "could not parse Docker-Content-Digest header: \"{header}\""
        ))
    })?;
    digest.verify(payload).map_err(|_| {
        RegistryError::BadDigest(format!(
            "Docker-Content-Digest header {header} does not match the manifest payload"
        ))
    })
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: Option<u64>,
    #[serde(rename = "formatTail")]
    format_tail: Option<String>,
}

/// The JWS turned right side out: the reconstructed signing payload plus
/// the signature entries that claim to cover it.
#[derive(Debug)]
pub(crate) struct ReconstructedJws {
    pub payload: Vec<u8>,
    pub signatures: Vec<JwsSignature>,
}

fn decode_b64url(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
}

/// Rebuild the signing payload from the raw response body.
///
/// Every signature's protected header must agree on `formatLength` and
/// `formatTail`; disagreement means the body was altered after signing.
pub(crate) fn jws_from_manifest(manifest: &ManifestV1, raw: &[u8]) -> Result<ReconstructedJws> {
    if manifest.signatures.is_empty() {
        return Err(RegistryError::InvalidContent(
            "manifest has no signatures".to_string(),
        ));
    }

    let mut format_length: Option<u64> = None;
    let mut format_tail: Option<Vec<u8>> = None;

    for (i, signature) in manifest.signatures.iter().enumerate() {
        let protected_raw = decode_b64url(&signature.protected).map_err(|err| {
            RegistryError::InvalidContent(format!(
                "could not decode manifest \"signatures[{i}].protected\": {err}"
            ))
        })?;
        let protected: ProtectedHeader = serde_json::from_slice(&protected_raw).map_err(|err| {
            RegistryError::InvalidContent(format!(
                "could not parse manifest \"signatures[{i}].protected\": {err}"
            ))
        })?;

        let length = protected.format_length.ok_or_else(|| {
            RegistryError::InvalidContent(format!(
                "missing \"formatLength\" in \"signatures[{i}].protected\""
            ))
        })?;
        match format_length {
            None => format_length = Some(length),
            Some(previous) if previous != length => {
                return Err(RegistryError::InvalidContent(format!(
                    "conflicting \"formatLength\" in \"signatures[{i}].protected\": {length}"
                )));
            }
            Some(_) => {}
        }

        let tail_b64 = protected.format_tail.ok_or_else(|| {
            RegistryError::InvalidContent(format!(
                "missing \"formatTail\" in \"signatures[{i}].protected\""
            ))
        })?;
        let tail = decode_b64url(&tail_b64).map_err(|err| {
            RegistryError::InvalidContent(format!(
                "could not decode \"formatTail\" in \"signatures[{i}].protected\": {err}"
            ))
        })?;
        match &format_tail {
            None => format_tail = Some(tail),
            Some(previous) if *previous != tail => {
                return Err(RegistryError::InvalidContent(format!(
                    "conflicting \"formatTail\" in \"signatures[{i}].protected\""
                )));
            }
            Some(_) => {}
        }
    }

    // Both are Some here: signatures is non-empty and each entry either set
    // or matched them.
    let length = format_length.unwrap_or_default() as usize;
    let tail = format_tail.unwrap_or_default();
    if length > raw.len() {
        return Err(RegistryError::InvalidContent(format!(
            "\"formatLength\" {length} exceeds manifest body length {}",
            raw.len()
        )));
    }

    let mut payload = Vec::with_capacity(length + tail.len());
    payload.extend_from_slice(&raw[..length]);
    payload.extend_from_slice(&tail);

    Ok(ReconstructedJws {
        payload,
        signatures: manifest.signatures.clone(),
    })
}

/// Verify every signature over the reconstructed payload.
///
/// Trust policy: all provided signatures must verify; one bad signature
/// fails the manifest. The `none` algorithm is rejected outright, and
/// certificate chains (`header.chain`) are not supported.
pub(crate) fn verify_jws(jws: &ReconstructedJws) -> Result<()> {
    let encoded_payload = URL_SAFE_NO_PAD.encode(&jws.payload);

    for (i, signature) in jws.signatures.iter().enumerate() {
        let alg = signature.header.alg.as_str();
        if alg.eq_ignore_ascii_case("none") {
            return Err(RegistryError::ManifestVerification(format!(
                "disallowed JWS signature algorithm in signature {i}: \"{alg}\""
            )));
        }
        if signature.header.chain.is_some() {
            return Err(RegistryError::ManifestVerification(format!(
                "JWS verification with a cert \"chain\" is not supported (signature {i})"
            )));
        }
        let Some(jwk) = &signature.header.jwk else {
            return Err(RegistryError::ManifestVerification(format!(
                "signature {i} has no embedded JWK"
            )));
        };

        let algorithm: Algorithm = alg.parse().map_err(|_| {
            RegistryError::ManifestVerification(format!(
                "unsupported JWS signature algorithm in signature {i}: \"{alg}\""
            ))
        })?;
        let key = DecodingKey::from_jwk(jwk).map_err(|err| {
            RegistryError::InvalidContent(format!("error in \"signatures[{i}].header.jwk\": {err}"))
        })?;

        // jsonwebtoken verifies the JWS compact serialization's signing
        // input: protected-header dot payload.
        let message = format!("{}.{}", signature.protected, encoded_payload);
        let verified = jsonwebtoken::crypto::verify(
            &signature.signature,
            message.as_bytes(),
            &key,
            algorithm,
        )
        .map_err(|err| {
            RegistryError::ManifestVerification(format!("JWS signature {i}: {err}"))
        })?;
        if !verified {
            return Err(RegistryError::ManifestVerification(format!(
                "JWS signature {i} failed verification"
            )));
        }
    }

    Ok(())
}

/// Structural checks on a schema-1 manifest, independent of signatures.
pub(crate) fn check_schema1_structure(
    manifest: &ManifestV1,
    local_name: &str,
    reference: &str,
) -> Result<()> {
    if manifest.fs_layers.len() != manifest.history.len() {
        return Err(RegistryError::InvalidContent(format!(
            "length of history not equal to number of layers in {local_name}:{reference} manifest"
        )));
    }
    if manifest.fs_layers.is_empty() {
        return Err(RegistryError::InvalidContent(format!(
            "no layers in {local_name}:{reference} manifest"
        )));
    }
    Ok(())
}

/// Full schema-1 verification: reconstruct the payload, check the content
/// digest header against it, verify every signature, then the structure.
pub(crate) fn verify_schema1(
    manifest: &ManifestV1,
    raw: &[u8],
    content_digest: Option<&str>,
    local_name: &str,
    reference: &str,
) -> Result<()> {
    let jws = jws_from_manifest(manifest, raw)?;
    let header = content_digest.ok_or_else(|| {
        RegistryError::BadDigest("missing Docker-Content-Digest header".to_string())
    })?;
    verify_content_digest(&jws.payload, header)?;
    verify_jws(&jws)?;
    check_schema1_structure(manifest, local_name, reference)
}
