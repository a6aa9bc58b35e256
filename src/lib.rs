//! Docker Image Puller Library
//!
//! A client for the Docker Registry HTTP API: reference parsing and
//! normalization, Basic/Bearer auth negotiation, manifest retrieval with
//! signature and content-digest verification, and streaming blob
//! downloads with integrity checking. The v2 (distribution) API is the
//! primary surface; a legacy v1 client covers pre-distribution registries.

pub mod digest;
pub mod error;
pub mod reference;
pub mod registry;

pub use digest::{Digest, DigestAlgorithm};
pub use error::{RegistryError, Result};
pub use reference::{
    DEFAULT_INDEX_NAME, DEFAULT_TAG, Index, Reference, parse_index, parse_repo, parse_repo_and_ref,
};
pub use registry::client::{
    BlobUploadOptions, GetManifestOptions, PutManifestOptions, PutManifestResult, RegistryClient,
    RegistryClientBuilder, TagList,
};
pub use registry::legacy::{LegacyRegistryClient, LegacyRegistryClientBuilder};
pub use registry::manifest::{Manifest, ManifestEnvelope, ManifestV1, ManifestV2};
pub use registry::transport::{BlobStream, ResponseInfo};
