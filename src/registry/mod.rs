//! Registry protocol clients.
//!
//! [`client`] speaks the v2 (distribution) API with content verification;
//! [`legacy`] speaks the digest-free v1 registry/index split.

pub mod auth;
pub mod client;
pub mod legacy;
pub mod manifest;
pub mod quirks;
pub mod transport;
