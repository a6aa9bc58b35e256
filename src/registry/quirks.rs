//! Per-host registry quirks.
//!
//! Some registries deviate from the protocol in ways that cannot be
//! detected from responses alone. Rather than scattering hostname
//! conditionals through the clients, the known deviations live in one
//! additive table keyed on the index host.

/// Behavior overrides for a specific registry host.
#[derive(Debug, Clone, Copy)]
pub struct RegistryQuirks {
    pub host: &'static str,
    /// Forced "standalone" answer for the v1 ping, overriding the
    /// `X-Docker-Registry-Standalone` response header.
    pub standalone: Option<bool>,
}

// quay.io answers `x-docker-registry-standalone: 0` but does not actually
// delegate token auth to index.docker.io.
const QUIRKS: &[RegistryQuirks] = &[RegistryQuirks {
    host: "quay.io",
    standalone: Some(true),
}];

/// Look up quirks for an index host (port included, as parsed).
pub fn quirks_for_host(host: &str) -> Option<&'static RegistryQuirks> {
    QUIRKS.iter().find(|q| q.host == host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quay_is_standalone() {
        assert_eq!(quirks_for_host("quay.io").unwrap().standalone, Some(true));
    }

    #[test]
    fn test_unknown_host_has_no_quirks() {
        assert!(quirks_for_host("registry.example.com").is_none());
    }
}
