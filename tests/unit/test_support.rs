//! Shared test utilities for unit tests.
//!
//! Usage: add `mod test_support;` at the top of your unit test file.

#![allow(dead_code)]

/// A fingerprint with a valid `SHA256:` shape for config fixtures.
pub const FAKE_FINGERPRINT: &str = "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU";

/// Minimal valid configuration TOML.
pub fn minimal_config() -> String {
    format!(
        r##"
[server]
listen = "127.0.0.1:2222"

[upstream]
server = "127.0.0.1"
username = "user"
allowedHostKeyFingerprints = ["{FAKE_FINGERPRINT}"]
"##
    )
}

/// Minimal configuration with extra lines appended to the upstream section.
pub fn config_with_upstream(extra: &str) -> String {
    format!(
        r##"
[server]
listen = "127.0.0.1:2222"

[upstream]
server = "127.0.0.1"
username = "user"
allowedHostKeyFingerprints = ["{FAKE_FINGERPRINT}"]
{extra}
"##
    )
}
