pub mod algos;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    // Warn if the file may leak upstream credentials
    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// On Unix, warn if the config file is readable by group or others, since it
/// carries the upstream password and possibly an inline private key.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "Config file is readable by group/others. \
                     Consider restricting permissions to 0600 (owner read/write only) \
                     since it contains upstream credentials."
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not check config file permissions"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {
    // Permission checks are only available on Unix systems
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate an already-constructed AppConfig (e.g. built in tests).
pub fn validate_config(config: &AppConfig) -> Result<()> {
    validate_server(&config.server)?;
    validate_upstream(&config.upstream)?;
    Ok(())
}

fn validate_server(server: &types::ServerConfig) -> Result<()> {
    if server.listen.is_empty() {
        anyhow::bail!("server.listen must not be empty");
    }
    if !server.server_id.starts_with("SSH-2.0-") {
        anyhow::bail!(
            "server.server_id must start with 'SSH-2.0-' (got '{}')",
            server.server_id
        );
    }
    if server.shutdown_timeout == 0 {
        anyhow::bail!("server.shutdown_timeout must be > 0");
    }
    if server.shutdown_grace == 0 {
        anyhow::bail!("server.shutdown_grace must be > 0");
    }
    Ok(())
}

/// Validate the backing-server section. Errors name the offending field.
pub fn validate_upstream(upstream: &types::UpstreamConfig) -> Result<()> {
    if upstream.server.is_empty() {
        anyhow::bail!("upstream.server cannot be empty");
    }
    if upstream.port == 0 {
        anyhow::bail!("upstream.port must be in 1-65535");
    }
    if upstream.username.is_empty() && !upstream.username_pass_through {
        anyhow::bail!("upstream.username cannot be empty when usernamePassThrough is not set");
    }
    if upstream.allowed_host_key_fingerprints.is_empty() {
        anyhow::bail!("upstream.allowedHostKeyFingerprints cannot be empty");
    }
    for fp in &upstream.allowed_host_key_fingerprints {
        if !is_valid_fingerprint(fp) {
            anyhow::bail!(
                "invalid fingerprint in upstream.allowedHostKeyFingerprints: {} \
                 (must be SHA256: followed by base64)",
                fp
            );
        }
    }
    for name in &upstream.ciphers {
        if algos::cipher_by_name(name).is_none() {
            anyhow::bail!("unsupported cipher in upstream.ciphers: {}", name);
        }
    }
    for name in &upstream.kex {
        if algos::kex_by_name(name).is_none() {
            anyhow::bail!("unsupported key exchange in upstream.kex: {}", name);
        }
    }
    for name in &upstream.macs {
        if algos::mac_by_name(name).is_none() {
            anyhow::bail!("unsupported MAC in upstream.macs: {}", name);
        }
    }
    for name in &upstream.host_key_algos {
        if algos::host_key_algo_by_name(name).is_none() {
            anyhow::bail!(
                "unsupported host key algorithm in upstream.hostKeyAlgos: {}",
                name
            );
        }
    }
    if upstream.timeout == 0 {
        anyhow::bail!("upstream.timeout must be > 0");
    }
    if !is_valid_client_version(&upstream.client_version) {
        anyhow::bail!(
            "invalid SSH client version string ({}), see RFC 4253 section 4.2",
            upstream.client_version
        );
    }
    Ok(())
}

/// `SHA256:` followed by unpadded base64 of the key hash.
pub fn is_valid_fingerprint(fp: &str) -> bool {
    let Some(rest) = fp.strip_prefix("SHA256:") else {
        return false;
    };
    !rest.is_empty()
        && rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'/' || b == b'+')
}

/// `SSH-2.0-<alnum>` optionally followed by one space and a comment of
/// alphanumerics, dashes, underscores, spaces and dots (RFC 4253 section 4.2).
pub fn is_valid_client_version(version: &str) -> bool {
    let Some(rest) = version.strip_prefix("SSH-2.0-") else {
        return false;
    };
    let (software, comment) = match rest.split_once(' ') {
        Some((s, c)) => (s, Some(c)),
        None => (rest, None),
    };
    if software.is_empty() || !software.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    match comment {
        None => true,
        Some(c) => {
            !c.is_empty()
                && c.bytes().all(|b| {
                    b.is_ascii_alphanumeric() || matches!(b, b'-' | b' ' | b'_' | b'.')
                })
        }
    }
}
