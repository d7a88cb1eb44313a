//! Establishment of the backing SSH connection: retrying TCP dial, client
//! configuration assembly, host key pinning, and authentication ordering.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::client;
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Preferred, SshId};
use tracing::{error, info};

use crate::codes;
use crate::config::algos;
use crate::config::types::UpstreamConfig;
use crate::context::AppContext;
use crate::proxy::dial;

/// russh client handler that accepts exactly the pinned host keys.
///
/// The presented key's SHA-256 fingerprint is compared by string equality
/// against every allow-list entry; the first match accepts. No match aborts
/// the handshake.
pub struct PinnedKeyVerifier {
    allowed: Vec<String>,
    conn_id: String,
}

impl PinnedKeyVerifier {
    pub fn new(allowed: Vec<String>, conn_id: String) -> Self {
        Self { allowed, conn_id }
    }
}

impl client::Handler for PinnedKeyVerifier {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if self.allowed.iter().any(|fp| *fp == fingerprint) {
            return Ok(true);
        }
        error!(
            code = codes::INVALID_FINGERPRINT,
            conn_id = %self.conn_id,
            fingerprint = %fingerprint,
            "Backend host key fingerprint mismatch, aborting handshake"
        );
        Ok(false)
    }
}

/// Build the russh client configuration from the upstream section.
///
/// The configured algorithm lists are copied verbatim as ordered preference
/// lists; validation has already rejected names outside the allow-sets.
pub fn build_client_config(upstream: &UpstreamConfig) -> Arc<client::Config> {
    let kex: Vec<_> = upstream
        .kex
        .iter()
        .filter_map(|n| algos::kex_by_name(n))
        .collect();
    let cipher: Vec<_> = upstream
        .ciphers
        .iter()
        .filter_map(|n| algos::cipher_by_name(n))
        .collect();
    let mac: Vec<_> = upstream
        .macs
        .iter()
        .filter_map(|n| algos::mac_by_name(n))
        .collect();
    let key: Vec<_> = upstream
        .host_key_algos
        .iter()
        .filter_map(|n| algos::host_key_algo_by_name(n))
        .collect();

    Arc::new(client::Config {
        client_id: SshId::Standard(upstream.client_version.clone()),
        preferred: Preferred {
            kex: Cow::Owned(kex),
            key: Cow::Owned(key),
            cipher: Cow::Owned(cipher),
            mac: Cow::Owned(mac),
            ..Preferred::default()
        },
        ..client::Config::default()
    })
}

/// Dial, handshake, and authenticate against the backing server.
///
/// The connect timeout bounds the TCP dial loop only. Handshake and
/// authentication failures increment the `handshake` failure counter and
/// surface as a generic unavailability error; the operator-facing cause is
/// logged under `BACKEND_HANDSHAKE_FAILED`.
pub async fn connect_backend(
    ctx: &AppContext,
    conn_id: &str,
    inbound_username: &str,
) -> Result<client::Handle<PinnedKeyVerifier>> {
    let upstream = &ctx.config.upstream;
    ctx.metrics.record_backend_request();
    let target = format!("{}:{}", upstream.server, upstream.port);

    let stream = dial::connect_with_deadline(
        &upstream.server,
        upstream.port,
        Duration::from_secs(upstream.timeout),
        dial::RETRY_DELAY,
        &ctx.metrics,
    )
    .await
    .map_err(|e| anyhow::anyhow!("service currently unavailable ({e})"))?;

    let config = build_client_config(upstream);
    let verifier = PinnedKeyVerifier::new(
        upstream.allowed_host_key_fingerprints.clone(),
        conn_id.to_string(),
    );

    let mut handle = match client::connect_stream(config, stream, verifier).await {
        Ok(handle) => handle,
        Err(e) => {
            ctx.metrics.record_handshake_failure();
            error!(
                code = codes::BACKEND_HANDSHAKE_FAILED,
                conn_id = %conn_id,
                backend = %target,
                error = %e,
                "Backend SSH handshake failed"
            );
            bail!("SSH service is currently unavailable");
        }
    };

    let username = if upstream.username_pass_through {
        inbound_username
    } else {
        upstream.username.as_str()
    };

    if let Err(e) = authenticate(&mut handle, username, upstream, ctx.client_key.clone()).await {
        ctx.metrics.record_handshake_failure();
        error!(
            code = codes::BACKEND_HANDSHAKE_FAILED,
            conn_id = %conn_id,
            backend = %target,
            error = %e,
            "Failed to authenticate with the backend"
        );
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        bail!("SSH service is currently unavailable");
    }

    info!(
        conn_id = %conn_id,
        backend = %target,
        username = %username,
        "Backend connection established"
    );
    Ok(handle)
}

/// Try the configured auth methods in order: password (always present,
/// possibly empty), then public key if a signer is configured.
async fn authenticate(
    handle: &mut client::Handle<PinnedKeyVerifier>,
    username: &str,
    upstream: &UpstreamConfig,
    key: Option<Arc<PrivateKey>>,
) -> Result<()> {
    let result = handle
        .authenticate_password(username, upstream.password.as_str())
        .await
        .context("password authentication")?;
    if result.success() {
        return Ok(());
    }

    if let Some(key) = key {
        let hash = handle
            .best_supported_rsa_hash()
            .await
            .context("negotiating RSA hash")?
            .flatten();
        let result = handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash))
            .await
            .context("public key authentication")?;
        if result.success() {
            return Ok(());
        }
    }

    bail!("backend rejected all authentication methods")
}
