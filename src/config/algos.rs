//! Algorithm allow-sets for the backing connection and their mapping onto
//! russh preference entries.
//!
//! Every configurable algorithm name must appear here; configuration
//! validation rejects anything else before a connection is attempted.

use russh::keys::ssh_key::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, kex, mac};

/// Ciphers the proxy will offer to the backing server.
pub const CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-ctr",
    "aes192-ctr",
    "aes128-ctr",
    "aes256-cbc",
    "aes192-cbc",
    "aes128-cbc",
];

/// Key exchange algorithms the proxy will offer to the backing server.
pub const KEXES: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

/// MAC algorithms the proxy will offer to the backing server.
pub const MACS: &[&str] = &[
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha2-256",
    "hmac-sha2-512",
    "hmac-sha1-etm@openssh.com",
    "hmac-sha1",
];

/// Host key algorithms the proxy will accept from the backing server.
pub const HOST_KEY_ALGOS: &[&str] = &[
    "ssh-ed25519",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-rsa",
];

pub fn cipher_by_name(name: &str) -> Option<cipher::Name> {
    match name {
        "chacha20-poly1305@openssh.com" => Some(cipher::CHACHA20_POLY1305),
        "aes256-gcm@openssh.com" => Some(cipher::AES_256_GCM),
        "aes128-gcm@openssh.com" => Some(cipher::AES_128_GCM),
        "aes256-ctr" => Some(cipher::AES_256_CTR),
        "aes192-ctr" => Some(cipher::AES_192_CTR),
        "aes128-ctr" => Some(cipher::AES_128_CTR),
        "aes256-cbc" => Some(cipher::AES_256_CBC),
        "aes192-cbc" => Some(cipher::AES_192_CBC),
        "aes128-cbc" => Some(cipher::AES_128_CBC),
        _ => None,
    }
}

pub fn kex_by_name(name: &str) -> Option<kex::Name> {
    match name {
        "curve25519-sha256" => Some(kex::CURVE25519),
        "curve25519-sha256@libssh.org" => Some(kex::CURVE25519_PRE_RFC_8731),
        "ecdh-sha2-nistp256" => Some(kex::ECDH_SHA2_NISTP256),
        "ecdh-sha2-nistp384" => Some(kex::ECDH_SHA2_NISTP384),
        "ecdh-sha2-nistp521" => Some(kex::ECDH_SHA2_NISTP521),
        "diffie-hellman-group16-sha512" => Some(kex::DH_G16_SHA512),
        "diffie-hellman-group14-sha256" => Some(kex::DH_G14_SHA256),
        "diffie-hellman-group14-sha1" => Some(kex::DH_G14_SHA1),
        "diffie-hellman-group1-sha1" => Some(kex::DH_G1_SHA1),
        _ => None,
    }
}

pub fn mac_by_name(name: &str) -> Option<mac::Name> {
    match name {
        "hmac-sha2-256-etm@openssh.com" => Some(mac::HMAC_SHA256_ETM),
        "hmac-sha2-512-etm@openssh.com" => Some(mac::HMAC_SHA512_ETM),
        "hmac-sha2-256" => Some(mac::HMAC_SHA256),
        "hmac-sha2-512" => Some(mac::HMAC_SHA512),
        "hmac-sha1-etm@openssh.com" => Some(mac::HMAC_SHA1_ETM),
        "hmac-sha1" => Some(mac::HMAC_SHA1),
        _ => None,
    }
}

pub fn host_key_algo_by_name(name: &str) -> Option<Algorithm> {
    match name {
        "ssh-ed25519" => Some(Algorithm::Ed25519),
        "rsa-sha2-512" => Some(Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        }),
        "rsa-sha2-256" => Some(Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        }),
        "ssh-rsa" => Some(Algorithm::Rsa { hash: None }),
        "ecdsa-sha2-nistp256" => Some(Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        }),
        "ecdsa-sha2-nistp384" => Some(Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP384,
        }),
        "ecdsa-sha2-nistp521" => Some(Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP521,
        }),
        _ => None,
    }
}

/// True if `key_type` (the algorithm name of a parsed private key) is a host
/// key algorithm the proxy knows how to negotiate.
pub fn supports_key_type(key_type: &str) -> bool {
    // A bare ssh-rsa key is usable through the rsa-sha2-* signature variants.
    HOST_KEY_ALGOS.contains(&key_type)
}
