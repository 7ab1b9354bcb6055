//! Authentication challenge and verification for HTTP Basic and Digest
//! (RFC 2617), including the nonce lifecycle. The credential backend is
//! pluggable through [`CredentialStore`].

pub mod basic;
pub mod digest;
pub mod store;

pub use self::store::{CredentialStore, FileStore, MemoryStore, StoredPassword};

use std::sync::Arc;

use tracing::debug;

use crate::conn::{ConnCore, ErrorFlags};

/// Authentication scheme required by a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// No authentication.
    None,
    /// HTTP Basic.
    Basic,
    /// HTTP Digest per RFC 2617.
    Digest,
}

/// Per-route authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Required scheme.
    pub auth_type: AuthType,
    /// Protection realm presented in challenges.
    pub realm: String,
    /// Whether Digest challenges advertise `qop="auth"`.
    pub qop_auth: bool,
    /// Credential backend.
    pub store: Arc<dyn CredentialStore>,
}

impl AuthConfig {
    /// Basic authentication against `store` for `realm`.
    pub fn basic(realm: impl Into<String>, store: Arc<dyn CredentialStore>) -> AuthConfig {
        AuthConfig {
            auth_type: AuthType::Basic,
            realm: realm.into(),
            qop_auth: false,
            store,
        }
    }

    /// Digest authentication with `qop="auth"` against `store`.
    pub fn digest(realm: impl Into<String>, store: Arc<dyn CredentialStore>) -> AuthConfig {
        AuthConfig {
            auth_type: AuthType::Digest,
            realm: realm.into(),
            qop_auth: true,
            store,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_type", &self.auth_type)
            .field("realm", &self.realm)
            .field("qop_auth", &self.qop_auth)
            .finish()
    }
}

/// Verify the request against the route's auth configuration. Returns
/// true when access is granted; otherwise a challenge (or 400) has been
/// emitted on the connection.
pub(crate) fn check(core: &mut ConnCore, auth: &AuthConfig) -> bool {
    if auth.auth_type == AuthType::None {
        return true;
    }
    let (scheme, details) = {
        let rx = core.rx_ref();
        (rx.auth_type.clone(), rx.auth_details.clone())
    };
    let details = match details {
        Some(details) if !details.is_empty() => details,
        _ => {
            return challenge(core, auth, false, "Access Denied. Login required");
        }
    };
    let scheme = scheme.unwrap_or_default();
    let expected_scheme = match auth.auth_type {
        AuthType::Basic => "basic",
        AuthType::Digest => "digest",
        AuthType::None => unreachable!(),
    };
    if scheme != expected_scheme {
        return challenge(core, auth, false, "Access Denied. Wrong authentication protocol");
    }
    match auth.auth_type {
        AuthType::Basic => check_basic(core, auth, &details),
        AuthType::Digest => check_digest(core, auth, &details),
        AuthType::None => true,
    }
}

fn check_basic(core: &mut ConnCore, auth: &AuthConfig, details: &str) -> bool {
    let (user, password) = match basic::decode(details) {
        Some(creds) => creds,
        None => {
            core.error(400, ErrorFlags::default(), "Bad authorization header");
            return false;
        }
    };
    let stored = match auth.store.lookup(&auth.realm, &user) {
        Some(stored) if stored.enabled => stored,
        _ => {
            debug!(%user, "access denied: user not defined");
            return challenge(core, auth, false, "Access denied, authentication error");
        }
    };
    if !auth.store.validate(&auth.realm, &user, &password, &stored) {
        debug!(%user, "access denied: bad password");
        return challenge(core, auth, false, "Access denied, authentication error");
    }
    grant(core, &user, "basic");
    true
}

fn check_digest(core: &mut ConnCore, auth: &AuthConfig, details: &str) -> bool {
    let dp = match digest::parse_details(details) {
        Some(dp) => dp,
        None => {
            core.error(400, ErrorFlags::default(), "Bad authorization header");
            return false;
        }
    };
    if dp.realm.as_deref() != Some(auth.realm.as_str()) {
        debug!("access denied: realm mismatch");
        return challenge(core, auth, false, "Access denied, authentication error");
    }
    if let Some(ref qop) = dp.qop {
        if qop != "auth" {
            debug!("access denied: bad qop");
            return challenge(core, auth, false, "Access denied, authentication error");
        }
    }
    let secret = core.http.secret().to_string();
    let nonce = dp.nonce.clone().unwrap_or_default();
    match digest::parse_nonce(&nonce) {
        Some(parsed) => {
            if parsed.secret != secret || parsed.realm != auth.realm {
                debug!("access denied: nonce mismatch");
                return challenge(core, auth, false, "Access denied, authentication error");
            }
            if parsed.age(now_secs()) > digest::NONCE_LIFETIME_SECS {
                // Only the nonce expired: re-challenge with stale=true
                // so the client retries without prompting the user.
                debug!("access denied: nonce is stale");
                return challenge(core, auth, true, "Access denied, authentication error");
            }
        }
        None => {
            debug!("access denied: undecodable nonce");
            return challenge(core, auth, false, "Access denied, authentication error");
        }
    }
    let user = dp.username.clone().unwrap_or_default();
    let stored = match auth.store.lookup(&auth.realm, &user) {
        Some(stored) if stored.enabled => stored,
        _ => {
            debug!(%user, "access denied: user not defined");
            return challenge(core, auth, false, "Access denied, authentication error");
        }
    };
    let ha1 = if stored.digest_ready {
        stored.secret.clone()
    } else {
        digest::md5_hex(&format!("{}:{}:{}", user, auth.realm, stored.secret))
    };
    let method = core.rx_ref().method.as_str().to_string();
    let expected = digest::calc_digest(
        &ha1,
        &method,
        dp.uri.as_deref().unwrap_or(""),
        &nonce,
        dp.qop.as_deref(),
        dp.nc.as_deref(),
        dp.cnonce.as_deref(),
    );
    let response = dp.response.clone().unwrap_or_default();
    if !digest::const_time_eq(expected.as_bytes(), response.as_bytes()) {
        debug!(%user, "access denied: digest mismatch");
        return challenge(core, auth, false, "Access denied, authentication error");
    }
    grant(core, &user, "digest");
    true
}

fn grant(core: &mut ConnCore, user: &str, scheme: &str) {
    debug!(%user, scheme, "authenticated");
    let rx = core.rx_mut();
    rx.auth_user = Some(user.to_string());
    rx.form_vars.set("AUTH_TYPE", scheme.to_string());
    rx.form_vars.set("REMOTE_USER", user.to_string());
}

/// Emit the 401 challenge appropriate for the configured scheme.
fn challenge(core: &mut ConnCore, auth: &AuthConfig, stale: bool, msg: &str) -> bool {
    let header = match auth.auth_type {
        AuthType::Basic => format!("Basic realm=\"{}\"", auth.realm),
        AuthType::Digest => {
            let secret = core.http.secret().to_string();
            let nonce = digest::mint_nonce(&secret, &auth.realm, now_secs(), core.http.next_nonce());
            let domain = core
                .host
                .as_ref()
                .map(|h| h.name().to_string())
                .unwrap_or_default();
            if auth.qop_auth {
                let mut header = format!(
                    "Digest realm=\"{}\", domain=\"{}\", qop=\"auth\", nonce=\"{}\", \
                     opaque=\"{}\", algorithm=\"MD5\"",
                    auth.realm,
                    domain,
                    nonce,
                    digest::OPAQUE
                );
                if stale {
                    header.push_str(", stale=\"true\"");
                }
                header
            } else {
                format!("Digest realm=\"{}\", nonce=\"{}\"", auth.realm, nonce)
            }
        }
        AuthType::None => return true,
    };
    {
        let tx = core.tx_mut();
        tx.headers.set("WWW-Authenticate", header);
        tx.set_content_type("text/plain");
    }
    core.error(401, ErrorFlags::default(), msg);
    false
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ConnCore {
    /// Client side: record the server's `WWW-Authenticate` challenge.
    pub(crate) fn parse_authenticate(&mut self, value: &str) {
        let mut it = value.splitn(2, char::is_whitespace);
        let scheme = it.next().unwrap_or("").to_ascii_lowercase();
        let rest = it.next().unwrap_or("");
        self.client_auth.auth_type = Some(scheme.clone());
        if scheme == "digest" {
            if let Some(dp) = digest::parse_details(rest) {
                self.client_auth.realm = dp.realm;
                self.client_auth.domain = dp.domain;
                self.client_auth.nonce = dp.nonce;
                self.client_auth.opaque = dp.opaque;
                self.client_auth.qop = dp.qop;
            }
        } else if scheme == "basic" {
            if let Some(dp) = digest::parse_details(rest) {
                self.client_auth.realm = dp.realm;
            }
        }
    }
}
