//! Authenticator capability (expansion §10.3). Auth validation itself is an
//! out-of-scope external collaborator (spec §1); this module defines the
//! seam the HTTP surface calls into plus the two non-SSH-key implementations
//! named in the §6 configuration table.

use data_encoding::BASE64;

use crate::error::{AppError, AppResult};

/// What the HTTP surface knows about an inbound request at auth time.
pub struct AuthRequest<'a> {
    pub authorization_header: Option<&'a str>,
    pub query_token: Option<&'a str>,
    pub local_header: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow,
    Deny,
}

pub trait Authenticator: Send + Sync {
    /// Decide whether `req` is allowed to proceed. `local` is true when the
    /// peer address is loopback, enabling the allow-local-bypass path.
    fn authenticate(&self, req: &AuthRequest<'_>, local: bool) -> AppResult<AuthOutcome>;
}

/// Backs `--no-auth`: every request is allowed.
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _req: &AuthRequest<'_>, _local: bool) -> AppResult<AuthOutcome> {
        Ok(AuthOutcome::Allow)
    }
}

/// Backs `--username`/`--password`. Accepts the `Authorization: Basic ...`
/// header with any username and the configured password, the same password
/// as a `?token=` query parameter (§6: the WS upgrade handshake can't set
/// custom headers from a browser), plus the `--allow-local-bypass` /
/// `--local-auth-token` / `X-VibeTunnel-Local` carve-out from §6: a loopback
/// peer that presents the local token skips the basic-auth check entirely.
pub struct BasicAuthenticator {
    password: String,
    allow_local_bypass: bool,
    local_auth_token: Option<String>,
}

impl BasicAuthenticator {
    #[must_use]
    pub const fn new(
        password: String,
        allow_local_bypass: bool,
        local_auth_token: Option<String>,
    ) -> Self {
        Self {
            password,
            allow_local_bypass,
            local_auth_token,
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(&self, req: &AuthRequest<'_>, local: bool) -> AppResult<AuthOutcome> {
        if local && self.allow_local_bypass {
            if let (Some(expected), Some(provided)) = (&self.local_auth_token, req.local_header) {
                if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Ok(AuthOutcome::Allow);
                }
            }
        }

        if let Some(token) = req.query_token {
            if constant_time_eq(token.as_bytes(), self.password.as_bytes()) {
                return Ok(AuthOutcome::Allow);
            }
        }

        let Some(header) = req.authorization_header else {
            return Ok(AuthOutcome::Deny);
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return Ok(AuthOutcome::Deny);
        };
        let Ok(decoded) = BASE64.decode(encoded.trim().as_bytes()) else {
            return Ok(AuthOutcome::Deny);
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return Ok(AuthOutcome::Deny);
        };
        let Some((_username, password)) = decoded.split_once(':') else {
            return Ok(AuthOutcome::Deny);
        };

        if constant_time_eq(password.as_bytes(), self.password.as_bytes()) {
            Ok(AuthOutcome::Allow)
        } else {
            Ok(AuthOutcome::Deny)
        }
    }
}

/// Validates an HQ→remote bearer token. Not routed through `Authenticator`
/// since it authenticates the HQ to the remote rather than a browser to the
/// server (expansion §10.3).
#[must_use]
pub fn check_bearer_token(header: Option<&str>, expected: &str) -> bool {
    let Some(header) = header else { return false };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(token.trim().as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Returns `Unauthenticated` when `outcome` denies, otherwise `Ok(())`.
pub fn require_allowed(outcome: AuthOutcome) -> AppResult<()> {
    match outcome {
        AuthOutcome::Allow => Ok(()),
        AuthOutcome::Deny => Err(AppError::Unauthenticated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_authenticator_always_allows() {
        let auth = NoAuthenticator;
        let req = AuthRequest {
            authorization_header: None,
            query_token: None,
            local_header: None,
        };
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Allow);
    }

    #[test]
    fn basic_authenticator_accepts_correct_password() {
        let auth = BasicAuthenticator::new("hunter2".to_string(), false, None);
        let encoded = BASE64.encode(b"anyone:hunter2");
        let header = format!("Basic {encoded}");
        let req = AuthRequest {
            authorization_header: Some(&header),
            query_token: None,
            local_header: None,
        };
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Allow);
    }

    #[test]
    fn basic_authenticator_rejects_wrong_password() {
        let auth = BasicAuthenticator::new("hunter2".to_string(), false, None);
        let encoded = BASE64.encode(b"anyone:wrong");
        let header = format!("Basic {encoded}");
        let req = AuthRequest {
            authorization_header: Some(&header),
            query_token: None,
            local_header: None,
        };
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Deny);
    }

    #[test]
    fn local_bypass_requires_local_peer_and_matching_token() {
        let auth = BasicAuthenticator::new(
            "hunter2".to_string(),
            true,
            Some("secret-token".to_string()),
        );
        let req = AuthRequest {
            authorization_header: None,
            query_token: None,
            local_header: Some("secret-token"),
        };
        assert_eq!(auth.authenticate(&req, true).unwrap(), AuthOutcome::Allow);
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Deny);
    }

    #[test]
    fn basic_authenticator_accepts_matching_query_token() {
        let auth = BasicAuthenticator::new("hunter2".to_string(), false, None);
        let req = AuthRequest {
            authorization_header: None,
            query_token: Some("hunter2"),
            local_header: None,
        };
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Allow);
    }

    #[test]
    fn basic_authenticator_rejects_wrong_query_token() {
        let auth = BasicAuthenticator::new("hunter2".to_string(), false, None);
        let req = AuthRequest {
            authorization_header: None,
            query_token: Some("wrong"),
            local_header: None,
        };
        assert_eq!(auth.authenticate(&req, false).unwrap(), AuthOutcome::Deny);
    }

    #[test]
    fn bearer_token_check_is_exact() {
        assert!(check_bearer_token(Some("Bearer abc123"), "abc123"));
        assert!(!check_bearer_token(Some("Bearer abc124"), "abc123"));
        assert!(!check_bearer_token(None, "abc123"));
    }
}
