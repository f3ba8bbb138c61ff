//! Authentication adapter.
//!
//! The core only needs to turn a request into a principal; how identities
//! are minted is someone else's problem. The bundled adapter trusts an
//! `x-user-id` header set by the reverse proxy in front of the server.

use axum::http::HeaderMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

pub trait AuthAdapter: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Header-based adapter for trusted-proxy deployments.
pub struct HeaderAuth;

impl AuthAdapter for HeaderAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let user_id = headers.get("x-user-id")?.to_str().ok()?.trim();
        if user_id.is_empty() {
            return None;
        }
        Some(Principal {
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_auth() {
        let auth = HeaderAuth;
        let mut headers = HeaderMap::new();
        assert!(auth.authenticate(&headers).is_none());

        headers.insert("x-user-id", "user-7".parse().unwrap());
        assert_eq!(
            auth.authenticate(&headers).unwrap().user_id,
            "user-7".to_string()
        );

        headers.insert("x-user-id", "  ".parse().unwrap());
        assert!(auth.authenticate(&headers).is_none());
    }
}
