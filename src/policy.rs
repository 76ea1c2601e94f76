//! Authorization of port-forward requests.
//!
//! The policy is a gate, not an authenticator: identity is resolved at the
//! session layer, and the policy only decides whether a request carrying
//! that identity may proceed. Deployments substitute a stricter
//! implementation without touching the tunnel machinery.

use std::fmt;

/// One port-forward request, consumed once by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    host: String,
    port: u16,
    principal: Option<String>,
}

impl ForwardRequest {
    pub fn new(host: impl Into<String>, port: u16, principal: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            principal,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (principal: {})",
            self.host,
            self.port,
            self.principal.as_deref().unwrap_or("<none>")
        )
    }
}

/// Decides whether a forward request is permitted. Must be a pure decision:
/// no side effects, same answer for the same request.
pub trait AuthorizationPolicy: Send + Sync {
    fn authorize(&self, request: &ForwardRequest) -> bool;
}

/// Default policy: authorize exactly when the request carries a resolved
/// principal. Permissive by design, matching the stub authentication; it
/// performs no identity check of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrincipalPolicy;

impl AuthorizationPolicy for PrincipalPolicy {
    fn authorize(&self, request: &ForwardRequest) -> bool {
        request.principal().is_some()
    }
}

/// Rejects everything. Useful for exercising denial paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl AuthorizationPolicy for DenyAll {
    fn authorize(&self, _request: &ForwardRequest) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorizes_requests_with_a_principal() {
        let request = ForwardRequest::new("127.0.0.1", 2223, Some("deploy".to_string()));
        assert!(PrincipalPolicy.authorize(&request));
    }

    #[test]
    fn rejects_requests_without_a_principal() {
        let request = ForwardRequest::new("127.0.0.1", 2223, None);
        assert!(!PrincipalPolicy.authorize(&request));
    }

    #[test]
    fn decision_is_pure() {
        let granted = ForwardRequest::new("10.0.0.5", 80, Some("ops".to_string()));
        let denied = ForwardRequest::new("10.0.0.5", 80, None);
        for _ in 0..3 {
            assert!(PrincipalPolicy.authorize(&granted));
            assert!(!PrincipalPolicy.authorize(&denied));
        }
    }

    #[test]
    fn deny_all_rejects_even_resolved_principals() {
        let request = ForwardRequest::new("127.0.0.1", 22, Some("root".to_string()));
        assert!(!DenyAll.authorize(&request));
    }
}
