//! Upgrade-time admission checks.
//!
//! Runs inside the WebSocket handshake callback, before the connection
//! exists: request logging, token extraction and verification, permission
//! compilation, and per-user connection limiting. Rejections surface as
//! plain HTTP error responses to the upgrade request.

use std::sync::Arc;

use dispatch_core::auth;
use dispatch_core::transport::CloseReason;
use dispatch_core::{Permission, PermissionRegistry, TopologyStore};
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::info;

use crate::config::{ConnectionLimitSettings, LimitMode};

/// Metadata handed to the connection wiring once admission passes.
#[derive(Debug, Clone)]
pub(crate) struct Admission {
    pub user_id: String,
    pub global_permissions: Permission,
}

/// Why an upgrade request was refused.
#[derive(Debug, Error)]
pub(crate) enum Rejection {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("too many active connections")]
    TooManyConnections,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Rejection::Forbidden(_) => StatusCode::FORBIDDEN,
            Rejection::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(None);
        *response.status_mut() = self.status();
        response
    }
}

/// Admits or rejects one upgrade request.
///
/// In `cycle` mode a user at their limit displaces their oldest connection;
/// its close callback deregisters it synchronously, so the new socket is
/// admitted against an up-to-date count.
pub(crate) fn admit(
    request: &Request,
    topology: &Arc<TopologyStore>,
    permissions: &Arc<PermissionRegistry>,
    jwt_secret: &str,
    limit: &ConnectionLimitSettings,
) -> Result<Admission, Rejection> {
    let token = extract_token(request)
        .ok_or_else(|| Rejection::Unauthorized("no token presented".to_string()))?;

    let claims = auth::verify(&token, jwt_secret.as_bytes())
        .map_err(|err| Rejection::Unauthorized(err.to_string()))?;

    let global_permissions = permissions
        .compile(&claims.perms)
        .map_err(|err| Rejection::Forbidden(err.to_string()))?;

    if limit.max_per_user > 0 {
        let count = topology.user_connection_count(&claims.sub);
        if count >= limit.max_per_user {
            match limit.mode {
                LimitMode::Reject => return Err(Rejection::TooManyConnections),
                LimitMode::Cycle => {
                    if let Some(oldest) = topology.find_oldest_user_connection(&claims.sub) {
                        info!(user_id = %claims.sub, conn_id = %oldest.id,
                            "cycling connection: closing oldest");
                        oldest.transport.close(CloseReason::Cycled);
                    }
                }
            }
        }
    }

    Ok(Admission {
        user_id: claims.sub,
        global_permissions,
    })
}

/// Pulls the token from the `Authorization: Bearer` header or the
/// `session-token` cookie.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    let cookies = request.headers().get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == "session-token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::auth::TokenClaims;
    use dispatch_core::transport::{Connection, TransportConfig};

    const SECRET: &str = "test-secret";

    fn request(token: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/ws");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    fn limit(max_per_user: usize, mode: LimitMode) -> ConnectionLimitSettings {
        ConnectionLimitSettings { max_per_user, mode }
    }

    #[test]
    fn test_missing_token_is_unauthorized() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());
        let rejection = admit(
            &request(None),
            &topology,
            &permissions,
            SECRET,
            &limit(5, LimitMode::Reject),
        )
        .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_invalid_token_is_unauthorized() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());
        let token = auth::sign(&TokenClaims::new("alice"), b"other-secret");
        let rejection = admit(
            &request(Some(&token)),
            &topology,
            &permissions,
            SECRET,
            &limit(5, LimitMode::Reject),
        )
        .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_unregistered_permission_is_forbidden() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());
        let mut claims = TokenClaims::new("alice");
        claims.perms = vec!["warlord".to_string()];
        let token = auth::sign(&claims, SECRET.as_bytes());
        let rejection = admit(
            &request(Some(&token)),
            &topology,
            &permissions,
            SECRET,
            &limit(5, LimitMode::Reject),
        )
        .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_valid_token_is_admitted_with_compiled_permissions() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());
        let moderator = permissions.register("moderator").unwrap();

        let mut claims = TokenClaims::new("alice");
        claims.perms = vec!["read".to_string(), "moderator".to_string()];
        let token = auth::sign(&claims, SECRET.as_bytes());

        let admission = admit(
            &request(Some(&token)),
            &topology,
            &permissions,
            SECRET,
            &limit(5, LimitMode::Reject),
        )
        .unwrap();
        assert_eq!(admission.user_id, "alice");
        assert_eq!(
            admission.global_permissions,
            Permission::READ | moderator
        );
    }

    #[test]
    fn test_reject_mode_returns_429_at_limit() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());

        let transport = Connection::new(TransportConfig::default()).handle();
        topology
            .register_connection(transport.clone(), "127.0.0.1")
            .unwrap();
        topology
            .associate_user(transport.id(), "alice", Permission::NONE)
            .unwrap();

        let token = auth::sign(&TokenClaims::new("alice"), SECRET.as_bytes());
        let rejection = admit(
            &request(Some(&token)),
            &topology,
            &permissions,
            SECRET,
            &limit(1, LimitMode::Reject),
        )
        .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_cycle_mode_closes_oldest_connection() {
        let topology = Arc::new(TopologyStore::new());
        let permissions = Arc::new(PermissionRegistry::new());

        let conn = Connection::new(TransportConfig::default());
        let transport = conn.handle();
        let store = topology.clone();
        conn.set_close_handler(Arc::new(move |id, _| store.deregister_connection(id)));
        topology
            .register_connection(transport.clone(), "127.0.0.1")
            .unwrap();
        topology
            .associate_user(transport.id(), "carol", Permission::NONE)
            .unwrap();

        let token = auth::sign(&TokenClaims::new("carol"), SECRET.as_bytes());
        let admission = admit(
            &request(Some(&token)),
            &topology,
            &permissions,
            SECRET,
            &limit(1, LimitMode::Cycle),
        )
        .unwrap();
        assert_eq!(admission.user_id, "carol");

        // The displaced socket is closed and already deregistered.
        assert!(transport.is_closed());
        assert_eq!(topology.user_connection_count("carol"), 0);
        transport.done().await;
    }

    #[test]
    fn test_cookie_token_extraction() {
        let request = Request::builder()
            .uri("ws://localhost/ws")
            .header("cookie", "theme=dark; session-token=tok-123; lang=en")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request).as_deref(), Some("tok-123"));
    }
}
