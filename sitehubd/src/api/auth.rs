use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use shared::protocol::{HEADER_CLIENT_ID, HEADER_TOKEN};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use super::routes::AppState;
use crate::error::HubError;

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// An agent request whose `{client id, token}` headers authenticated.
/// Every failure is the same 401 whatever part was wrong.
#[derive(Debug, Clone, Copy)]
pub struct AgentAuth(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = header(parts, HEADER_CLIENT_ID).and_then(|v| Uuid::parse_str(v.trim()).ok());
        let token = header(parts, HEADER_TOKEN).unwrap_or("");

        match id {
            Some(id) if state.hub.registry.authenticate(id, token) => {
                // Lets later extractors attribute their rejections
                parts.extensions.insert(AgentAuth(id));
                Ok(AgentAuth(id))
            }
            _ => {
                tracing::debug!(path = %parts.uri.path(), "Rejected agent credentials");
                Err(HubError::Unauthorized)
            }
        }
    }
}

/// Operator request carrying the configured bearer token
pub struct AdminAuth;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.hub.config.api.admin_token.as_deref() else {
            return Err(HubError::Unauthorized);
        };
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");

        if bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            Ok(AdminAuth)
        } else {
            tracing::debug!(path = %parts.uri.path(), "Rejected operator credentials");
            Err(HubError::Unauthorized)
        }
    }
}
