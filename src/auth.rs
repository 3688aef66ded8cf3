//! Identity forwarded by the session provider, and the role checks built on it.
//!
//! Credentials are never validated here. The provider in front of the
//! service authenticates the user and forwards `x-user-*` headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Analyst,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    ViewAnalytics,
    ViewAuditLogs,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct NavLink {
    pub label: &'static str,
    pub path: &'static str,
}

impl Role {
    pub fn can(self, capability: Capability) -> bool {
        match capability {
            Capability::Chat => true,
            Capability::ViewAnalytics => matches!(self, Role::Admin | Role::Analyst),
            Capability::ViewAuditLogs => matches!(self, Role::Admin),
        }
    }

    /// Links the role is allowed to see besides the chat itself.
    pub fn navigation(self) -> Vec<NavLink> {
        let mut links = vec![NavLink {
            label: "Chat",
            path: "/",
        }];
        if self.can(Capability::ViewAuditLogs) {
            links.push(NavLink {
                label: "Admin Dashboard",
                path: "/admin",
            });
            links.push(NavLink {
                label: "Audit Logs",
                path: "/admin/audit-logs",
            });
        }
        if self.can(Capability::ViewAnalytics) {
            links.push(NavLink {
                label: "Analytics",
                path: "/analytics",
            });
        }
        links
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "analyst" => Ok(Role::Analyst),
            "admin" => Ok(Role::Admin),
            other => Err(AuthError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing identity header: {0}")]
    MissingHeader(&'static str),
    #[error("Unknown role: {0}")]
    UnknownRole(String),
    #[error("Access denied")]
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The signed-in user as seen by this service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Principal {
    pub fn require(&self, capability: Capability) -> Result<(), AuthError> {
        if self.role.can(capability) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let header = |name: &'static str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let id = header("x-user-id").ok_or(AuthError::MissingHeader("x-user-id"))?;
        let role = header("x-user-role")
            .ok_or(AuthError::MissingHeader("x-user-role"))?
            .parse()?;

        Ok(Self {
            name: header("x-user-name").unwrap_or_else(|| id.clone()),
            email: header("x-user-email").unwrap_or_default(),
            id,
            role,
        })
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Principal::from_headers(&parts.headers)
    }
}

/// Where a request came from, attached to audit entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestOrigin {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ip_address = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            ip_address,
            user_agent,
        }
    }
}

impl<S> FromRequestParts<S> for RequestOrigin
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestOrigin::from_headers(&parts.headers))
    }
}
