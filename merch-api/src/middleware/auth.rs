use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

pub const ADMIN_ROLES: [&str; 2] = ["ADMIN", "SUPER_ADMIN"];
pub const CUSTOMER_ROLE: &str = "CUSTOMER";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminClaims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustomerClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: String,
    pub exp: usize,
}

/// Who is calling a storefront route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Guest,
    Customer(String),
    Admin(String),
}

impl Caller {
    /// Whether the caller may act on an order owned by `owner`.
    /// Orders placed without an account stay open to anyone holding the id.
    pub fn may_access(&self, owner: Option<&str>) -> Result<(), AppError> {
        match (self, owner) {
            (_, None) | (Caller::Admin(_), _) => Ok(()),
            (Caller::Customer(sub), Some(owner)) if sub == owner => Ok(()),
            (Caller::Customer(_), Some(_)) => Err(AppError::Authorization("Order belongs to another customer".to_string())),
            (Caller::Guest, Some(_)) => Err(AppError::Authentication("Sign in to manage this order".to_string())),
        }
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Storefront routes: the bearer token is optional, but a bad one is refused
pub async fn customer_identity_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = match bearer_token(&req) {
        None => Caller::Guest,
        Some(token) => {
            let claims = decode::<CustomerClaims>(
                token,
                &DecodingKey::from_secret(state.auth.secret.as_bytes()),
                &Validation::default(),
            )
            .map_err(|e| {
                tracing::warn!(target: "security", "Rejected customer token: {}", e);
                AppError::Authentication("Invalid token".to_string())
            })?
            .claims;

            if ADMIN_ROLES.contains(&claims.role.as_str()) {
                Caller::Admin(claims.sub)
            } else if claims.role == CUSTOMER_ROLE {
                Caller::Customer(claims.sub)
            } else {
                tracing::warn!(target: "security", subject = %claims.sub, role = %claims.role, "Storefront route denied");
                return Err(AppError::Authorization("Customer role required".to_string()));
            }
        }
    };

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// Operator endpoints: Bearer JWT with an admin role
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 1. Extract token
    let token = bearer_token(&req).ok_or_else(|| AppError::Authentication("Missing bearer token".to_string()))?;

    // 2. Decode JWT
    let token_data = decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::warn!(target: "security", "Rejected admin token: {}", e);
        AppError::Authentication("Invalid token".to_string())
    })?;

    // 3. Check role
    if !ADMIN_ROLES.contains(&token_data.claims.role.as_str()) {
        tracing::warn!(target: "security", subject = %token_data.claims.sub, role = %token_data.claims.role, "Admin route denied");
        return Err(AppError::Authorization("Admin role required".to_string()));
    }

    // 4. Inject claims
    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_access_by_caller() {
        let owner = Some("user-1");
        assert!(Caller::Customer("user-1".into()).may_access(owner).is_ok());
        assert!(Caller::Admin("ops-1".into()).may_access(owner).is_ok());
        assert!(Caller::Guest.may_access(None).is_ok());
        assert!(Caller::Customer("user-2".into()).may_access(None).is_ok());

        assert!(matches!(
            Caller::Customer("user-2".into()).may_access(owner),
            Err(AppError::Authorization(_))
        ));
        assert!(matches!(Caller::Guest.may_access(owner), Err(AppError::Authentication(_))));
    }
}
