pub mod auth;
pub mod rate_limit;

pub use auth::{admin_auth_middleware, customer_identity_middleware, AdminClaims, Caller, CustomerClaims};
pub use rate_limit::rate_limit_middleware;
