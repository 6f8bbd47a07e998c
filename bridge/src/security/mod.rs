//! Request authentication and rate limiting

pub mod middleware;
pub mod rate_limit;

pub use middleware::{auth_middleware, ApiKeyAuth};
pub use rate_limit::{rate_limit_middleware, RateLimiter};
