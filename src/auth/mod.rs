pub mod jwt;
pub mod middleware;
pub mod rate_limit;

pub use jwt::{Claims, hash_token, validate_token};
pub use middleware::{Caller, client_ip, require_auth};
pub use rate_limit::{AuthRateLimiter, RateLimitConfig};
