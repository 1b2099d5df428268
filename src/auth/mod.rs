//! Authentication edge contract
//! Mission: Turn verified bearer tokens into an authoritative owner scope

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtVerifier};
pub use middleware::{auth_middleware, AuthContext};
