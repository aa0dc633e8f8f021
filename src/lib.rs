//! Aegis: Adaptive Authentication, Authorization, and Key Management Core
//!
//! This is the root crate that provides benchmark access to the internal modules.
//! For actual functionality, use the individual crates directly:
//!
//! - `aegis-core`: Configuration, errors, cache abstraction, rate-limit windows
//! - `aegis-crypto`: Cipher suite, managed key lifecycle, password hashing
//! - `aegis-auth`: Credential checks, risk scoring, MFA, sessions, tokens
//! - `aegis-authz`: Role-based access control and attribute rules

// Re-export for benchmarks
pub use aegis_auth as auth;
pub use aegis_authz as authz;
pub use aegis_core as core;
pub use aegis_crypto as crypto;
