//! Concrete entropy sources.
//!
//! | Source | Kind | Transport |
//! |--------|------|-----------|
//! | [`LocalSecureSource`] | `local-secure-random` | OS CSPRNG via `getrandom` |
//! | [`HttpEntropySource`] | `hardware-proxy` / `quantum-proxy` | HTTP GET, JSON payload |

pub mod local;
pub mod remote;

pub use local::LocalSecureSource;
pub use remote::{EntropyPayload, HttpEntropySource, validate_payload};
