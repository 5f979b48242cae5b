//! HTTP middleware components.
//!
//! Provides bearer authentication for the control plane and the `auth` /
//! `admin` route tags plugins attach to their routes.

pub mod auth;

pub use auth::{AuthGate, TokenAuthGate, require_admin, require_auth};
