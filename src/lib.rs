//! Terraform HTTP remote-state backend.
//!
//! State blobs live under `states/<id>` and lock records under `locks/<id>` in
//! a [`store::BlobStore`]. The [`engine::StateEngine`] applies the protocol
//! rules and the [`http::StateService`] speaks the wire protocol.

pub mod auth;
pub mod engine;
pub mod http;
pub mod inspect;
pub mod lock;
pub mod metrics;
pub mod state_id;
pub mod store;
