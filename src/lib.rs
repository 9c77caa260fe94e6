//! OAuth broker for Service Provider Integration.
//!
//! Runs the authorization-code flow against code hosting and registry
//! providers on behalf of a Kubernetes identity, and stores the obtained token
//! for the `SPIAccessToken` the flow was started for.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod kube;
pub mod oauth;
pub mod routes;
pub mod session;
pub mod storage;
