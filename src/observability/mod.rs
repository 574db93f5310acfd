//! Observability: prometheus metrics served over HTTP by [`crate::server`].

pub mod metrics;
