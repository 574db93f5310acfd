//! # ConfigMapSecret Controller
//!
//! A Kubernetes controller that renders `ConfigMapSecret` resources into
//! native Secrets. A `ConfigMapSecret` embeds a Secret template whose
//! `$(VAR_NAME)` references are expanded from inline variables and from
//! referenced Secrets and ConfigMaps; the controller owns the rendered
//! Secret and re-renders it whenever the source or any of its referenced
//! objects change.
//!
//! ## Overview
//!
//! - **Reference tracking** - an in-memory bidirectional index maps each
//!   source to its referenced Secrets and ConfigMaps, so dependency changes
//!   re-reconcile exactly the affected sources
//! - **Variable resolution** - `varsFrom` sources and `vars` entries are
//!   resolved in order, later bindings winning, with missing required
//!   values surfacing as a `RenderFailure` status condition
//! - **Owned-secret lifecycle** - create, update, take ownership of
//!   existing unowned secrets, and clean up secrets left behind by a
//!   template rename; deletion is handled by cluster garbage collection
//!   through the controller owner reference
//! - **Prometheus metrics and health probes** on dedicated listeners

pub mod controller;
pub mod crd;
pub mod elect;
pub mod observability;
pub mod server;
