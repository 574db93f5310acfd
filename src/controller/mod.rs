//! # Controller
//!
//! The reconciliation engine: expansion, variable resolution, rendering,
//! the reference index, the reconcile loop, and event dispatch.

pub mod backoff;
pub mod conditions;
pub mod dispatch;
pub mod expansion;
pub mod reconciler;
pub mod refmap;
pub mod render;
pub mod vars;
