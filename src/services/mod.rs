//! Device core services
//!
//! Everything here is transport agnostic: HTTP handlers, socket tasks and the
//! device loop call into these services but the services never call back out.

pub mod firmware;
pub mod lifecycle;
pub mod storage;
pub mod sync;
