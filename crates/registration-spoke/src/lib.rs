//! Spoke registration agent
//!
//! A long-lived agent on each managed cluster: bootstraps with a weak
//! credential, obtains a cluster-scoped client certificate, then keeps
//! registration, liveness, addon lifecycle and credential rotation reconciled
//! against the hub.

pub mod addon;
pub mod agent;
pub mod bootstrap;
pub mod capacity;
pub mod hub_secret;
pub mod join;
pub mod lease;
pub mod rotation;
