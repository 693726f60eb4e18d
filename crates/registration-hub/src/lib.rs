//! Hub-side registration control plane
//!
//! Watches ManagedClusters and their dependents on the hub: accepts spokes,
//! auto-approves certificate renewals, evaluates lease liveness, projects
//! availability into taints, and tears down dependents on deprovision. The
//! admission webhook guards cluster and clusterset writes inline.

pub mod acceptance;
pub mod addon_discovery;
pub mod authorizer;
pub mod backoff;
pub mod csr_approver;
pub mod deletion;
pub mod lease;
pub mod manager;
pub mod rbac;
pub mod taint;
pub mod webhook;
