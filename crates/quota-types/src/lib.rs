//! Typed records of the `quota.miloapis.com/v1alpha1` API group.
//!
//! This crate defines the six record kinds of the quota control plane
//! (registrations, grants, claims, buckets and the two creation policies),
//! the deterministic bucket identity functions shared by every writer, and
//! the condition helpers used to publish controller observations.

pub mod bucket;
pub mod claim;
pub mod conditions;
pub mod grant;
pub mod identity;
pub mod labels;
pub mod policy;
pub mod refs;
pub mod registration;
pub mod validation;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;

/// API group of every record kind in this crate.
pub const API_GROUP: &str = "quota.miloapis.com";

/// API version of every record kind in this crate.
pub const API_VERSION: &str = "v1alpha1";
