//! The fleet boundary: cluster handle resolution and cross-cluster watch
//! fan-in, plus the parent-context client resolver.

pub mod parent;
pub mod router;

pub use router::{ClusterHandle, ClusterRouter, ObjectKey};
