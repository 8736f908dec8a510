//! # Cohort
//! Group membership and cluster command dispatch for Rust.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Cohort, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `cohort_group` - Tracks the members of a group, detecting partitions and their merges.
//! - `cohort_dispatch` - Executes commands on one, several or all members of a group.

#[cfg(feature = "cohort-dispatch")]
pub use cohort_dispatch as dispatch;
#[cfg(feature = "cohort-group")]
pub use cohort_group as group;
