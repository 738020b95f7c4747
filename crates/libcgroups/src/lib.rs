//! Control group management for the spocker container runtime.
//!
//! A container is placed into a freshly created cgroup-v1 hierarchy spanning
//! the cpu, memory and blkio subsystems. The [`Cgroup`] handle owns the
//! kernel-side directories and the open `tasks` file for the duration of a
//! launch and must be explicitly closed and removed.

pub mod cgroup;
pub mod common;
pub mod spec;
pub mod subsystem;
pub mod util;


pub use cgroup::{Cgroup, CgroupError};
pub use common::DEFAULT_CGROUP_ROOT;
pub use spec::{CgroupSpec, CgroupSpecBuilder, Resources, SpecError};
pub use subsystem::Subsystem;
