use std::fmt::Display;
use std::path::Path;

use crate::common::{self, WrappedIoError};
use crate::spec::Resources;

// Relative proportion of CPU time available to the tasks in the cgroup.
const CGROUP_CPU_SHARES: &str = "cpu.shares";
// Hard limit on user memory in bytes.
const CGROUP_MEMORY_LIMIT: &str = "memory.limit_in_bytes";
// Relative proportion of block I/O access (weight range 10 to 1000).
const CGROUP_BLKIO_WEIGHT: &str = "blkio.weight";

/// The cgroup-v1 subsystems spocker configures, in the fixed order they are
/// applied during cgroup construction.
pub const SUBSYSTEMS: &[Subsystem] = &[Subsystem::Cpu, Subsystem::Memory, Subsystem::Blkio];

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Subsystem {
    Cpu,
    Memory,
    Blkio,
}

impl Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Subsystem {
    /// Kernel name of the subsystem, as it appears in mount options and
    /// under the cgroup root.
    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Memory => "memory",
            Subsystem::Blkio => "blkio",
        }
    }

    pub fn control_file(&self) -> &'static str {
        match self {
            Subsystem::Cpu => CGROUP_CPU_SHARES,
            Subsystem::Memory => CGROUP_MEMORY_LIMIT,
            Subsystem::Blkio => CGROUP_BLKIO_WEIGHT,
        }
    }

    fn configured_value(&self, resources: &Resources) -> Option<u64> {
        match self {
            Subsystem::Cpu => resources.cpu_shares,
            Subsystem::Memory => resources.memory_limit_bytes,
            Subsystem::Blkio => resources.blkio_weight,
        }
    }

    pub fn needs_to_handle(&self, resources: &Resources) -> bool {
        self.configured_value(resources).is_some()
    }

    /// Writes the configured limit into the subsystem's control file below
    /// `cgroup_path`. A subsystem without a configured value is a no-op.
    pub fn apply(&self, cgroup_path: &Path, resources: &Resources) -> Result<(), WrappedIoError> {
        tracing::debug!("apply {} cgroup config", self);

        if let Some(value) = self.configured_value(resources) {
            common::write_cgroup_file(cgroup_path.join(self.control_file()), value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::setup;

    #[test]
    fn test_apply_cpu_shares() {
        let (tmp, shares_file) = setup(CGROUP_CPU_SHARES);
        let resources = Resources {
            cpu_shares: Some(512),
            ..Default::default()
        };

        Subsystem::Cpu
            .apply(tmp.path(), &resources)
            .expect("apply cpu");
        let content = fs::read_to_string(shares_file).expect("read cpu shares");
        assert_eq!("512", content);
    }

    #[test]
    fn test_apply_memory_limit() {
        let (tmp, limit_file) = setup(CGROUP_MEMORY_LIMIT);
        let resources = Resources {
            memory_limit_bytes: Some(100_000_000),
            ..Default::default()
        };

        Subsystem::Memory
            .apply(tmp.path(), &resources)
            .expect("apply memory");
        let content = fs::read_to_string(limit_file).expect("read memory limit");
        assert_eq!("100000000", content);
    }

    #[test]
    fn test_apply_blkio_weight() {
        let (tmp, weight_file) = setup(CGROUP_BLKIO_WEIGHT);
        let resources = Resources {
            blkio_weight: Some(200),
            ..Default::default()
        };

        Subsystem::Blkio
            .apply(tmp.path(), &resources)
            .expect("apply blkio");
        let content = fs::read_to_string(weight_file).expect("read blkio weight");
        assert_eq!("200", content);
    }

    #[test]
    fn test_apply_skips_unset_value() {
        let (tmp, shares_file) = setup(CGROUP_CPU_SHARES);

        Subsystem::Cpu
            .apply(tmp.path(), &Resources::default())
            .expect("apply cpu");
        let content = fs::read_to_string(shares_file).expect("read cpu shares");
        assert_eq!("", content);
    }

    #[test]
    fn test_fixed_application_order() {
        let names: Vec<_> = SUBSYSTEMS.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["cpu", "memory", "blkio"]);
    }
}
