use std::path::PathBuf;

/// Resource limits applied to a container cgroup. A limit that is `None`
/// leaves the corresponding subsystem untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu_shares: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub blkio_weight: Option<u64>,
}

/// Specification for a container cgroup: the leaf name, an optional root
/// override (defaults to `/sys/fs/cgroup`) and the resource limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupSpec {
    pub name: String,
    pub root: Option<PathBuf>,
    pub resources: Resources,
}

#[derive(thiserror::Error, Debug)]
pub enum SpecError {
    #[error("cgroup name must not be empty")]
    EmptyName,
    #[error("cgroup name {name:?} must not contain '/'")]
    SeparatorInName { name: String },
}

impl CgroupSpec {
    /// The name is a single path component under the cgroup root; anything
    /// containing a separator could address an arbitrary hierarchy level.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.name.contains('/') {
            return Err(SpecError::SeparatorInName {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Builder for [`CgroupSpec`], mirroring the optional-field shape of the
/// launch request.
#[derive(Debug, Default)]
pub struct CgroupSpecBuilder {
    name: String,
    root: Option<PathBuf>,
    resources: Resources,
}

impl CgroupSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<CgroupSpec, SpecError> {
        let spec = CgroupSpec {
            name: self.name,
            root: self.root,
            resources: self.resources,
        };
        spec.validate()?;
        Ok(spec)
    }
}
