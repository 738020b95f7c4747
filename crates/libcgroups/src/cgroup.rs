use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::common::{self, WrappedIoError, CGROUP_TASKS, DEFAULT_CGROUP_ROOT};
use crate::spec::{CgroupSpec, SpecError};
use crate::subsystem::{Subsystem, SUBSYSTEMS};

/// Lifecycle of a [`Cgroup`] handle. Mutation is legal only while built,
/// removal only after the tasks handle has been released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Built,
    Closed,
    Removed,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            State::Built => "built",
            State::Closed => "closed",
            State::Removed => "removed",
        };
        f.write_str(print)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CgroupError {
    #[error("invalid cgroup spec: {0}")]
    Spec(#[from] SpecError),
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("cgroup {path} already exists and cannot be reused")]
    AlreadyExists { path: PathBuf },
    #[error("cgroup {path} does not exist")]
    NotFound { path: PathBuf },
    #[error("failed to apply {subsystem} settings: {err}")]
    SubsystemApply {
        subsystem: Subsystem,
        #[source]
        err: WrappedIoError,
    },
    #[error("cgroup {op} requires state {expected}, but the cgroup is {actual}")]
    InvalidState {
        op: &'static str,
        expected: State,
        actual: State,
    },
}

/// An owned Linux control group: the aggregated directory under the cgroup
/// root, the open `tasks` write handle, and the configured subsystem
/// directories.
///
/// The handle must be [`close`](Cgroup::close)d before it can be
/// [`remove`](Cgroup::remove)d; both are explicit because removal can fail
/// and has to be observable by the caller.
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    root: PathBuf,
    tasks: Option<File>,
    subsystem_paths: Vec<(Subsystem, PathBuf)>,
    state: State,
}

impl Cgroup {
    /// Creates the cgroup described by `spec`: the aggregated directory with
    /// its `tasks` file seeded with the runtime pid, followed by one
    /// directory per configured subsystem with its control file written, in
    /// the fixed cpu, memory, blkio order.
    pub fn create(spec: &CgroupSpec) -> Result<Cgroup, CgroupError> {
        spec.validate()?;

        let root = spec
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT));
        let cgroup_path = root.join(&spec.name);
        create_leaf_dir(&cgroup_path)?;

        let tasks_path = cgroup_path.join(CGROUP_TASKS);
        let mut tasks = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o644)
            .open(&tasks_path)
            .map_err(|err| WrappedIoError::Open {
                err,
                path: tasks_path.clone(),
            })?;
        let pid_line = format!("{}\n", std::process::id());
        tasks
            .write_all(pid_line.as_bytes())
            .map_err(|err| WrappedIoError::Write {
                err,
                path: tasks_path.clone(),
                data: pid_line.clone(),
            })?;

        let mut subsystem_paths = Vec::new();
        for subsystem in SUBSYSTEMS {
            if !subsystem.needs_to_handle(&spec.resources) {
                continue;
            }

            let subsystem_path = root.join(subsystem.name()).join(&spec.name);
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&subsystem_path)
                .map_err(|err| WrappedIoError::CreateDir {
                    err,
                    path: subsystem_path.clone(),
                })?;
            subsystem
                .apply(&subsystem_path, &spec.resources)
                .map_err(|err| CgroupError::SubsystemApply {
                    subsystem: *subsystem,
                    err,
                })?;
            subsystem_paths.push((*subsystem, subsystem_path));
        }

        tracing::debug!(name = %spec.name, "created cgroup");
        Ok(Cgroup {
            name: spec.name.clone(),
            root,
            tasks: Some(tasks),
            subsystem_paths,
            state: State::Built,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subsystem_paths(&self) -> &[(Subsystem, PathBuf)] {
        &self.subsystem_paths
    }

    /// Writes `value` into the named control file of the aggregated
    /// directory.
    pub fn set(&self, control: &str, value: &str) -> Result<(), CgroupError> {
        self.ensure_state("set", State::Built)?;

        let control_path = self.root.join(&self.name).join(control);
        common::write_cgroup_file_str(control_path, value)?;
        Ok(())
    }

    /// Classifies `pid` into the cgroup by appending it to the `tasks` file.
    pub fn add_process(&self, pid: Pid) -> Result<(), CgroupError> {
        self.ensure_state("add_process", State::Built)?;

        let tasks_path = self.root.join(&self.name).join(CGROUP_TASKS);
        let mut tasks = OpenOptions::new()
            .append(true)
            .open(&tasks_path)
            .map_err(|err| WrappedIoError::Open {
                err,
                path: tasks_path.clone(),
            })?;
        let pid_line = format!("{}\n", pid.as_raw());
        tasks
            .write_all(pid_line.as_bytes())
            .map_err(|err| WrappedIoError::Write {
                err,
                path: tasks_path,
                data: pid_line.clone(),
            })?;
        Ok(())
    }

    /// Releases the `tasks` descriptor. A second close is an error.
    pub fn close(&mut self) -> Result<(), CgroupError> {
        self.ensure_state("close", State::Built)?;

        self.tasks.take();
        self.state = State::Closed;
        Ok(())
    }

    /// Removes the aggregated directory and every configured subsystem
    /// directory. With `ignore_missing`, directories that are already gone
    /// count as removed; without it they surface as `NotFound`.
    pub fn remove(&mut self, ignore_missing: bool) -> Result<(), CgroupError> {
        if self.state == State::Built {
            return Err(CgroupError::InvalidState {
                op: "remove",
                expected: State::Closed,
                actual: self.state,
            });
        }

        let mut paths = vec![self.root.join(&self.name)];
        paths.extend(self.subsystem_paths.iter().map(|(_, p)| p.clone()));

        for path in paths {
            match remove_cgroup_dir(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if !ignore_missing {
                        return Err(CgroupError::NotFound { path });
                    }
                }
                Err(err) => return Err(WrappedIoError::Other { err, path }.into()),
            }
        }

        self.state = State::Removed;
        tracing::debug!(name = %self.name, "removed cgroup");
        Ok(())
    }

    fn ensure_state(&self, op: &'static str, expected: State) -> Result<(), CgroupError> {
        if self.state != expected {
            return Err(CgroupError::InvalidState {
                op,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

fn create_leaf_dir(path: &Path) -> Result<(), CgroupError> {
    match fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if reusable_dir(path) {
                Ok(())
            } else {
                Err(CgroupError::AlreadyExists {
                    path: path.to_path_buf(),
                })
            }
        }
        Err(err) => Err(WrappedIoError::CreateDir {
            err,
            path: path.to_path_buf(),
        }
        .into()),
    }
}

/// A leftover directory is taken over only when it is an empty, writable
/// directory; anything else belongs to a live instance.
fn reusable_dir(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_dir() || metadata.permissions().readonly() {
        return false;
    }
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

/// Cgroupfs directories are removed with rmdir even though they appear to
/// hold control files; regular directories (test roots) need the recursive
/// form.
fn remove_cgroup_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir(path) {
        Err(err) if err.raw_os_error() == Some(nix::errno::Errno::ENOTEMPTY as i32) => {
            fs::remove_dir_all(path)
        }
        other => other,
    }
}
