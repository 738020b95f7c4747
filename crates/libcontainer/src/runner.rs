//! The launch orchestrator.
//!
//! Resources are acquired in the fixed order cgroup → namespace →
//! filesystem → network, the container child is spawned with the clone
//! flags derived from the namespace spec, and everything is released in
//! strict reverse order on every exit path. Cleanup failures are logged and
//! never mask the primary error.

use std::path::PathBuf;

use libcgroups::{Cgroup, CgroupError, CgroupSpec};

use crate::error::ErrorKind;
use crate::filesystem::{Filesystem, FilesystemError};
use crate::namespace::{Namespace, NamespaceError, NamespaceSpec};
use crate::network::{self, Network, NetworkConfig, NetworkError};
use crate::process::{self, ChildConfig, ProcessError};

/// A fully decoded launch request: the program to run and the four resource
/// specifications. The runner owns one of each resource for the duration of
/// the launch.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub argv: Vec<String>,
    pub cgroup: CgroupSpec,
    pub namespace: NamespaceSpec,
    pub fs_root: PathBuf,
    pub network: NetworkConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("spocker must run with effective uid 0")]
    Permission,
    #[error("launch request has an empty argv")]
    EmptyArgv,
    #[error("cgroup setup failed: {0}")]
    Cgroup(#[from] CgroupError),
    #[error("namespace setup failed: {0}")]
    Namespace(#[from] NamespaceError),
    #[error("filesystem setup failed: {0}")]
    Filesystem(#[from] FilesystemError),
    #[error("network setup failed: {0}")]
    Network(#[from] NetworkError),
    #[error("container process failed: {0}")]
    Child(#[from] ProcessError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Permission => ErrorKind::Permission,
            RunError::EmptyArgv => ErrorKind::InvalidSpec,
            RunError::Cgroup(err) => cgroup_kind(err),
            RunError::Namespace(err) => err.kind(),
            RunError::Filesystem(err) => err.kind(),
            RunError::Network(err) => err.kind(),
            RunError::Child(err) => process_kind(err),
        }
    }
}

fn cgroup_kind(err: &CgroupError) -> ErrorKind {
    match err {
        CgroupError::Spec(_) => ErrorKind::InvalidSpec,
        CgroupError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
        CgroupError::NotFound { .. } => ErrorKind::NotFound,
        CgroupError::InvalidState { .. } => ErrorKind::Internal,
        CgroupError::WrappedIo(_) | CgroupError::SubsystemApply { .. } => ErrorKind::KernelIo,
    }
}

fn process_kind(err: &ProcessError) -> ErrorKind {
    match err {
        ProcessError::EmptyArgv | ProcessError::BadArgv(_) => ErrorKind::InvalidSpec,
        ProcessError::InitNotFound => ErrorKind::NotFound,
        ProcessError::Fork(_) | ProcessError::Wait(_) | ProcessError::Proc(_) => {
            ErrorKind::KernelIo
        }
    }
}

/// Runs one container launch end to end, returning the child's exit code.
pub fn run(request: &LaunchRequest) -> Result<i32, RunError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(RunError::Permission);
    }
    if request.argv.is_empty() {
        return Err(RunError::EmptyArgv);
    }

    let mut cgroup = Cgroup::create(&request.cgroup)?;

    let mut namespace = match Namespace::create(&request.namespace) {
        Ok(namespace) => namespace,
        Err(err) => {
            release_cgroup(&mut cgroup);
            return Err(err.into());
        }
    };

    let filesystem = match Filesystem::new(&request.fs_root) {
        Ok(filesystem) => filesystem,
        Err(err) => {
            release_namespace(&mut namespace);
            release_cgroup(&mut cgroup);
            return Err(err.into());
        }
    };

    let network = match network::create(&request.network) {
        Ok(network) => network,
        Err(err) => {
            // The filesystem handle owns no kernel state; nothing to undo.
            release_namespace(&mut namespace);
            release_cgroup(&mut cgroup);
            return Err(err.into());
        }
    };

    let result = launch_child(request, &cgroup, &filesystem);

    release_network(&network);
    release_namespace(&mut namespace);
    release_cgroup(&mut cgroup);

    result
}

fn launch_child(
    request: &LaunchRequest,
    cgroup: &Cgroup,
    filesystem: &Filesystem,
) -> Result<i32, RunError> {
    let config = ChildConfig {
        argv: request.argv.clone(),
        cwd: filesystem.root().to_path_buf(),
        hostname: container_hostname(request),
        clone_flags: request.namespace.clone_flags(),
    };

    let pid = process::spawn(config)?;

    // The runtime pid went into the tasks file at creation, so the forked
    // child inherits the cgroup either way; the explicit add keeps the
    // membership visible even if the runtime is later reclassified.
    if let Err(err) = cgroup.add_process(pid) {
        tracing::warn!("failed to add container process to cgroup: {err}");
    }

    let code = process::wait_for_exit(pid)?;
    tracing::info!(code, "container exited");
    Ok(code)
}

/// The hostname is derived from the cgroup name; the child applies it after
/// unsharing its UTS namespace, so the host is never renamed.
fn container_hostname(request: &LaunchRequest) -> String {
    request.cgroup.name.clone()
}

fn release_cgroup(cgroup: &mut Cgroup) {
    if let Err(err) = cgroup.close() {
        tracing::warn!("failed to close cgroup: {err}");
    }
    if let Err(err) = cgroup.remove(true) {
        tracing::warn!("failed to remove cgroup: {err}");
    }
}

fn release_namespace(namespace: &mut Namespace) {
    if let Err(err) = namespace.close() {
        tracing::warn!("failed to close namespace: {err}");
    }
}

fn release_network(network: &Network) {
    if let Err(err) = network::delete(&network.name) {
        tracing::warn!(network = %network.name, "failed to delete network: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceType;
    use libcgroups::{CgroupSpecBuilder, Resources};

    fn sample_request(cgroup_root: &std::path::Path, fs_root: &std::path::Path) -> LaunchRequest {
        LaunchRequest {
            argv: vec!["/bin/true".into()],
            cgroup: CgroupSpecBuilder::new()
                .with_name("c1")
                .with_root(cgroup_root)
                .with_resources(Resources::default())
                .build()
                .unwrap(),
            namespace: NamespaceSpec {
                name: "n1".into(),
                typ: NamespaceType::Pid,
            },
            fs_root: fs_root.to_path_buf(),
            network: NetworkConfig {
                name: "br-test0".into(),
                cidr: Some("192.168.250.0/24".parse().unwrap()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_run_requires_root() {
        if nix::unistd::geteuid().is_root() {
            // The non-root gate cannot be exercised as root.
            return;
        }
        let cgroup_root = tempfile::tempdir().unwrap();
        let fs_root = tempfile::tempdir().unwrap();
        let request = sample_request(cgroup_root.path(), fs_root.path());

        let err = run(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        // The gate fires before any kernel mutation.
        assert!(!cgroup_root.path().join("c1").exists());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RunError::Permission.kind(), ErrorKind::Permission);
        assert_eq!(RunError::EmptyArgv.kind(), ErrorKind::InvalidSpec);
        assert_eq!(
            RunError::Network(NetworkError::InvalidConfig).kind(),
            ErrorKind::InvalidSpec
        );
        assert_eq!(
            RunError::Child(ProcessError::EmptyArgv).kind(),
            ErrorKind::InvalidSpec
        );
    }

    #[test]
    fn test_hostname_derives_from_cgroup_name() {
        let cgroup_root = tempfile::tempdir().unwrap();
        let fs_root = tempfile::tempdir().unwrap();
        let request = sample_request(cgroup_root.path(), fs_root.path());

        assert_eq!(container_hostname(&request), "c1");
    }
}
