//! Kernel namespace handles.
//!
//! A [`Namespace`] is created by a short-lived helper child: the helper
//! unshares the requested namespace set, opens its own
//! `/proc/self/ns/<type>` and passes the descriptor back before exiting.
//! The retained descriptor keeps the namespace alive for the duration of
//! the container and permits entering it later.

use std::fmt::Display;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;

use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, sethostname};

use crate::channel::{fd_channel, ChannelError};
use crate::error::ErrorKind;
use crate::process::{container_fork, ForkError};

/// The ordinal values form the CLI contract:
/// 0=Pid, 1=Uts, 2=Ipc, 3=Net, 4=User, 5=Cgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceType {
    Pid = 0,
    Uts = 1,
    Ipc = 2,
    Net = 3,
    User = 4,
    Cgroup = 5,
}

impl NamespaceType {
    pub fn from_ordinal(value: i64) -> Option<NamespaceType> {
        match value {
            0 => Some(NamespaceType::Pid),
            1 => Some(NamespaceType::Uts),
            2 => Some(NamespaceType::Ipc),
            3 => Some(NamespaceType::Net),
            4 => Some(NamespaceType::User),
            5 => Some(NamespaceType::Cgroup),
            _ => None,
        }
    }

    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Name of the namespace link below `/proc/<pid>/ns/`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceType::Pid => "pid",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Net => "net",
            NamespaceType::User => "user",
            NamespaceType::Cgroup => "cgroup",
        }
    }
}

impl Display for NamespaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub name: String,
    pub typ: NamespaceType,
}

impl NamespaceSpec {
    /// The container always receives fresh UTS, PID, mount and network
    /// namespaces; the requested type is added on top. Both the helper child
    /// and the container child derive their flags here, so the two cannot
    /// drift apart.
    pub fn clone_flags(&self) -> CloneFlags {
        CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | self.typ.clone_flag()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NamespaceError {
    #[error("namespace channel failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to spawn namespace helper: {0}")]
    Fork(#[from] ForkError),
    #[error("namespace syscall failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("namespace descriptor already closed")]
    AlreadyClosed,
    #[error("failed to start shell in namespace: {0}")]
    Shell(#[source] std::io::Error),
    #[error("namespace shell exited with status {status}")]
    ShellExited { status: i32 },
}

impl NamespaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NamespaceError::Channel(_) | NamespaceError::Fork(_) | NamespaceError::Nix(_) => {
                ErrorKind::KernelIo
            }
            NamespaceError::AlreadyClosed => ErrorKind::Internal,
            NamespaceError::Shell(_) => ErrorKind::KernelIo,
            NamespaceError::ShellExited { .. } => ErrorKind::ChildFailed,
        }
    }
}

/// An owned handle onto a kernel namespace object.
pub struct Namespace {
    pub name: String,
    pub typ: NamespaceType,
    fd: Option<OwnedFd>,
}

impl Namespace {
    pub fn create(spec: &NamespaceSpec) -> Result<Namespace, NamespaceError> {
        let (sender, receiver) = fd_channel()?;
        let flags = spec.clone_flags();
        let typ = spec.typ;

        let helper = container_fork(move || -> Result<i32, NamespaceError> {
            unshare(flags)?;
            let ns_path = format!("/proc/self/ns/{}", typ.proc_name());
            let fd = nix::fcntl::open(
                ns_path.as_str(),
                nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_CLOEXEC,
                nix::sys::stat::Mode::empty(),
            )?;
            sender.send(fd)?;
            Ok(0)
        })?;

        // The parent's copy of the sender was dropped when the helper
        // closure was discarded, so a helper dying before the send shows up
        // as a broken channel instead of a hang.
        let fd = receiver.recv();
        let _ = waitpid(helper, None);
        let fd = fd?;

        tracing::debug!(name = %spec.name, typ = %spec.typ, "created namespace");
        Ok(Namespace {
            name: spec.name.clone(),
            typ: spec.typ,
            fd: Some(fd),
        })
    }

    /// Debug aid: redirects the namespace descriptor onto stdin and spawns
    /// an interactive shell. The launch path never calls this; the container
    /// child carries its own clone flags.
    pub fn enter(&self) -> Result<(), NamespaceError> {
        let fd = self.fd.as_ref().ok_or(NamespaceError::AlreadyClosed)?;
        dup2(fd.as_raw_fd(), libc::STDIN_FILENO)?;

        let status = Command::new("/bin/sh")
            .arg("-i")
            .status()
            .map_err(NamespaceError::Shell)?;
        if !status.success() {
            return Err(NamespaceError::ShellExited {
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Releases the descriptor. A second close is an error.
    pub fn close(&mut self) -> Result<(), NamespaceError> {
        match self.fd.take() {
            Some(fd) => {
                drop(fd);
                Ok(())
            }
            None => Err(NamespaceError::AlreadyClosed),
        }
    }
}

/// Sets the hostname of the current UTS namespace. Direct syscall; shelling
/// out would leave the UTS namespace the shell runs in ambiguous.
pub fn set_hostname(hostname: &str) -> Result<(), NamespaceError> {
    sethostname(hostname)?;
    Ok(())
}
