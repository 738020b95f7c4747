use std::ffi::CString;
use std::path::PathBuf;

use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, chdir, execvp, sethostname, Pid};

#[derive(thiserror::Error, Debug)]
pub enum ForkError {
    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),
}

// Execute the cb in another process. fork is used instead of clone so the
// callback can capture variables the ordinary way; a callback error exits
// the child with 255.
pub fn container_fork<F, E>(cb: F) -> Result<Pid, ForkError>
where
    F: FnOnce() -> Result<i32, E>,
    E: std::fmt::Display,
{
    match unsafe { unistd::fork().map_err(ForkError::Fork)? } {
        unistd::ForkResult::Parent { child } => Ok(child),
        unistd::ForkResult::Child => {
            let ret = match cb() {
                Err(error) => {
                    tracing::debug!("failed to run fork callback: {error}");
                    255
                }
                Ok(code) => code,
            };
            std::process::exit(ret);
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error("failed to wait for container process: {0}")]
    Wait(#[source] nix::Error),
    #[error("container argv must not be empty")]
    EmptyArgv,
    #[error("container argv contains an interior nul byte")]
    BadArgv(#[from] std::ffi::NulError),
    #[error("failed to read /proc: {0}")]
    Proc(#[from] procfs::ProcError),
    #[error("no init process found walking the parent chain")]
    InitNotFound,
}

/// Everything the container child carries: the program and its arguments,
/// the working directory inside the container root, the hostname for the
/// fresh UTS namespace and the clone-flag set derived from the namespace
/// spec.
#[derive(Clone, Debug)]
pub struct ChildConfig {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub hostname: String,
    pub clone_flags: CloneFlags,
}

#[derive(thiserror::Error, Debug)]
enum ChildError {
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Wait(ProcessError),
}

/// Spawns the container process tree.
///
/// An intermediate child dissociates from the parent namespaces and sets the
/// container hostname inside the fresh UTS namespace; it then forks the init
/// child, which enters the working directory and execs the requested
/// program. Unsharing CLONE_NEWPID only affects children of the caller,
/// which is why the extra fork exists: it makes init pid 1 of the new pid
/// namespace. The intermediate waits on init and exits with its status, so
/// waiting on the returned pid yields the container exit code. Stdio is
/// inherited through both forks.
pub fn spawn(config: ChildConfig) -> Result<Pid, ProcessError> {
    if config.argv.is_empty() {
        return Err(ProcessError::EmptyArgv);
    }
    let argv: Vec<CString> = config
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()?;

    let pid = container_fork(move || -> Result<i32, ChildError> {
        unshare(config.clone_flags)?;
        sethostname(&config.hostname)?;

        let init = container_fork(move || -> Result<i32, ChildError> {
            chdir(&config.cwd)?;
            execvp(&argv[0], &argv)?;
            Ok(0)
        })?;

        wait_for_exit(init).map_err(ChildError::Wait)
    })?;

    tracing::debug!(pid = pid.as_raw(), "spawned container process");
    Ok(pid)
}

/// Waits for `pid` and maps the result onto an exit code. A signaled child
/// reports 128+signo, following the shell convention.
pub fn wait_for_exit(pid: Pid) -> Result<i32, ProcessError> {
    loop {
        match waitpid(pid, None).map_err(ProcessError::Wait)? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
            _ => continue,
        }
    }
}

/// Walks the parent chain through `/proc/<pid>/stat` until pid 1, returning
/// the init process of the current process tree.
pub fn init_process() -> Result<Pid, ProcessError> {
    let mut pid = std::process::id() as i32;
    loop {
        let stat = procfs::process::Process::new(pid)?.stat()?;
        if stat.pid == 1 {
            return Ok(Pid::from_raw(stat.pid));
        }
        if stat.ppid == 0 {
            return Err(ProcessError::InitNotFound);
        }
        pid = stat.ppid;
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};

    use super::*;

    #[test]
    fn test_container_fork() -> Result<()> {
        let pid = container_fork(|| Ok::<_, std::io::Error>(0))?;
        match waitpid(pid, None).expect("wait pid failed") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 0);
                Ok(())
            }
            _ => bail!("test failed"),
        }
    }

    #[test]
    fn test_container_err_fork() -> Result<()> {
        let pid = container_fork(|| Err::<i32, _>(std::io::Error::other("callback failed")))?;
        match waitpid(pid, None).expect("wait pid failed") {
            WaitStatus::Exited(p, status) => {
                assert_eq!(pid, p);
                assert_eq!(status, 255);
                Ok(())
            }
            _ => bail!("test failed"),
        }
    }

    #[test]
    fn test_wait_for_exit_propagates_status() -> Result<()> {
        let pid = container_fork(|| Ok::<_, std::io::Error>(7))?;
        assert_eq!(wait_for_exit(pid)?, 7);
        Ok(())
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let err = spawn(ChildConfig {
            argv: vec![],
            cwd: PathBuf::from("/"),
            hostname: "c1".into(),
            clone_flags: CloneFlags::empty(),
        })
        .unwrap_err();
        assert!(matches!(err, ProcessError::EmptyArgv));
    }

    #[test]
    fn test_init_process_reaches_pid_one() -> Result<()> {
        let init = init_process()?;
        assert_eq!(init.as_raw(), 1);
        Ok(())
    }
}
