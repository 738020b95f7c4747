//! Helpers for tests that must not run in the shared test process, e.g.
//! because they mutate process-global state.

use nix::sys::wait::{waitpid, WaitStatus};

#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("failed to fork test process: {0}")]
    Fork(#[source] nix::Error),
    #[error("failed to wait for test process: {0}")]
    Wait(#[source] nix::Error),
    #[error("test callback failed in child process (exit status {status})")]
    Failed { status: i32 },
}

/// Runs `cb` isolated in a forked child; the test fails if the child exits
/// non-zero, is signaled, or panics.
pub fn test_in_child_process<F>(cb: F) -> Result<(), TestError>
where
    F: FnOnce() -> Result<(), String> + std::panic::UnwindSafe,
{
    match unsafe { nix::unistd::fork().map_err(TestError::Fork)? } {
        nix::unistd::ForkResult::Parent { child } => match waitpid(child, None)
            .map_err(TestError::Wait)?
        {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, status) => Err(TestError::Failed { status }),
            _ => Err(TestError::Failed { status: -1 }),
        },
        nix::unistd::ForkResult::Child => {
            let code = match std::panic::catch_unwind(cb) {
                Ok(Ok(())) => 0,
                Ok(Err(reason)) => {
                    eprintln!("test callback failed: {reason}");
                    1
                }
                Err(_) => {
                    eprintln!("test callback panicked");
                    2
                }
            };
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};

    use super::*;

    #[test]
    fn test_child_process_success() -> Result<()> {
        test_in_child_process(|| Ok(()))?;
        Ok(())
    }

    #[test]
    fn test_child_process_failure() -> Result<()> {
        if test_in_child_process(|| Err("expected error".to_string())).is_ok() {
            bail!("expecting the child process to return an error");
        }
        Ok(())
    }

    #[test]
    fn test_panic_child_process() -> Result<()> {
        let ret = test_in_child_process(|| {
            panic!("test panic");
        });
        if ret.is_ok() {
            bail!("expecting the child process to panic");
        }
        Ok(())
    }
}
