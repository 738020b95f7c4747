use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{self, WrappedIoError};

const MOUNTINFO: &str = "/proc/self/mountinfo";
const CGROUP_PATH_PREFIX: &str = "/sys/fs/cgroup/";

#[derive(thiserror::Error, Debug)]
pub enum MountPointError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("could not find mountpoint for subsystem {subsystem}")]
    NotFound { subsystem: String },
}

/// Returns the mountpoint of the cgroup hierarchy carrying `subsystem`.
pub fn find_mountpoint(subsystem: &str) -> Result<PathBuf, MountPointError> {
    let mountinfo = fs::read_to_string(MOUNTINFO).map_err(|err| WrappedIoError::Read {
        err,
        path: PathBuf::from(MOUNTINFO),
    })?;
    parse_mountpoint(&mountinfo, subsystem)
}

/// A line qualifies when its comma-separated options field (the fourth
/// space-separated token) lists the subsystem; the mountpoint is the fifth
/// token. First match wins.
fn parse_mountpoint(mountinfo: &str, subsystem: &str) -> Result<PathBuf, MountPointError> {
    for line in mountinfo.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 5 {
            continue;
        }

        if fields[3].split(',').any(|opt| opt == subsystem) {
            return Ok(PathBuf::from(fields[4]));
        }
    }

    Err(MountPointError::NotFound {
        subsystem: subsystem.to_owned(),
    })
}

#[derive(thiserror::Error, Debug)]
pub enum ParamError {
    #[error("invalid cgroup path {path}")]
    InvalidPath { path: PathBuf },
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
}

/// Firewall for parameter access: only paths below the canonical cgroup
/// mount are ever touched, no matter what the caller assembled.
fn ensure_cgroup_path(path: &Path) -> Result<(), ParamError> {
    if !path.to_string_lossy().starts_with(CGROUP_PATH_PREFIX) {
        return Err(ParamError::InvalidPath {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Reads the value of a cgroup parameter, trimmed of trailing whitespace.
pub fn get_param(cgroup_path: &Path, param: &str) -> Result<String, ParamError> {
    ensure_cgroup_path(cgroup_path)?;

    let value = common::read_cgroup_file(cgroup_path.join(param))?;
    Ok(value.trim().to_owned())
}

/// Writes the value of a cgroup parameter.
pub fn set_param(cgroup_path: &Path, param: &str, value: &str) -> Result<(), ParamError> {
    ensure_cgroup_path(cgroup_path)?;

    common::write_cgroup_file_str(cgroup_path.join(param), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::set_fixture;

    const SAMPLE_MOUNTINFO: &str = "\
25 30 0:23 rw /sys rw,nosuid,nodev,noexec,relatime - sysfs sysfs rw
30 1 8:1 rw / rw,relatime - ext4 /dev/sda1 rw
34 25 0:29 rw,cpu,cpuacct /sys/fs/cgroup/cpu,cpuacct rw shared:15 - cgroup cgroup rw
35 25 0:30 rw,memory /sys/fs/cgroup/memory rw shared:16 - cgroup cgroup rw
36 25 0:31 rw,blkio /sys/fs/cgroup/blkio rw shared:17 - cgroup cgroup rw
malformed line";

    #[test]
    fn test_parse_mountpoint_matches_option() {
        let mountpoint = parse_mountpoint(SAMPLE_MOUNTINFO, "memory").expect("find memory");
        assert_eq!(mountpoint, PathBuf::from("/sys/fs/cgroup/memory"));
    }

    #[test]
    fn test_parse_mountpoint_comma_separated_options() {
        let mountpoint = parse_mountpoint(SAMPLE_MOUNTINFO, "cpuacct").expect("find cpuacct");
        assert_eq!(mountpoint, PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"));
    }

    #[test]
    fn test_parse_mountpoint_first_match_wins() {
        let doubled = format!(
            "{SAMPLE_MOUNTINFO}\n37 25 0:32 rw,memory /elsewhere rw shared:18 - cgroup cgroup rw"
        );
        let mountpoint = parse_mountpoint(&doubled, "memory").expect("find memory");
        assert_eq!(mountpoint, PathBuf::from("/sys/fs/cgroup/memory"));
    }

    #[test]
    fn test_parse_mountpoint_missing_subsystem() {
        let err = parse_mountpoint(SAMPLE_MOUNTINFO, "nonexistent").unwrap_err();
        assert!(matches!(err, MountPointError::NotFound { .. }));
    }

    #[test]
    fn test_set_param_rejects_foreign_path() {
        let tmp = tempfile::tempdir().unwrap();
        let target = set_fixture(tmp.path(), "passwd", "root:x:0:0").unwrap();

        let err = set_param(&target, "owner", "0:0").unwrap_err();
        assert!(matches!(err, ParamError::InvalidPath { .. }));
        // The firewall rejects before any I/O happens.
        assert_eq!(fs::read_to_string(&target).unwrap(), "root:x:0:0");
    }

    #[test]
    fn test_get_param_rejects_foreign_path() {
        let err = get_param(Path::new("/etc"), "passwd").unwrap_err();
        assert!(matches!(err, ParamError::InvalidPath { .. }));
    }

    #[test]
    fn test_prefix_must_match_exactly() {
        let err = get_param(Path::new("/sys/fs/cgroup-evil/x"), "tasks").unwrap_err();
        assert!(matches!(err, ParamError::InvalidPath { .. }));
    }
}
