//! Turns Linux kernel network namespace identifiers into filesystem
//! references and pins resolved namespaces open.
//!
//! Resolution scans processes first and bind-mounted namespaces second; a
//! resolved namespace is then pinned by holding an open file descriptor on
//! it, which keeps the kernel from destroying the namespace even when the
//! last member process exits.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use crate::error::CaptureError;
use crate::types::Target;

/// Returns a filesystem reference to the network namespace with the given
/// inode number, or `None` when neither a process nor a bind mount refers to
/// it (the target has vanished).
pub fn netns_path(netns: u64, proc_root: &Path) -> Option<PathBuf> {
    // First search the processes for a suitable netns filesystem reference.
    // Individual threads of a process might live in a different network
    // namespace; that detail is ignored here.
    match std::fs::read_dir(proc_root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    continue;
                }
                let candidate = entry.path().join("ns/net");
                let Ok(stat) = nix::sys::stat::stat(&candidate) else {
                    continue;
                };
                if stat.st_ino == netns {
                    return Some(candidate);
                }
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "cannot enumerate processes");
        }
    }
    // Then search bind-mounted network namespaces for a match.
    if let Ok(mounts) = procfs::process::Process::myself().and_then(|p| p.mountinfo()) {
        for mount in mounts.into_iter().filter(|m| m.fs_type == "nsfs") {
            let Ok(stat) = nix::sys::stat::stat(&mount.mount_point) else {
                continue;
            };
            if stat.st_ino == netns {
                return Some(mount.mount_point);
            }
        }
    }
    None
}

/// Reads the start time (in clock ticks) of the given process from its proc
/// stat record.
pub fn proc_start_time(proc_root: &Path, pid: i32) -> std::io::Result<i64> {
    let line = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat"))?;
    parse_stat_start_time(&line).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed stat record for pid {pid}"),
        )
    })
}

/// Extracts field #22 (start time, 1-indexed) from a proc stat line.
///
/// The second field is the executable name wrapped in parentheses and it may
/// contain both spaces and `)` itself, so fields are only counted after the
/// last `)`. Lines without any `)` are malformed and rejected.
fn parse_stat_start_time(line: &str) -> Option<i64> {
    let after_comm = &line[line.rfind(')')? + 1..];
    // The remainder starts at field #3 (process state).
    after_comm
        .split_ascii_whitespace()
        .nth(22 - 3)?
        .parse()
        .ok()
}

/// A network namespace pinned open and validated against the caller's
/// freshness proof.
///
/// While a `NetnsPin` is alive the kernel keeps the namespace alive, even if
/// all its member processes exit in the meantime. Dropping the pin releases
/// the namespace again.
#[derive(Debug)]
pub struct NetnsPin {
    fd: OwnedFd,
    inode: u64,
}

impl NetnsPin {
    /// Opens and pins the namespace at `path`, cross-checking it against the
    /// target description: the opened file must carry the requested inode,
    /// and when the target supplies a `(pid, start time)` witness, that
    /// process must still exist with exactly that start time.
    pub fn open(target: &Target, path: &Path, proc_root: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path)
            .map_err(|err| CaptureError::Stale(format!("cannot open {}: {err}", path.display())))?;
        let stat = nix::sys::stat::fstat(file.as_raw_fd())
            .map_err(|err| CaptureError::Stale(format!("cannot stat {}: {err}", path.display())))?;
        if stat.st_ino != target.netns {
            return Err(CaptureError::Stale(format!(
                "netns:[{}] expected, found netns:[{}]",
                target.netns, stat.st_ino
            )));
        }
        if target.pid > 0 && target.start_time > 0 {
            match proc_start_time(proc_root, target.pid) {
                Ok(start_time) if start_time == target.start_time => {}
                Ok(start_time) => {
                    return Err(CaptureError::Stale(format!(
                        "pid {} start time changed from {} to {}",
                        target.pid, target.start_time, start_time
                    )));
                }
                Err(err) => {
                    return Err(CaptureError::Stale(format!(
                        "cannot verify pid {}: {err}",
                        target.pid
                    )));
                }
            }
        }
        Ok(Self {
            fd: file.into(),
            inode: target.netns,
        })
    }

    /// Inode of the pinned namespace.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Duplicates the pinning descriptor, for handing over to the spawn
    /// thread while the pin itself stays with the session.
    pub fn dup_fd(&self) -> std::io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}
