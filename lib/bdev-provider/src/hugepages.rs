// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reclamation of hugepage files and PCI lockfiles left behind by
//! processes that used the acceleration library and then went away.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bdev_types::{PciAddress, PciAddressSet};
use slog::{debug, info, Logger};
use thiserror::Error;

/// Prefix of hugepage backing files created by the acceleration library.
pub const HUGEPAGE_PREFIX: &str = "spdk_";

/// Prefix of per-device lockfiles; the PCI address follows.
pub const LOCKFILE_PREFIX: &str = "spdk_pci_lock_";

#[derive(Debug, Error)]
pub enum HugepageError {
    #[error("walking {}: {source}", .path.display())]
    Walk { path: PathBuf, source: io::Error },

    #[error("removing {}: {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },
}

/// Owner pid encoded in a hugepage file name, `<prefix>pid<N>map<...>`.
fn hugepage_owner(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix("pid")?;
    let digits = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits == 0 || !rest[digits..].starts_with("map") {
        return None;
    }
    rest[..digits].parse().ok()
}

/// Liveness probe through procfs.
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Removes hugepage files in `dir` whose owning process no longer exists.
///
/// Only the top level of `dir` is examined. Returns the number of files
/// removed; failing to stat an entry aborts the walk.
pub fn clean_hugepages<F>(
    log: &Logger,
    dir: &Path,
    prefix: &str,
    is_alive: F,
) -> Result<usize, HugepageError>
where
    F: Fn(u32) -> bool,
{
    let walk_err =
        |path: &Path, source| HugepageError::Walk { path: path.into(), source };

    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(|e| walk_err(dir, e))? {
        let entry = entry.map_err(|e| walk_err(dir, e))?;
        let path = entry.path();
        let ftype = entry.file_type().map_err(|e| walk_err(&path, e))?;
        if ftype.is_dir() {
            continue;
        }
        let Some(pid) =
            entry.file_name().to_str().and_then(|n| hugepage_owner(n, prefix))
        else {
            continue;
        };
        if is_alive(pid) {
            continue;
        }

        debug!(log, "removing orphaned hugepage file";
            "path" => %path.display(), "pid" => pid);
        fs::remove_file(&path)
            .map_err(|source| HugepageError::Remove { path, source })?;
        removed += 1;
    }

    if removed > 0 {
        info!(log, "reclaimed hugepages";
            "dir" => %dir.display(), "count" => removed);
    }
    Ok(removed)
}

#[derive(Debug, Error)]
#[error("failed to remove lockfiles: {}", .0.join("; "))]
pub struct LockfileError(pub Vec<String>);

pub fn lockfile_path(dir: &Path, addr: &PciAddress) -> PathBuf {
    dir.join(format!("{LOCKFILE_PREFIX}{addr}"))
}

/// Removes the lockfiles of `addrs` that `owned` confirms belong to the
/// caller.
///
/// Paths actually removed are always returned, along with an aggregate of
/// any removal failures. Lockfiles already gone are not failures.
pub fn clean_lockfiles<F>(
    log: &Logger,
    dir: &Path,
    addrs: &PciAddressSet,
    owned: F,
) -> (Vec<PathBuf>, Result<(), LockfileError>)
where
    F: Fn(&PciAddress) -> bool,
{
    let mut removed = Vec::new();
    let mut failures = Vec::new();

    for addr in addrs.iter().filter(|a| owned(a)) {
        let path = lockfile_path(dir, addr);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(log, "removed lockfile"; "path" => %path.display());
                removed.push(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("{}: {e}", path.display())),
        }
    }

    let res =
        if failures.is_empty() { Ok(()) } else { Err(LockfileError(failures)) };
    (removed, res)
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn owner_from_name() {
        assert_eq!(
            hugepage_owner("spdk_pid111map_a", HUGEPAGE_PREFIX),
            Some(111)
        );
        assert_eq!(hugepage_owner("spdk_pid7map", HUGEPAGE_PREFIX), Some(7));
        assert_eq!(hugepage_owner("spdk_pidmap_0", HUGEPAGE_PREFIX), None);
        assert_eq!(hugepage_owner("spdk_pid12", HUGEPAGE_PREFIX), None);
        assert_eq!(hugepage_owner("spdk_pid12x_0", HUGEPAGE_PREFIX), None);
        assert_eq!(hugepage_owner("rtemap_0", HUGEPAGE_PREFIX), None);
    }

    #[test]
    fn removes_only_dead_owners() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("spdk_pid111map_a"));
        touch(&dir.path().join("spdk_pid222map_b"));
        touch(&dir.path().join("unrelated"));
        fs::create_dir(dir.path().join("spdk_pid333map_sub")).unwrap();
        touch(&dir.path().join("spdk_pid333map_sub").join("spdk_pid444map_c"));

        let alive = |pid: u32| pid == 111;
        let removed =
            clean_hugepages(&log(), dir.path(), HUGEPAGE_PREFIX, alive);
        assert_eq!(removed.unwrap(), 1);
        assert!(dir.path().join("spdk_pid111map_a").exists());
        assert!(!dir.path().join("spdk_pid222map_b").exists());
        assert!(dir.path().join("unrelated").exists());
        assert!(dir
            .path()
            .join("spdk_pid333map_sub")
            .join("spdk_pid444map_c")
            .exists());
    }

    #[test]
    fn missing_dir_fails_walk() {
        let dir = tempfile::tempdir().unwrap();
        let res = clean_hugepages(
            &log(),
            &dir.path().join("nope"),
            HUGEPAGE_PREFIX,
            |_| false,
        );
        assert!(matches!(res, Err(HugepageError::Walk { .. })));
    }

    #[test]
    fn lockfiles_removed_for_owned_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let addrs: PciAddressSet =
            "0000:81:00.0 0000:82:00.0 5d0505:01:00.0 0000:83:00.0"
                .parse()
                .unwrap();
        for addr in ["0000:81:00.0", "0000:82:00.0", "5d0505:01:00.0"] {
            touch(&dir.path().join(format!("{LOCKFILE_PREFIX}{addr}")));
        }
        let not_owned: PciAddress = "0000:82:00.0".parse().unwrap();

        let (removed, res) =
            clean_lockfiles(&log(), dir.path(), &addrs, |a| *a != not_owned);
        assert!(res.is_ok());
        assert_eq!(
            removed,
            [
                dir.path().join("spdk_pci_lock_0000:81:00.0"),
                dir.path().join("spdk_pci_lock_5d0505:01:00.0"),
            ]
        );
        assert!(lockfile_path(dir.path(), &not_owned).exists());
    }

    #[test]
    fn lockfile_failures_are_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        let addrs: PciAddressSet = "0000:81:00.0 0000:82:00.0".parse().unwrap();
        touch(&dir.path().join("spdk_pci_lock_0000:81:00.0"));
        // A directory in place of the lockfile cannot be unlinked.
        fs::create_dir(dir.path().join("spdk_pci_lock_0000:82:00.0")).unwrap();

        let (removed, res) =
            clean_lockfiles(&log(), dir.path(), &addrs, |_| true);
        assert_eq!(removed.len(), 1);
        let err = res.unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert!(err.to_string().contains("spdk_pci_lock_0000:82:00.0"));
    }
}
