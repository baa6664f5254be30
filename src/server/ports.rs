//! TCP port reservation
//!
//! Several IDE windows may launch sessions at once, each needing a block of
//! consecutive ports for its gdb-server. Reservations are advisory file
//! locks in a shared temp directory, so they exclude other processes and
//! evaporate if a process dies without cleanup. fcntl locks do not conflict
//! within one process, so an in-process claim set guards that case.

use crate::error::{EngineError, Result};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::net::TcpListener;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

static CLAIMED: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

fn lock_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("port-{}.lock", port))
}

#[cfg(unix)]
fn fcntl_lock(file: &File, lock: bool) -> bool {
    use std::os::unix::io::AsRawFd;
    let mut fl = libc::flock {
        l_type: if lock { libc::F_WRLCK } else { libc::F_UNLCK } as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    // Non-blocking: a held lock means the port belongs to someone else.
    unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) != -1 }
}

#[cfg(not(unix))]
fn fcntl_lock(_file: &File, _lock: bool) -> bool {
    true
}

/// A reserved port. Dropping it releases the lock and the claim.
#[derive(Debug)]
pub struct PortLock {
    file: File,
    port: u16,
}

impl PortLock {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        // The file stays behind. Unlinking it would let a later claimant
        // lock a fresh inode at the same path while another process still
        // holds the old one, and both would then own the port.
        fcntl_lock(&self.file, false);
        CLAIMED.lock().unwrap().remove(&self.port);
        debug!("released port {}", self.port);
    }
}

pub struct PortAllocator {
    lock_dir: PathBuf,
    range: Range<u16>,
}

impl PortAllocator {
    /// Allocator over the default gdb-server port range, locking in the
    /// shared temp directory.
    pub fn new(range: Range<u16>) -> Result<PortAllocator> {
        Self::with_lock_dir(std::env::temp_dir().join("mcudbg-ports"), range)
    }

    pub fn with_lock_dir(lock_dir: PathBuf, range: Range<u16>) -> Result<PortAllocator> {
        std::fs::create_dir_all(&lock_dir)?;
        Ok(PortAllocator { lock_dir, range })
    }

    /// Try to claim one port: in-process set, then the cross-process file
    /// lock, then an actual bind probe.
    fn try_claim(&self, port: u16) -> Option<PortLock> {
        {
            let mut claimed = CLAIMED.lock().unwrap();
            if !claimed.insert(port) {
                return None;
            }
        }
        let release_claim = || {
            CLAIMED.lock().unwrap().remove(&port);
        };

        let path = lock_path(&self.lock_dir, port);
        let file = match OpenOptions::new().read(true).write(true).create(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open {}: {}", path.display(), e);
                release_claim();
                return None;
            }
        };
        if !fcntl_lock(&file, true) {
            release_claim();
            return None;
        }

        // The lock file only coordinates cooperating engines; an unrelated
        // process may still own the port.
        if let Err(e) = TcpListener::bind(("127.0.0.1", port)) {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                fcntl_lock(&file, false);
                release_claim();
                return None;
            }
        }

        debug!("reserved port {}", port);
        Some(PortLock { file, port })
    }

    /// Reserve a single free port from the range.
    pub fn reserve(&self) -> Result<PortLock> {
        let mut block = self.reserve_consecutive(1)?;
        block.pop().ok_or_else(|| EngineError::StartupFailure {
            what: "port reservation".to_string(),
            reason: "empty reservation".to_string(),
        })
    }

    /// Reserve `count` consecutive ports.
    ///
    /// Scans increasing base ports; a conflict anywhere in a candidate block
    /// releases the partial block and resumes past the conflicting port.
    pub fn reserve_consecutive(&self, count: u16) -> Result<Vec<PortLock>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut base = self.range.start;
        while u32::from(base) + u32::from(count) <= u32::from(self.range.end) {
            let mut block = Vec::with_capacity(count as usize);
            let mut conflict = None;
            for port in base..base + count {
                match self.try_claim(port) {
                    Some(lock) => block.push(lock),
                    None => {
                        conflict = Some(port);
                        break;
                    }
                }
            }
            match conflict {
                None => return Ok(block),
                Some(port) => {
                    drop(block);
                    base = port + 1;
                }
            }
        }
        Err(EngineError::StartupFailure {
            what: "port reservation".to_string(),
            reason: format!(
                "no {} consecutive free ports in {}..{}",
                count, self.range.start, self.range.end
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(range: Range<u16>) -> PortAllocator {
        let dir = std::env::temp_dir().join(format!("mcudbg-ports-test-{}", range.start));
        PortAllocator::with_lock_dir(dir, range).unwrap()
    }

    #[test]
    fn consecutive_block_is_consecutive() {
        let alloc = allocator(43210..43230);
        let block = alloc.reserve_consecutive(4).unwrap();
        let ports: Vec<u16> = block.iter().map(PortLock::port).collect();
        assert_eq!(ports.len(), 4);
        for pair in ports.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn claimed_ports_are_skipped() {
        let alloc = allocator(43240..43260);
        let first = alloc.reserve().unwrap();
        let block = alloc.reserve_consecutive(3).unwrap();
        assert!(block.iter().all(|l| l.port() != first.port()));
    }

    #[test]
    fn dropping_a_lock_makes_the_port_reusable() {
        let alloc = allocator(43260..43262);
        let both = alloc.reserve_consecutive(2).unwrap();
        assert!(alloc.reserve().is_err());
        drop(both);
        let again = alloc.reserve_consecutive(2).unwrap();
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn exhaustion_reports_startup_failure() {
        let alloc = allocator(43270..43273);
        let err = alloc.reserve_consecutive(10).err().unwrap();
        assert!(matches!(err, EngineError::StartupFailure { .. }));
    }

    #[test]
    fn released_lock_files_stay_behind() {
        let dir = std::env::temp_dir().join("mcudbg-ports-test-43290");
        let alloc = PortAllocator::with_lock_dir(dir.clone(), 43290..43292).unwrap();
        let lock = alloc.reserve().unwrap();
        let port = lock.port();
        let path = lock_path(&dir, port);
        assert!(path.exists());
        drop(lock);
        // Releasing unlocks but never unlinks: a second claimant must lock
        // the same inode, not a replacement file at the same path.
        assert!(path.exists());
        assert_eq!(alloc.reserve().unwrap().port(), port);
    }

    #[test]
    fn contending_allocators_hand_out_disjoint_ports() {
        let dir = std::env::temp_dir().join("mcudbg-ports-test-contend");
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    // Wide range: racing block claims fragment the space.
                    let alloc = PortAllocator::with_lock_dir(dir, 43400..43500).unwrap();
                    (0..4)
                        .map(|_| alloc.reserve_consecutive(3).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        let mut held = Vec::new();
        for handle in handles {
            for block in handle.join().unwrap() {
                for lock in &block {
                    assert!(seen.insert(lock.port()), "port {} handed out twice", lock.port());
                }
                held.push(block);
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn partial_block_released_on_conflict() {
        let alloc = allocator(43280..43290);
        // Hold the middle of the range hostage.
        let middle = alloc.try_claim(43283).unwrap();
        let block = alloc.reserve_consecutive(4).unwrap();
        let ports: Vec<u16> = block.iter().map(PortLock::port).collect();
        assert_eq!(ports, vec![43284, 43285, 43286, 43287]);
        // The ports tried before the conflict are free again.
        drop(middle);
        assert_eq!(alloc.reserve().unwrap().port(), 43280);
    }
}
