//! Veth CIDR pool allocation.
//!
//! Each sandbox gets a /30 carved out of the machine-wide pool. The
//! reservation is persisted to a file inside the sandbox directory so it
//! survives process restarts, and is freed implicitly when the sandbox
//! directory is removed. Allocation is guarded by a machine-wide file lock so
//! concurrent run-subprocesses never hand out overlapping subnets.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use file_lock::{FileLock, FileOptions};
use ipnetwork::Ipv4Network;

use crate::{
    utils::{CIDR_LOCK_FILENAME, CIDR_RESERVATION_FILENAME, SANDBOXES_SUBDIR},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix length of every allocated subnet.
pub const RESERVATION_PREFIX: u8 = 30;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Allocator for per-sandbox point-to-point subnets.
#[derive(Debug, Clone)]
pub struct CidrPool {
    pool: Ipv4Network,
    work_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CidrPool {
    /// Creates an allocator over `pool` with reservations stored under `work_dir`.
    pub fn new(pool: Ipv4Network, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            work_dir: work_dir.into(),
        }
    }

    /// Returns the subnet reserved for `box_id`, allocating one if needed.
    ///
    /// An existing reservation file is always honored, even if the configured
    /// pool has since changed; that keeps a sandbox's addresses stable for its
    /// whole life.
    pub async fn reserve(&self, box_id: &str) -> BoxfleetResult<Ipv4Network> {
        let sandbox_dir = self.work_dir.join(SANDBOXES_SUBDIR).join(box_id);
        let reservation_path = sandbox_dir.join(CIDR_RESERVATION_FILENAME);

        if reservation_path.exists() {
            return read_reservation(&reservation_path);
        }

        if self.pool.prefix() > RESERVATION_PREFIX {
            return Err(BoxfleetError::InvalidMachineConfig(format!(
                "veth cidr pool {} is smaller than a /{}",
                self.pool, RESERVATION_PREFIX
            )));
        }

        let pool = self.pool;
        let work_dir = self.work_dir.clone();
        tokio::task::spawn_blocking(move || allocate_locked(pool, &work_dir, &reservation_path))
            .await?
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Allocates the first free /30 while holding the machine-wide lock file.
fn allocate_locked(
    pool: Ipv4Network,
    work_dir: &Path,
    reservation_path: &Path,
) -> BoxfleetResult<Ipv4Network> {
    let lock_path = work_dir.join(CIDR_LOCK_FILENAME);
    let options = FileOptions::new().write(true).create(true);
    let lock = FileLock::lock(lock_path.to_string_lossy().as_ref(), true, options)?;

    // Some other process may have written our reservation while we waited.
    if reservation_path.exists() {
        return read_reservation(reservation_path);
    }

    let used = used_cidrs(work_dir)?;
    let mut chosen = None;
    for candidate in subnets(pool, RESERVATION_PREFIX) {
        if !used.iter().any(|u| overlaps(*u, candidate)) {
            chosen = Some(candidate);
            break;
        }
    }

    let Some(subnet) = chosen else {
        return Err(BoxfleetError::CidrPoolExhausted(pool.to_string()));
    };

    std::fs::write(reservation_path, format!("{}\n", subnet))?;
    drop(lock);

    tracing::debug!("reserved {} at {}", subnet, reservation_path.display());
    Ok(subnet)
}

/// Collects every reservation currently on disk.
fn used_cidrs(work_dir: &Path) -> BoxfleetResult<Vec<Ipv4Network>> {
    let sandboxes_dir = work_dir.join(SANDBOXES_SUBDIR);
    let mut used = Vec::new();
    if !sandboxes_dir.exists() {
        return Ok(used);
    }

    for entry in std::fs::read_dir(&sandboxes_dir)? {
        let reservation = entry?.path().join(CIDR_RESERVATION_FILENAME);
        if !reservation.is_file() {
            continue;
        }
        match read_reservation(&reservation) {
            Ok(cidr) => used.push(cidr),
            Err(e) => {
                // A corrupt reservation must not unblock double allocation of
                // the rest of the pool, so surface it.
                tracing::error!("unreadable reservation {}: {}", reservation.display(), e);
                return Err(e);
            }
        }
    }

    Ok(used)
}

fn read_reservation(path: &Path) -> BoxfleetResult<Ipv4Network> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim().parse::<Ipv4Network>()?)
}

/// Iterates the aligned `/prefix` subnets of `pool`, in address order.
fn subnets(pool: Ipv4Network, prefix: u8) -> impl Iterator<Item = Ipv4Network> {
    let step = 1u64 << (32 - prefix);
    let start = u32::from(pool.network()) as u64;
    let end = start + pool.size() as u64;

    (start..end).step_by(step as usize).filter_map(move |bits| {
        Ipv4Network::new(Ipv4Addr::from(bits as u32), prefix).ok()
    })
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
