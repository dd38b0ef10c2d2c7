//! Named network namespace creation, entry and removal.
//!
//! Namespaces are pinned as files under `/run/netns` so they outlive the
//! process that created them and can be joined by the OCI runtime via path.
//! Entering a namespace changes kernel state that is local to the calling OS
//! thread, so every namespace-sensitive step here runs on its own dedicated
//! thread: creation threads are discarded afterwards (their switch is
//! permanent), entry threads restore the host namespace on every exit path
//! before finishing.

use std::{
    fs::File,
    path::PathBuf,
    thread,
};

use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{setns, unshare, CloneFlags},
};

use crate::{
    utils::{self, netns_path, NETNS_RUN_DIR},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An open handle to a named network namespace.
#[derive(Debug)]
pub struct NetnsHandle {
    name: String,
    file: File,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetnsHandle {
    /// Opens the named namespace if it exists.
    pub fn open(name: &str) -> BoxfleetResult<Option<Self>> {
        match File::open(netns_path(name)) {
            Ok(file) => Ok(Some(Self {
                name: name.to_string(),
                file,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Looks the namespace up by name, creating and pinning it if absent, and
    /// brings its loopback interface up.
    pub async fn ensure(name: &str) -> BoxfleetResult<Self> {
        let handle = match Self::open(name)? {
            Some(handle) => {
                tracing::debug!("reusing existing namespace {}", name);
                handle
            }
            None => {
                create_namespace(name.to_string()).await?;
                tracing::info!("created network namespace {}", name);
                Self::open(name)?.ok_or_else(|| {
                    BoxfleetError::custom(anyhow::anyhow!(
                        "namespace {name} missing right after creation"
                    ))
                })?
            }
        };

        utils::run("ip", &["-n", name, "link", "set", "lo", "up"]).await?;
        Ok(handle)
    }

    /// Removes the named namespace. Absent namespaces count as already clean.
    pub async fn remove(name: &str) -> BoxfleetResult<()> {
        let path = netns_path(name);

        match umount2(&path, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            // ENOENT: never pinned; EINVAL: file exists but nothing mounted.
            Err(Errno::ENOENT) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(e.into()),
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("removed network namespace {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pinned namespace file path, as the OCI runtime consumes it.
    pub fn path(&self) -> PathBuf {
        netns_path(&self.name)
    }

    /// Runs `f` on a dedicated OS thread that has entered this namespace.
    ///
    /// The thread switches into the namespace, runs the closure, and restores
    /// the host namespace before it finishes, on every exit path including a
    /// panic in `f`. Each call gets its own thread; the scoped switch is never
    /// shared across concurrent operations.
    pub async fn enter<T, F>(&self, f: F) -> BoxfleetResult<T>
    where
        F: FnOnce() -> BoxfleetResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ns_file = self.file.try_clone()?;
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || {
            let handle = thread::Builder::new()
                .name(format!("netns-{}", name))
                .spawn(move || enter_scoped(ns_file, f))?;

            handle
                .join()
                .map_err(|_| BoxfleetError::custom(anyhow::anyhow!("namespace thread panicked")))?
        })
        .await?
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates and pins a new network namespace without altering the calling
/// thread's namespace: a fresh thread unshares its own network namespace,
/// bind-mounts it onto the pin file, and is then discarded.
async fn create_namespace(name: String) -> BoxfleetResult<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(NETNS_RUN_DIR)?;
        let pin_path = netns_path(&name);
        File::create(&pin_path)?;

        let handle = thread::Builder::new()
            .name(format!("netns-create-{}", name))
            .spawn(move || -> BoxfleetResult<()> {
                unshare(CloneFlags::CLONE_NEWNET)?;

                // /proc/thread-self resolves to this thread, which now sits in
                // the new namespace.
                mount(
                    Some("/proc/thread-self/ns/net"),
                    &pin_path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )?;

                Ok(())
            })?;

        handle
            .join()
            .map_err(|_| BoxfleetError::custom(anyhow::anyhow!("namespace thread panicked")))?
    })
    .await?
}

/// Body of a scoped namespace entry thread.
fn enter_scoped<T>(ns_file: File, f: impl FnOnce() -> BoxfleetResult<T>) -> BoxfleetResult<T> {
    let host_ns = File::open("/proc/thread-self/ns/net")?;

    setns(&ns_file, CloneFlags::CLONE_NEWNET)?;
    let _restore = scopeguard::guard(host_ns, |host_ns| {
        if let Err(e) = setns(&host_ns, CloneFlags::CLONE_NEWNET) {
            tracing::error!("failed to restore host namespace: {}", e);
        }
    });

    f()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_of_absent_namespace_is_clean() -> anyhow::Result<()> {
        NetnsHandle::remove("bx0000never0").await?;
        Ok(())
    }

    #[test]
    fn test_open_of_absent_namespace_returns_none() -> anyhow::Result<()> {
        assert!(NetnsHandle::open("bx0000never0")?.is_none());
        Ok(())
    }
}
