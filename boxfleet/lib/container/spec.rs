//! Renders the OCI runtime configuration for a sandbox's container.

use std::{collections::HashSet, path::Path};

use oci_spec::runtime::{
    Capabilities, Capability, Linux, LinuxBuilder, LinuxCapabilities, LinuxCapabilitiesBuilder,
    LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, Mount, MountBuilder,
    PosixRlimitBuilder, PosixRlimitType, Process, ProcessBuilder, RootBuilder, Spec, SpecBuilder,
    UserBuilder,
};

use crate::{
    config::BoxSpec,
    image::ImageManifest,
    net::NamesAndAddrs,
    utils::{
        self, CONTAINERS_SUBDIR, LOG_SUBDIR, OCI_CONFIG_FILENAME, ROOTFS_SUBDIR, VOLUMES_SUBDIR,
    },
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The OCI runtime spec version written into generated configurations.
const SPEC_VERSION: &str = "1.0.2";

/// Parent path of per-sandbox cgroups.
const CGROUP_PARENT: &str = "boxfleet";

/// Where the sandbox's state directories appear inside the container.
const INNER_STATE_PREFIX: &str = "/var/lib/boxfleet";

/// Open file limit for the container process.
const NOFILE_LIMIT: u64 = 1_048_576;

/// PATH used when neither the image nor the box spec provides one.
const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the runtime configuration for one sandbox container.
///
/// The root filesystem, entrypoint and environment come from the staged
/// image; the box spec can override the command and extend the environment.
/// The container joins the sandbox's network namespace by path and gets a
/// fresh namespace of every other kind.
pub fn build_runtime_spec(
    sandbox_dir: &Path,
    names: &NamesAndAddrs,
    manifest: &ImageManifest,
    box_spec: &BoxSpec,
    box_id: &str,
) -> BoxfleetResult<Spec> {
    let args = resolve_args(manifest, box_spec);
    if args.is_empty() {
        return Err(BoxfleetError::custom(anyhow::anyhow!(
            "box {} has no command and its image has no entrypoint",
            box_id
        )));
    }

    let spec = SpecBuilder::default()
        .version(SPEC_VERSION)
        .hostname(container_hostname(box_id, names).to_string())
        .root(
            RootBuilder::default()
                .path(sandbox_dir.join(ROOTFS_SUBDIR))
                .readonly(false)
                .build()?,
        )
        .mounts(sandbox_mounts(sandbox_dir)?)
        .process(container_process(args, manifest, box_spec)?)
        .linux(sandbox_linux(names)?)
        .build()?;

    Ok(spec)
}

/// Writes the configuration into the sandbox's bundle directory.
pub async fn write_runtime_spec(bundle_dir: &Path, spec: &Spec) -> BoxfleetResult<()> {
    tokio::fs::create_dir_all(bundle_dir).await?;
    spec.save(bundle_dir.join(OCI_CONFIG_FILENAME))?;
    Ok(())
}

/// The box spec's command, or the image's entrypoint when none is given.
fn resolve_args(manifest: &ImageManifest, box_spec: &BoxSpec) -> Vec<String> {
    if box_spec.get_command().is_empty() {
        manifest.default_args()
    } else {
        box_spec.get_command().clone()
    }
}

/// Merges environment sources, earlier sources winning: box spec, then
/// image, then a default PATH.
fn resolve_env(manifest: &ImageManifest, box_spec: &BoxSpec) -> Vec<String> {
    let mut merged = Vec::new();
    let mut seen = HashSet::new();

    let box_vars = box_spec.get_envs().iter().map(|pair| pair.to_string());
    let image_vars = manifest.get_env().iter().cloned();
    let defaults = [DEFAULT_PATH_ENV.to_string()];

    for entry in box_vars.chain(image_vars).chain(defaults) {
        let var = entry
            .split_once('=')
            .map(|(var, _)| var)
            .unwrap_or(entry.as_str())
            .to_string();
        if seen.insert(var) {
            merged.push(entry);
        }
    }

    merged
}

fn container_process(
    args: Vec<String>,
    manifest: &ImageManifest,
    box_spec: &BoxSpec,
) -> BoxfleetResult<Process> {
    let cwd = manifest
        .get_working_dir()
        .as_deref()
        .filter(|dir| !dir.is_empty())
        .unwrap_or("/");

    let process = ProcessBuilder::default()
        .terminal(false)
        .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
        .args(args)
        .env(resolve_env(manifest, box_spec))
        .cwd(cwd)
        .capabilities(privileged_capabilities()?)
        .rlimits(vec![PosixRlimitBuilder::default()
            .typ(PosixRlimitType::RlimitNofile)
            .hard(NOFILE_LIMIT)
            .soft(NOFILE_LIMIT)
            .build()?])
        .build()?;

    Ok(process)
}

fn sandbox_linux(names: &NamesAndAddrs) -> BoxfleetResult<Linux> {
    let linux = LinuxBuilder::default()
        .namespaces(sandbox_namespaces(names)?)
        .cgroups_path(format!("/{}/{}", CGROUP_PARENT, names.get_base()))
        .build()?;

    Ok(linux)
}

/// Fresh namespaces of every kind except network, which joins the sandbox's
/// pinned namespace by path.
fn sandbox_namespaces(names: &NamesAndAddrs) -> BoxfleetResult<Vec<LinuxNamespace>> {
    let mut namespaces = Vec::new();
    for typ in [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Cgroup,
    ] {
        namespaces.push(LinuxNamespaceBuilder::default().typ(typ).build()?);
    }
    namespaces.push(
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .path(utils::netns_path(names.get_namespace()))
            .build()?,
    );

    Ok(namespaces)
}

/// The fixed kernel filesystems plus the sandbox's bind-mounted state
/// directories.
fn sandbox_mounts(sandbox_dir: &Path) -> BoxfleetResult<Vec<Mount>> {
    let mut mounts = vec![
        fs_mount("/proc", "proc", "proc", &[])?,
        fs_mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev"])?,
        fs_mount("/dev", "devtmpfs", "devtmpfs", &["nosuid", "mode=755"])?,
        fs_mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        )?,
        fs_mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        fs_mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        fs_mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime"],
        )?,
    ];

    for subdir in [CONTAINERS_SUBDIR, LOG_SUBDIR, VOLUMES_SUBDIR] {
        let mount = MountBuilder::default()
            .destination(format!("{}/{}", INNER_STATE_PREFIX, subdir))
            .typ("bind")
            .source(sandbox_dir.join(subdir))
            .options(vec!["rbind".to_string(), "rw".to_string()])
            .build()?;
        mounts.push(mount);
    }

    Ok(mounts)
}

fn fs_mount(
    destination: &str,
    typ: &str,
    source: &str,
    options: &[&str],
) -> BoxfleetResult<Mount> {
    let mount = MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()?;

    Ok(mount)
}

/// Capabilities broad enough for the container to run its own nested
/// container runtime.
fn privileged_capabilities() -> BoxfleetResult<LinuxCapabilities> {
    let caps: Capabilities = [
        Capability::AuditWrite,
        Capability::Chown,
        Capability::DacOverride,
        Capability::Fowner,
        Capability::Fsetid,
        Capability::Kill,
        Capability::Mknod,
        Capability::NetAdmin,
        Capability::NetBindService,
        Capability::NetRaw,
        Capability::Setfcap,
        Capability::Setgid,
        Capability::Setpcap,
        Capability::Setuid,
        Capability::SysAdmin,
        Capability::SysChroot,
        Capability::SysPtrace,
        Capability::SysResource,
    ]
    .into_iter()
    .collect::<HashSet<_>>()
    .into();

    let capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps)
        .build()?;

    Ok(capabilities)
}

/// Box ids that are valid hostnames are used directly; anything else falls
/// back to the derived base name.
fn container_hostname<'a>(box_id: &'a str, names: &'a NamesAndAddrs) -> &'a str {
    let valid = !box_id.is_empty()
        && !box_id.starts_with('-')
        && !box_id.starts_with('.')
        && box_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'));
    if valid {
        box_id
    } else {
        names.get_base()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::EnvPair;

    fn names() -> NamesAndAddrs {
        NamesAndAddrs::derive("web-1", "10.115.0.0/30".parse().unwrap()).unwrap()
    }

    fn manifest() -> ImageManifest {
        ImageManifest::builder()
            .entrypoint(vec!["/bin/app".to_string()])
            .cmd(vec!["--serve".to_string()])
            .env(vec!["APP_MODE=image".to_string(), "PATH=/opt/bin".to_string()])
            .working_dir(Some("/srv".to_string()))
            .build()
    }

    #[test]
    fn test_spec_layout() -> anyhow::Result<()> {
        let sandbox_dir = PathBuf::from("/work/sandboxes/web-1");
        let names = names();
        let spec = build_runtime_spec(
            &sandbox_dir,
            &names,
            &manifest(),
            &BoxSpec::default(),
            "web-1",
        )?;

        assert_eq!(spec.hostname().as_deref(), Some("web-1"));
        assert_eq!(
            spec.root().as_ref().unwrap().path(),
            &sandbox_dir.join(ROOTFS_SUBDIR)
        );

        let mounts = spec.mounts().as_ref().unwrap();
        let destinations: Vec<_> = mounts
            .iter()
            .map(|m| m.destination().to_string_lossy().to_string())
            .collect();
        for expected in [
            "/proc",
            "/sys",
            "/dev",
            "/dev/pts",
            "/dev/shm",
            "/dev/mqueue",
            "/sys/fs/cgroup",
            "/var/lib/boxfleet/containers",
            "/var/lib/boxfleet/logs",
            "/var/lib/boxfleet/volumes",
        ] {
            assert!(destinations.iter().any(|d| d == expected), "{}", expected);
        }

        Ok(())
    }

    #[test]
    fn test_network_namespace_joined_by_path() -> anyhow::Result<()> {
        let names = names();
        let spec = build_runtime_spec(
            &PathBuf::from("/work/sandboxes/web-1"),
            &names,
            &manifest(),
            &BoxSpec::default(),
            "web-1",
        )?;

        let linux = spec.linux().as_ref().unwrap();
        let namespaces = linux.namespaces().as_ref().unwrap();
        let network = namespaces
            .iter()
            .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Network))
            .unwrap();
        assert_eq!(
            network.path().as_ref().unwrap(),
            &utils::netns_path(names.get_namespace())
        );

        // Every other namespace is fresh.
        for ns in namespaces.iter() {
            if !matches!(ns.typ(), LinuxNamespaceType::Network) {
                assert!(ns.path().is_none());
            }
        }

        Ok(())
    }

    #[test]
    fn test_box_command_overrides_image_entrypoint() {
        let with_command = BoxSpec::builder()
            .command(vec!["/bin/other".to_string()])
            .build();
        assert_eq!(
            resolve_args(&manifest(), &with_command),
            vec!["/bin/other"]
        );
        assert_eq!(
            resolve_args(&manifest(), &BoxSpec::default()),
            vec!["/bin/app", "--serve"]
        );
    }

    #[test]
    fn test_no_runnable_command_is_an_error() {
        let result = build_runtime_spec(
            &PathBuf::from("/work/sandboxes/web-1"),
            &names(),
            &ImageManifest::default(),
            &BoxSpec::default(),
            "web-1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_env_precedence() {
        let box_spec = BoxSpec::builder()
            .envs(vec![EnvPair::new("APP_MODE", "box")])
            .build();
        let env = resolve_env(&manifest(), &box_spec);

        assert!(env.contains(&"APP_MODE=box".to_string()));
        assert!(!env.contains(&"APP_MODE=image".to_string()));
        // The image's PATH survives, the default does not get appended.
        assert!(env.contains(&"PATH=/opt/bin".to_string()));
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
    }

    #[test]
    fn test_default_path_when_absent() {
        let env = resolve_env(&ImageManifest::default(), &BoxSpec::default());
        assert_eq!(env, vec![DEFAULT_PATH_ENV.to_string()]);
    }

    #[test]
    fn test_working_dir_defaults_to_root() -> anyhow::Result<()> {
        let spec = build_runtime_spec(
            &PathBuf::from("/work/sandboxes/web-1"),
            &names(),
            &ImageManifest::builder()
                .entrypoint(vec!["/bin/app".to_string()])
                .build(),
            &BoxSpec::default(),
            "web-1",
        )?;

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.cwd(), &PathBuf::from("/"));
        Ok(())
    }

    #[test]
    fn test_capabilities_allow_inner_runtime() -> anyhow::Result<()> {
        let caps = privileged_capabilities()?;
        let effective = caps.effective().as_ref().unwrap();
        assert!(effective.contains(&Capability::SysAdmin));
        assert!(effective.contains(&Capability::NetAdmin));
        assert_eq!(caps.effective(), caps.bounding());
        Ok(())
    }

    #[test]
    fn test_invalid_hostname_falls_back_to_base() {
        let names = names();
        assert_eq!(container_hostname("web-1", &names), "web-1");
        assert_eq!(
            container_hostname("web_1!", &names),
            names.get_base().as_str()
        );
    }
}
