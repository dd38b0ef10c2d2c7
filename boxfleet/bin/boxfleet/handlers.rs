use std::path::PathBuf;

use boxfleet::{
    cli::AnsiStyles,
    config::{MachineConfig, DEFAULT_MACHINE_CONFIG_FILENAME, DEFAULT_WORK_DIR},
    container::ContainerStatus,
    management::{machine, sandbox},
    BoxfleetError, BoxfleetResult,
};
use ipnetwork::Ipv4Network;

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn machine_start_subcommand(
    config: Option<PathBuf>,
    machine_id: Option<String>,
    work_dir: Option<PathBuf>,
    cidr_pool: Option<Ipv4Network>,
    infra_image: Option<String>,
    boxes_file: Option<PathBuf>,
) -> BoxfleetResult<()> {
    let base = match &config {
        Some(path) => MachineConfig::load(path).await?,
        None => {
            let machine_id = machine_id.clone().ok_or_else(|| {
                BoxfleetError::InvalidMachineConfig(
                    "--machine-id is required when no --config file is given".to_string(),
                )
            })?;
            MachineConfig::builder().machine_id(machine_id).build()
        }
    };

    let config = base.with_overrides(machine_id, work_dir, cidr_pool, infra_image, boxes_file);
    machine::start(config).await
}

pub async fn sandbox_run_subcommand(box_id: String, config: Option<PathBuf>) -> BoxfleetResult<()> {
    let config = resolve_config(config).await?;
    sandbox::run(&config, &box_id).await
}

pub async fn sandbox_stop_subcommand(
    box_id: String,
    config: Option<PathBuf>,
) -> BoxfleetResult<()> {
    let config = resolve_config(config).await?;
    sandbox::stop(&config, &box_id).await
}

pub async fn sandbox_remove_subcommand(
    box_id: String,
    config: Option<PathBuf>,
) -> BoxfleetResult<()> {
    let config = resolve_config(config).await?;
    sandbox::remove(&config, &box_id).await
}

pub async fn sandbox_list_subcommand(config: Option<PathBuf>) -> BoxfleetResult<()> {
    let config = resolve_config(config).await?;
    let listings = sandbox::list(&config).await?;

    if listings.is_empty() {
        println!("no sandboxes on this machine");
        return Ok(());
    }

    println!(
        "{} {} {} {}",
        format!("{:<24}", "BOX").header(),
        format!("{:<12}", "STATUS").header(),
        format!("{:<8}", "RUNNER").header(),
        "CIDR".header()
    );
    for listing in listings {
        let status_cell = format!("{:<12}", listing.get_status());
        let status_cell = match listing.get_status() {
            ContainerStatus::Running => status_cell.valid(),
            ContainerStatus::Other(_) => status_cell.invalid(),
            _ => status_cell,
        };

        println!(
            "{:<24} {} {:<8} {}",
            listing.get_box_id(),
            status_cell,
            if listing.get_runner_alive() { "yes" } else { "no" },
            listing
                .get_cidr()
                .map(|cidr| cidr.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}

pub async fn sandbox_exec_subcommand(
    box_id: String,
    config: Option<PathBuf>,
    command: Vec<String>,
) -> BoxfleetResult<i32> {
    let config = resolve_config(config).await?;
    sandbox::exec(&config, &box_id, &command).await
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Resolves the machine configuration the sandbox subcommands operate under.
///
/// Defaults to the file the machine daemon persists in its work directory,
/// so the subprocesses it spawns and manual invocations agree on settings.
async fn resolve_config(config: Option<PathBuf>) -> BoxfleetResult<MachineConfig> {
    let path =
        config.unwrap_or_else(|| DEFAULT_WORK_DIR.join(DEFAULT_MACHINE_CONFIG_FILENAME));

    if !path.is_file() {
        return Err(BoxfleetError::InvalidMachineConfig(format!(
            "no machine configuration at {}; start the machine daemon or pass --config",
            path.display()
        )));
    }

    MachineConfig::load(path).await
}
