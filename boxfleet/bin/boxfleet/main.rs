mod handlers;

use boxfleet::{
    cli::{BoxfleetArgs, BoxfleetSubcommand, MachineSubcommand, SandboxSubcommand},
    BoxfleetResult,
};
use clap::{CommandFactory, Parser};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> BoxfleetResult<()> {
    let args = BoxfleetArgs::parse();

    // RUST_LOG wins; --verbose only raises the default.
    let default_directives = if args.verbose { "debug" } else { "info" };
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .init();

    match args.subcommand {
        Some(BoxfleetSubcommand::Machine { subcommand }) => match subcommand {
            MachineSubcommand::Start {
                config,
                machine_id,
                work_dir,
                cidr_pool,
                infra_image,
                boxes_file,
            } => {
                handlers::machine_start_subcommand(
                    config,
                    machine_id,
                    work_dir,
                    cidr_pool,
                    infra_image,
                    boxes_file,
                )
                .await?;
            }
        },
        Some(BoxfleetSubcommand::Sandbox { subcommand }) => match subcommand {
            SandboxSubcommand::Run { box_id, config } => {
                handlers::sandbox_run_subcommand(box_id, config).await?;
            }
            SandboxSubcommand::Stop { box_id, config } => {
                handlers::sandbox_stop_subcommand(box_id, config).await?;
            }
            SandboxSubcommand::Remove { box_id, config } => {
                handlers::sandbox_remove_subcommand(box_id, config).await?;
            }
            SandboxSubcommand::List { config } => {
                handlers::sandbox_list_subcommand(config).await?;
            }
            SandboxSubcommand::Exec {
                box_id,
                config,
                command,
            } => {
                let code = handlers::sandbox_exec_subcommand(box_id, config, command).await?;
                std::process::exit(code);
            }
        },
        None => {
            BoxfleetArgs::command().print_help()?;
        }
    }

    Ok(())
}
