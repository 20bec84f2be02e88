mod cli;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use striper_rs::geometry::calc;

use crate::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::LogicalToPhysical(args) => {
            let params = args.geometry.to_params()?;
            debug!(lba = args.lba, "translating logical address");
            let addr = calc::logical_to_physical(&params, args.lba)?;
            println!("pba: 0x{:x}", addr.pba);
            println!("data_pos: {}", addr.data_pos);
            match addr.drives {
                [Some(primary), Some(mirror)] => {
                    println!("drives: {primary} (primary), {mirror} (mirror)");
                }
                [Some(primary), None] => println!("drive: {primary}"),
                _ => {}
            }
        }
        Command::PhysicalToLogical(args) => {
            let params = args.geometry.to_params()?;
            debug!(pba = args.pba, position = args.position, "translating member address");
            let lba = calc::physical_to_logical(&params, args.pba, args.position)?;
            println!("lba: 0x{lba:x}");
        }
    }
    Ok(())
}
