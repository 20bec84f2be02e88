use clap::{Args, Parser, Subcommand, ValueEnum};

use striper_rs::geometry::{RaidParams, RaidType};

#[derive(Parser)]
#[command(author, version, about = "RAID geometry calculator for striped groups")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Map a logical block address to its member placement.
    LogicalToPhysical(LogicalToPhysicalArgs),

    /// Map a member block address back to its logical address.
    PhysicalToLogical(PhysicalToLogicalArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RaidMode {
    Raid0,
    Raid10,
}

impl From<RaidMode> for RaidType {
    fn from(mode: RaidMode) -> Self {
        match mode {
            RaidMode::Raid0 => Self::Raid0,
            RaidMode::Raid10 => Self::Raid10,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GeometryArgs {
    #[arg(long, value_enum, env = "STRIPER_RAID", default_value_t = RaidMode::Raid0)]
    pub raid: RaidMode,

    /// Striped data positions (mirror pairs count as one for RAID-10).
    #[arg(long, env = "STRIPER_WIDTH", default_value_t = 4)]
    pub width: usize,

    /// Blocks per stripe element.
    #[arg(long, env = "STRIPER_ELEMENT_SIZE", default_value_t = 128)]
    pub element_size: u64,

    /// Alignment unit in blocks.
    #[arg(long, env = "STRIPER_OPTIMAL_BLOCK_SIZE", default_value_t = 8)]
    pub optimal_block_size: u64,

    /// Per-member capacity in blocks.
    #[arg(long, env = "STRIPER_DISK_CAPACITY", default_value_t = 0x1000_0000)]
    pub disk_capacity: u64,
}

impl GeometryArgs {
    /// # Errors
    /// Returns an error for an invalid width/raid-type combination.
    pub fn to_params(&self) -> anyhow::Result<RaidParams> {
        RaidParams::new(
            self.raid.into(),
            self.width,
            self.element_size,
            self.optimal_block_size,
            self.disk_capacity,
        )
    }
}

#[derive(Args)]
pub struct LogicalToPhysicalArgs {
    #[command(flatten)]
    pub geometry: GeometryArgs,

    /// Logical block address to translate.
    #[arg(long)]
    pub lba: u64,
}

#[derive(Args)]
pub struct PhysicalToLogicalArgs {
    #[command(flatten)]
    pub geometry: GeometryArgs,

    /// Member block address to translate.
    #[arg(long)]
    pub pba: u64,

    /// Striped data position the address lives on.
    #[arg(long)]
    pub position: usize,
}
