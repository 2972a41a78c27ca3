use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::utils::parse_seconds;

#[derive(Parser)]
#[command(name = "scanout")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_value_name = "SUBCOMMAND")]
#[command(subcommand_help_heading = "Subcommands")]
pub struct Cli {
    /// Path to config file (default: `$XDG_CONFIG_HOME/scanout/config.kdl`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub subcommand: Option<Sub>,
}

#[derive(Subcommand)]
pub enum Sub {
    /// Light up every connected output and animate a test pattern (the default).
    Run(RunArgs),
    /// List the outputs without changing what is on screen.
    Outputs {
        /// Print JSON instead of human-readable text.
        #[arg(short, long)]
        json: bool,
    },
    /// Validate the config file.
    Validate,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Draw a bouncing cursor on the cursor plane, or in software without one.
    #[arg(long)]
    pub cursor: bool,
    /// Load a power-curve gamma ramp with this exponent.
    #[arg(long, value_name = "EXPONENT")]
    pub gamma: Option<f64>,
    /// Switch all outputs off and back on every SECS seconds.
    #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
    pub dpms_cycle: Option<Duration>,
}
