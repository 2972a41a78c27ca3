//! Configuration for the scanout daemon.
//!
//! The file is KDL, decoded with knuffel. Every section is optional; a missing file or an empty
//! one yields [`Config::default()`].

#[macro_use]
extern crate tracing;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use miette::{Context, IntoDiagnostic};

pub mod debug;
pub mod output;
mod utils;

pub use crate::debug::Debug;
pub use crate::output::{
    ConfiguredMode, HSyncPolarity, Mode, Modeline, Output, OutputName, Outputs, Position,
    VSyncPolarity,
};
pub use crate::utils::FloatOrInt;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(children(name = "output"))]
    pub outputs: Outputs,
    #[knuffel(child, default)]
    pub debug: Debug,
}

impl Config {
    /// Loads the config from `path`, falling back to the default config if the file is missing.
    pub fn load(path: &Path) -> miette::Result<Self> {
        let _span = tracy_client::span!("Config::load");

        if !path.exists() {
            debug!("config file {path:?} does not exist, using the default config");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("config.kdl");
        let config = Self::parse(filename, &contents).context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }
}

/// Where the config lives when no path is given on the command line.
pub fn default_config_path(config_dir: Option<PathBuf>) -> Option<PathBuf> {
    let mut path = config_dir?;
    path.push("config.kdl");
    Some(path)
}
