#[macro_use]
extern crate tracing;

pub mod backend;
pub mod cli;
pub mod ipc;
pub mod kms;
pub mod state;
pub mod utils;
