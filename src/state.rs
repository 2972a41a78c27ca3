//! Event loop state.

use std::path::PathBuf;

use scanout_config::Config;
use smithay::reexports::calloop::LoopSignal;

use crate::backend::Tty;

pub struct State {
    pub tty: Tty,
    pub loop_signal: LoopSignal,
    /// Where the config is re-read from on `SIGHUP`.
    pub config_path: Option<PathBuf>,
    monitors_active: bool,
}

impl State {
    pub fn new(tty: Tty, loop_signal: LoopSignal, config_path: Option<PathBuf>) -> Self {
        Self {
            tty,
            loop_signal,
            config_path,
            monitors_active: true,
        }
    }

    pub fn reload_config(&mut self) {
        let _span = tracy_client::span!("State::reload_config");

        let Some(path) = &self.config_path else {
            debug!("no config file, nothing to reload");
            return;
        };

        match Config::load(path) {
            Ok(config) => {
                info!("reloaded config from {path:?}");
                self.tty.reload_config(config);
            }
            Err(err) => warn!("{err:?}"),
        }
    }

    /// Switches every output off, or back on.
    pub fn toggle_monitors(&mut self) {
        self.monitors_active = !self.monitors_active;
        debug!(
            "powering monitors {}",
            if self.monitors_active { "on" } else { "off" }
        );
        self.tty.set_monitors_active(self.monitors_active);
    }

    /// Stops the event loop. The outputs are torn down once it returns.
    pub fn stop(&mut self) {
        self.loop_signal.stop();
        self.loop_signal.wakeup();
    }
}
