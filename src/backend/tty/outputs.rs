//! Output management for the TTY backend.
//!
//! Keeps the output snapshot handed out for listing, applies configuration and power changes
//! across devices, and remembers what has to be redone once the session is active again.

use std::sync::{Arc, Mutex};

use smithay::backend::drm::DrmNode;
use smithay::reexports::drm::control::connector;

use super::devices::DeviceManager;
use super::output::{DpmsChange, DpmsMode};
use crate::ipc::OutputInfo;
use crate::kms::KmsError;

/// Snapshot of every output on every device.
pub type OutputInfos = Arc<Mutex<Vec<OutputInfo>>>;

pub struct OutputManager {
    infos: OutputInfos,
    /// The output config changed while the session was paused.
    update_config_on_resume: bool,
    /// The ignored nodes changed while the session was paused.
    update_ignored_nodes_on_resume: bool,
}

impl OutputManager {
    pub fn new() -> Self {
        Self {
            infos: Arc::new(Mutex::new(Vec::new())),
            update_config_on_resume: false,
            update_ignored_nodes_on_resume: false,
        }
    }

    pub fn infos(&self) -> OutputInfos {
        Arc::clone(&self.infos)
    }

    /// Rebuilds the snapshot, internal panels first, then by name.
    pub fn refresh_infos(&self, devices: &DeviceManager) {
        let mut outputs = devices
            .iter()
            .flat_map(|(_, device)| device.gpu.outputs())
            .collect::<Vec<_>>();
        outputs.sort_by(|a, b| a.name().compare(b.name()));
        let infos = outputs.into_iter().map(|output| output.info()).collect();

        let mut guard = self.infos.lock().unwrap();
        *guard = infos;
    }

    pub fn mark_config_update_on_resume(&mut self) {
        self.update_config_on_resume = true;
    }

    pub fn mark_ignored_nodes_update_on_resume(&mut self) {
        self.update_ignored_nodes_on_resume = true;
    }

    /// Returns whether the flag was set, clearing it.
    pub fn take_config_update_on_resume(&mut self) -> bool {
        std::mem::take(&mut self.update_config_on_resume)
    }

    /// Returns whether the flag was set, clearing it.
    pub fn take_ignored_nodes_update_on_resume(&mut self) -> bool {
        std::mem::take(&mut self.update_ignored_nodes_on_resume)
    }

    /// Queues `config` on every device and applies it, one transaction per device.
    ///
    /// Returns the outputs that want a fresh frame.
    pub fn apply_config(
        &mut self,
        devices: &mut DeviceManager,
        config: &scanout_config::Outputs,
    ) -> Vec<(DrmNode, connector::Handle)> {
        let _span = tracy_client::span!("OutputManager::apply_config");

        let mut redraw = Vec::new();
        for (node, device) in devices.iter_mut() {
            if !device.gpu.queue_config(config) {
                continue;
            }

            match device.gpu.apply_queued_changes() {
                Ok(_) => (),
                Err(KmsError::Busy { attempts: 0 }) => {
                    debug!("{node}: configuration goes out after the commit in flight");
                }
                Err(err) => {
                    warn!("{node}: error applying output configuration: {err}");
                    continue;
                }
            }

            redraw.extend(
                device
                    .gpu
                    .outputs()
                    .filter(|output| output.wants_frames())
                    .map(|output| (*node, output.connector())),
            );
        }

        self.refresh_infos(devices);
        redraw
    }

    /// Powers every output on or off.
    pub fn set_monitors_active(
        &mut self,
        devices: &mut DeviceManager,
        active: bool,
    ) -> Vec<(DrmNode, connector::Handle, DpmsChange)> {
        let mode = if active { DpmsMode::On } else { DpmsMode::Off };

        let mut changes = Vec::new();
        for (node, device) in devices.iter_mut() {
            if !device.is_active() {
                continue;
            }

            let connectors = device
                .gpu
                .outputs()
                .map(|output| output.connector())
                .collect::<Vec<_>>();
            for connector in connectors {
                match device.gpu.set_dpms(connector, mode) {
                    Ok(DpmsChange::Unchanged) => (),
                    Ok(change) => changes.push((*node, connector, change)),
                    Err(err) => warn!("error setting DPMS {}: {err}", mode.as_str()),
                }
            }
        }

        self.refresh_infos(devices);
        changes
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}
