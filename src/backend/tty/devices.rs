//! Device management for the TTY backend.
//!
//! - `OutputDevice` is one opened DRM card and the [`DrmGpu`] driving it.
//! - `DeviceManager` owns every opened card and the node selection.

use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use libc::dev_t;
use smithay::backend::drm::{DrmDevice, DrmDeviceFd, DrmEvent, DrmNode, NodeType};
use smithay::backend::session::libseat::LibSeatSession;
use smithay::backend::session::Session;
use smithay::reexports::calloop::{LoopHandle, RegistrationToken};
use smithay::reexports::rustix::fs::OFlags;
use smithay::utils::DeviceFd;

use super::gpu::{DrmGpu, GpuEvent, GpuSettings};
use crate::kms::DrmCard;
use crate::state::State;

/// An opened DRM card.
pub struct OutputDevice {
    token: RegistrationToken,
    card: Rc<DrmCard>,
    device_fd: DrmDeviceFd,
    pub gpu: DrmGpu,
}

impl OutputDevice {
    pub fn is_active(&self) -> bool {
        self.card.is_active()
    }
}

/// Owns all DRM device state.
pub struct DeviceManager {
    primary_node: DrmNode,
    primary_render_node: DrmNode,
    devices: HashMap<DrmNode, OutputDevice>,
    ignored_nodes: HashSet<DrmNode>,
}

impl DeviceManager {
    pub fn new(
        primary_node: DrmNode,
        primary_render_node: DrmNode,
        ignored_nodes: HashSet<DrmNode>,
    ) -> Self {
        Self {
            primary_node,
            primary_render_node,
            devices: HashMap::new(),
            ignored_nodes,
        }
    }

    pub fn primary_node(&self) -> DrmNode {
        self.primary_node
    }

    pub fn primary_render_node(&self) -> DrmNode {
        self.primary_render_node
    }

    pub fn ignored_nodes(&self) -> &HashSet<DrmNode> {
        &self.ignored_nodes
    }

    pub fn set_ignored_nodes(&mut self, ignored: HashSet<DrmNode>) {
        self.ignored_nodes = ignored;
    }

    pub fn get(&self, node: &DrmNode) -> Option<&OutputDevice> {
        self.devices.get(node)
    }

    pub fn get_mut(&mut self, node: &DrmNode) -> Option<&mut OutputDevice> {
        self.devices.get_mut(node)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DrmNode> {
        self.devices.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DrmNode, &OutputDevice)> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&DrmNode, &mut OutputDevice)> {
        self.devices.iter_mut()
    }

    /// Maps a udev device id to a node we should drive, `None` for nodes we skip.
    pub fn node_for(&self, device_id: dev_t) -> Option<DrmNode> {
        let node = match DrmNode::from_dev_id(device_id) {
            Ok(node) => node,
            Err(err) => {
                warn!("error creating DrmNode: {err:?}");
                return None;
            }
        };

        // Only consider primary nodes on udev events.
        if node.ty() != NodeType::Primary {
            debug!("not a primary node, skipping");
            return None;
        }

        if self.ignored_nodes.contains(&node) {
            debug!("node is ignored, skipping");
            return None;
        }

        Some(node)
    }

    /// Opens the card at `path` through the session and starts listening for its events.
    ///
    /// Returns the node when the device was taken over.
    pub fn device_added(
        &mut self,
        device_id: dev_t,
        path: &Path,
        session: &mut LibSeatSession,
        event_loop: &LoopHandle<'static, State>,
        settings: GpuSettings,
    ) -> anyhow::Result<Option<DrmNode>> {
        debug!("adding device: {device_id} {path:?}");

        let Some(node) = self.node_for(device_id) else {
            return Ok(None);
        };

        if node == self.primary_node {
            debug!("this is the primary node");
        }

        if self.devices.contains_key(&node) {
            debug!("device is already open");
            return Ok(None);
        }

        let _span = tracy_client::span!("DeviceManager::device_added");

        let open_flags = OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK;
        let fd = {
            let _span = tracy_client::span!("LibSeatSession::open");
            session.open(path, open_flags)
        }
        .context("error opening the device")?;
        let device_fd = DrmDeviceFd::new(DeviceFd::from(fd));

        let (drm, drm_notifier) = {
            let _span = tracy_client::span!("DrmDevice::new");
            DrmDevice::new(device_fd.clone(), false)
        }
        .context("error creating the DRM device")?;

        let card = Rc::new(DrmCard::new(drm));
        let gpu = DrmGpu::new(card.clone(), settings).context("error taking over the device")?;

        let token = event_loop
            .insert_source(drm_notifier, move |event, meta, state| match event {
                DrmEvent::VBlank(crtc) => state.tty.on_vblank(node, crtc, meta.take()),
                DrmEvent::Error(error) => warn!("DRM error: {error}"),
            })
            .unwrap();

        let device = OutputDevice {
            token,
            card,
            device_fd,
            gpu,
        };
        self.devices.insert(node, device);

        Ok(Some(node))
    }

    /// Re-probes the connectors of `node` after a hotplug event.
    ///
    /// With `probe` set, nothing another DRM master left lit is touched.
    pub fn device_changed(
        &mut self,
        node: DrmNode,
        config: &scanout_config::Outputs,
        probe: bool,
    ) -> anyhow::Result<Vec<GpuEvent>> {
        debug!("device changed: {node}");

        let device = self.devices.get_mut(&node).context("unknown device")?;
        let events = if probe {
            device.gpu.probe_outputs(config)
        } else {
            device.gpu.update_outputs(config)
        };
        events.context("error updating outputs")
    }

    /// Stops driving `node`.
    ///
    /// When the device is `lost`, nothing reaches the kernel anymore; otherwise its outputs are
    /// switched off first. Returns the removed outputs and the fd to hand back to the session.
    pub fn device_removed(
        &mut self,
        node: DrmNode,
        event_loop: &LoopHandle<'static, State>,
        lost: bool,
    ) -> Option<(Vec<GpuEvent>, Option<OwnedFd>)> {
        debug!("removing device: {node}");

        let Some(device) = self.devices.remove(&node) else {
            warn!("unknown device");
            return None;
        };
        let OutputDevice {
            token,
            card,
            device_fd,
            mut gpu,
        } = device;

        event_loop.remove(token);

        let events = if lost || !card.is_active() {
            gpu.device_lost()
        } else {
            let events = gpu
                .outputs()
                .map(|output| GpuEvent::OutputRemoved(output.name().clone()))
                .collect();
            if let Err(err) = gpu.shutdown() {
                warn!("error switching off outputs: {err}");
            }
            events
        };

        // The fd can only be closed once nothing else refers to it.
        drop(gpu);
        drop(card);
        let fd = device_fd.device_fd();
        drop(device_fd);

        Some((events, TryInto::<OwnedFd>::try_into(fd).ok()))
    }

    /// Gives up DRM master on every device.
    pub fn pause_devices(&mut self) {
        for device in self.devices.values_mut() {
            device.card.pause();
        }
    }

    /// Takes DRM master back after the session was resumed.
    ///
    /// Every output does a full modeset with its next commit.
    pub fn activate_device(&mut self, node: &DrmNode) -> anyhow::Result<()> {
        let device = self.devices.get_mut(node).context("device not found")?;
        device
            .card
            .activate()
            .context("error activating DRM device")?;
        device.gpu.resume().context("error re-reading KMS state")?;
        Ok(())
    }

    /// Switches every output of every device off, one commit per device.
    pub fn shutdown(&mut self) {
        let _span = tracy_client::span!("DeviceManager::shutdown");

        for (node, device) in &mut self.devices {
            if !device.card.is_active() {
                debug!("{node} is paused, leaving it as it is");
                continue;
            }
            if let Err(err) = device.gpu.shutdown() {
                warn!("error switching off outputs of {node}: {err}");
            }
        }
    }
}
