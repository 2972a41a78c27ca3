//! TTY/DRM backend.
//!
//! This module uses the **subsystem ownership pattern**:
//! - `DeviceManager` (devices.rs) - owns every opened DRM card and its [`DrmGpu`]
//! - `RenderManager` (render.rs) - owns the test pattern and vblank-driven redraws
//! - `OutputManager` (outputs.rs) - owns the output snapshot and resume state
//!
//! `Tty` is a thin coordinator that:
//! - Holds session and udev state
//! - Dispatches events to subsystems
//! - Provides public API delegation

mod devices;
mod gpu;
mod helpers;
mod output;
mod outputs;
mod pipeline;
mod render;


use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use libc::dev_t;
use scanout_config::Config;
use smithay::backend::drm::{DrmEventMetadata, DrmNode, NodeType};
use smithay::backend::session::libseat::LibSeatSession;
use smithay::backend::session::{Event as SessionEvent, Session};
use smithay::backend::udev::{self, UdevBackend, UdevEvent};
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{Dispatcher, LoopHandle};
use smithay::reexports::drm::control::{connector, crtc};

pub use devices::{DeviceManager, OutputDevice};
pub use gpu::{DrmGpu, GpuEvent, GpuSettings};
pub use output::{CursorImage, DpmsChange, DpmsMode, DrmOutput};
pub use outputs::{OutputInfos, OutputManager};
pub use pipeline::{DrmPipeline, PipelineConfig, PipelinePhase};
pub use render::{PatternOptions, RenderManager, RenderResult};
use helpers::{ignored_nodes_from_config, keep_primary, primary_node_from_config};

use crate::ipc::OutputInfo;
use crate::state::State;

/// What the backend does with the outputs it finds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TtyMode {
    /// Light every output up and animate the test pattern.
    Drive(PatternOptions),
    /// Only look: nothing is committed.
    Probe,
}

pub struct Tty {
    config: Rc<RefCell<Config>>,
    session: LibSeatSession,
    udev_dispatcher: Dispatcher<'static, UdevBackend, State>,
    event_loop: LoopHandle<'static, State>,
    mode: TtyMode,
    // Device management subsystem - owns all DRM device state.
    pub(crate) devices: DeviceManager,
    // Render management subsystem - owns render state.
    render: RenderManager,
    // Output management subsystem - owns the snapshot and resume state.
    outputs: OutputManager,
}

impl Tty {
    pub fn new(
        config: Rc<RefCell<Config>>,
        event_loop: LoopHandle<'static, State>,
        mode: TtyMode,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("Tty::new");

        let (session, notifier) = LibSeatSession::new().context(
            "Error creating a session. This might mean that you're trying to run scanout on a TTY \
             that is already busy, for example if you're running this inside tmux that had been \
             originally started on a different TTY",
        )?;
        let seat_name = session.seat();

        let udev_backend =
            UdevBackend::new(&seat_name).context("error creating a udev backend")?;
        let udev_dispatcher = Dispatcher::new(udev_backend, move |event, _, state: &mut State| {
            state.tty.on_udev_event(event);
        });
        event_loop
            .register_dispatcher(udev_dispatcher.clone())
            .unwrap();

        event_loop
            .insert_source(notifier, move |event, _, state| {
                state.tty.on_session_event(event);
            })
            .unwrap();

        let (primary_node, primary_render_node) = primary_node_from_config(&config.borrow())
            .ok_or(())
            .or_else(|()| {
                let primary_gpu_path = udev::primary_gpu(&seat_name)
                    .context("error getting the primary GPU")?
                    .context("couldn't find a GPU")?;
                let primary_node = DrmNode::from_path(primary_gpu_path)
                    .context("error opening the primary GPU DRM node")?;
                let primary_render_node = primary_node
                    .node_with_type(NodeType::Render)
                    .and_then(Result::ok)
                    .unwrap_or_else(|| {
                        warn!(
                            "error getting the render node for the primary GPU; proceeding anyway"
                        );
                        primary_node
                    });

                Ok::<_, anyhow::Error>((primary_node, primary_render_node))
            })?;

        match primary_node.dev_path() {
            Some(path) => info!("using as the primary node: {path:?}"),
            None => info!("using as the primary node: {primary_node}"),
        }

        let mut ignored_nodes = ignored_nodes_from_config(&config.borrow());
        keep_primary(&mut ignored_nodes, primary_node, primary_render_node);

        let devices = DeviceManager::new(primary_node, primary_render_node, ignored_nodes);
        let options = match mode {
            TtyMode::Drive(options) => options,
            TtyMode::Probe => PatternOptions::default(),
        };

        Ok(Self {
            config,
            session,
            udev_dispatcher,
            event_loop,
            mode,
            devices,
            render: RenderManager::new(options),
            outputs: OutputManager::new(),
        })
    }

    /// Opens every DRM device of the seat, the primary one first.
    pub fn init(&mut self) {
        let udev = self.udev_dispatcher.clone();
        let udev = udev.as_source_ref();

        let primary_dev_id = self.devices.primary_node().dev_id();
        if let Some((device_id, path)) = udev
            .device_list()
            .find(|&(device_id, _)| device_id == primary_dev_id)
        {
            if let Err(err) = self.device_added(device_id, path) {
                warn!("error adding primary node device: {err:?}");
            }
        } else {
            warn!("primary node is missing");
        }

        for (device_id, path) in udev.device_list() {
            if device_id == primary_dev_id {
                continue;
            }

            if let Err(err) = self.device_added(device_id, path) {
                warn!("error adding device: {err:?}");
            }
        }
    }

    fn on_udev_event(&mut self, event: UdevEvent) {
        let _span = tracy_client::span!("Tty::on_udev_event");

        match event {
            UdevEvent::Added { device_id, path } => {
                if !self.session.is_active() {
                    debug!("skipping UdevEvent::Added as session is inactive");
                    return;
                }

                if let Err(err) = self.device_added(device_id, &path) {
                    warn!("error adding device: {err:?}");
                }
            }
            UdevEvent::Changed { device_id } => {
                if !self.session.is_active() {
                    debug!("skipping UdevEvent::Changed as session is inactive");
                    return;
                }

                let Some(node) = self.devices.node_for(device_id) else {
                    return;
                };
                if self.devices.get(&node).is_some() {
                    self.device_changed(node);
                } else if let Some(path) = node.dev_path() {
                    warn!("unknown device; trying to add");
                    if let Err(err) = self.device_added(device_id, &path) {
                        warn!("error adding device: {err:?}");
                    }
                } else {
                    warn!("unknown device");
                }
            }
            UdevEvent::Removed { device_id } => {
                if !self.session.is_active() {
                    debug!("skipping UdevEvent::Removed as session is inactive");
                    return;
                }

                match DrmNode::from_dev_id(device_id) {
                    Ok(node) => self.device_removed(node, true),
                    Err(err) => warn!("error creating DrmNode: {err:?}"),
                }
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let _span = tracy_client::span!("Tty::on_session_event");

        match event {
            SessionEvent::PauseSession => {
                debug!("pausing session");

                self.devices.pause_devices();
            }
            SessionEvent::ActivateSession => {
                debug!("resuming session");

                if self.outputs.take_ignored_nodes_update_on_resume() {
                    let mut ignored_nodes = ignored_nodes_from_config(&self.config.borrow());
                    keep_primary(
                        &mut ignored_nodes,
                        self.devices.primary_node(),
                        self.devices.primary_render_node(),
                    );
                    self.devices.set_ignored_nodes(ignored_nodes);
                }

                let mut device_list = self
                    .udev_dispatcher
                    .as_source_ref()
                    .device_list()
                    .map(|(device_id, path)| (device_id, path.to_owned()))
                    .collect::<HashMap<_, _>>();

                let (remained_devices, removed_devices): (Vec<_>, Vec<_>) =
                    self.devices.keys().copied().partition(|node| {
                        device_list.contains_key(&node.dev_id())
                            && !self.devices.ignored_nodes().contains(node)
                    });

                for node in removed_devices {
                    device_list.remove(&node.dev_id());
                    // Someone else may be driving it now.
                    self.device_removed(node, true);
                }

                for node in remained_devices {
                    device_list.remove(&node.dev_id());

                    if let Err(err) = self.devices.activate_device(&node) {
                        warn!("error activating DRM device: {err:?}");
                    }

                    // Refresh the connectors.
                    self.device_changed(node);
                }

                for (device_id, path) in device_list {
                    if let Err(err) = self.device_added(device_id, &path) {
                        warn!("error adding device: {err:?}");
                    }
                }

                if self.outputs.take_config_update_on_resume() {
                    self.on_output_config_changed();
                }

                self.outputs.refresh_infos(&self.devices);
                self.set_monitors_active(true);
                self.render.on_resume(&self.event_loop);
            }
        }
    }

    fn device_added(&mut self, device_id: dev_t, path: &Path) -> anyhow::Result<()> {
        let settings = GpuSettings::from_config(&self.config.borrow().debug);
        let node = self.devices.device_added(
            device_id,
            path,
            &mut self.session,
            &self.event_loop,
            settings,
        )?;

        if let Some(node) = node {
            self.device_changed(node);
        }
        Ok(())
    }

    fn device_changed(&mut self, node: DrmNode) {
        let probe = self.mode == TtyMode::Probe;
        let res = {
            let config = self.config.borrow();
            self.devices.device_changed(node, &config.outputs, probe)
        };

        match res {
            Ok(events) => self.on_gpu_events(node, events),
            Err(err) => warn!("{err:?}"),
        }
    }

    fn on_gpu_events(&mut self, node: DrmNode, events: Vec<GpuEvent>) {
        self.render.prune(&self.devices, node, &self.event_loop);

        if let TtyMode::Drive(_) = self.mode {
            for event in &events {
                let GpuEvent::OutputAdded(connector) = *event else {
                    continue;
                };
                let Some(device) = self.devices.get_mut(&node) else {
                    continue;
                };
                self.render.add_output(&mut device.gpu, node, connector);
                self.render.queue_redraw(node, connector, &self.event_loop);
            }
        }

        for event in events {
            if let GpuEvent::OutputRemoved(name) = event {
                debug!("output {} is gone", name.connector);
            }
        }

        self.outputs.refresh_infos(&self.devices);
    }

    fn device_removed(&mut self, node: DrmNode, lost: bool) {
        // Buffers drawn for the device hold on to it.
        self.render.remove_device(node, &self.event_loop);

        let Some((events, fd)) = self.devices.device_removed(node, &self.event_loop, lost) else {
            return;
        };
        for event in events {
            if let GpuEvent::OutputRemoved(name) = event {
                debug!("output {} is gone", name.connector);
            }
        }

        if let Some(fd) = fd {
            if let Err(err) = self.session.close(fd) {
                warn!("error closing DRM device fd: {err:?}");
            }
        }

        self.outputs.refresh_infos(&self.devices);
    }

    fn on_vblank(&mut self, node: DrmNode, crtc: crtc::Handle, meta: Option<DrmEventMetadata>) {
        self.render
            .on_vblank(&mut self.devices, node, crtc, meta, &self.event_loop);
        // A deferred configuration or power-down may have gone out with the completion.
        self.outputs.refresh_infos(&self.devices);
    }

    fn redraw(&mut self, node: DrmNode, connector: connector::Handle) {
        let max_present_retries = self.config.borrow().debug.max_present_retries;
        let res = self.render.redraw(
            &mut self.devices,
            node,
            connector,
            &self.event_loop,
            max_present_retries,
        );
        trace!("redraw on {connector:?}: {res:?}");
    }

    fn on_estimated_vblank_timer(&mut self, node: DrmNode, connector: connector::Handle) {
        self.render
            .on_estimated_vblank_timer(node, connector, &self.event_loop);
    }

    pub fn seat_name(&self) -> String {
        self.session.seat()
    }

    /// Copy of the current snapshot.
    pub fn outputs(&self) -> Vec<OutputInfo> {
        self.outputs.infos().lock().unwrap().clone()
    }

    pub fn set_monitors_active(&mut self, active: bool) {
        if let TtyMode::Probe = self.mode {
            return;
        }

        let changes = self.outputs.set_monitors_active(&mut self.devices, active);
        for (node, connector, change) in changes {
            match change {
                DpmsChange::TurnOffScheduled => {
                    let Some(device) = self.devices.get(&node) else {
                        continue;
                    };
                    let delay = device.gpu.settings().turn_off_delay;
                    self.event_loop
                        .insert_source(Timer::from_duration(delay), move |_, _, state| {
                            state.tty.turn_off(node, connector);
                            TimeoutAction::Drop
                        })
                        .unwrap();
                }
                DpmsChange::TurnedOn => {
                    self.render.queue_redraw(node, connector, &self.event_loop);
                }
                DpmsChange::TurnedOff | DpmsChange::Unchanged => (),
            }
        }
    }

    fn turn_off(&mut self, node: DrmNode, connector: connector::Handle) {
        let Some(device) = self.devices.get_mut(&node) else {
            return;
        };
        if !device.is_active() {
            return;
        }

        match device.gpu.turn_off(connector) {
            Ok(change) => trace!("power-down of {connector:?}: {change:?}"),
            Err(err) => warn!("error powering down: {err}"),
        }
        self.outputs.refresh_infos(&self.devices);
    }

    /// Takes a freshly loaded config into use.
    pub fn reload_config(&mut self, config: Config) {
        let _span = tracy_client::span!("Tty::reload_config");

        let (outputs_changed, ignored_changed) = {
            let current = self.config.borrow();
            (
                current.outputs != config.outputs,
                current.debug.ignored_drm_devices != config.debug.ignored_drm_devices,
            )
        };
        *self.config.borrow_mut() = config;

        if outputs_changed {
            self.on_output_config_changed();
        }
        if ignored_changed {
            self.update_ignored_nodes_config();
        }
    }

    pub fn on_output_config_changed(&mut self) {
        let _span = tracy_client::span!("Tty::on_output_config_changed");

        if let TtyMode::Probe = self.mode {
            return;
        }

        // If we're inactive, we can't do anything, so just set a flag for later.
        if !self.session.is_active() {
            self.outputs.mark_config_update_on_resume();
            return;
        }

        let redraw = {
            let config = self.config.borrow();
            self.outputs.apply_config(&mut self.devices, &config.outputs)
        };
        for (node, connector) in redraw {
            self.render.queue_redraw(node, connector, &self.event_loop);
        }
    }

    pub fn update_ignored_nodes_config(&mut self) {
        let _span = tracy_client::span!("Tty::update_ignored_nodes_config");

        // If we're inactive, we can't do anything, so just set a flag for later.
        if !self.session.is_active() {
            self.outputs.mark_ignored_nodes_update_on_resume();
            return;
        }

        let mut ignored_nodes = ignored_nodes_from_config(&self.config.borrow());
        keep_primary(
            &mut ignored_nodes,
            self.devices.primary_node(),
            self.devices.primary_render_node(),
        );

        if &ignored_nodes == self.devices.ignored_nodes() {
            return;
        }
        self.devices.set_ignored_nodes(ignored_nodes);

        let mut device_list = self
            .udev_dispatcher
            .as_source_ref()
            .device_list()
            .map(|(device_id, path)| (device_id, path.to_owned()))
            .collect::<HashMap<_, _>>();

        let removed_devices = self
            .devices
            .keys()
            .filter(|node| self.devices.ignored_nodes().contains(node))
            .copied()
            .collect::<Vec<_>>();

        for node in removed_devices {
            device_list.remove(&node.dev_id());
            self.device_removed(node, false);
        }

        for node in self.devices.keys() {
            device_list.remove(&node.dev_id());
        }

        for (device_id, path) in device_list {
            if let Err(err) = self.device_added(device_id, &path) {
                warn!("error adding device {path:?}: {err:?}");
            }
        }
    }

    /// Switches every output off and releases them. Used on the way out.
    pub fn shutdown(&mut self) {
        let _span = tracy_client::span!("Tty::shutdown");

        if let TtyMode::Drive(_) = self.mode {
            self.devices.shutdown();
        }
        let nodes = self.devices.keys().copied().collect::<Vec<_>>();
        for node in nodes {
            self.render.remove_device(node, &self.event_loop);
        }
        self.outputs.refresh_infos(&self.devices);
    }
}
