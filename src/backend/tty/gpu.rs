use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use scanout_config::OutputName;
use smithay::reexports::drm::control::{connector, crtc};

use super::output::{CursorImage, DpmsChange, DpmsMode, DrmOutput};
use crate::ipc::OutputInfo;
use crate::kms::{
    AtomicCommit, DrmConnector, DrmCrtc, DrmFramebuffer, DrmObjects, DrmPlane, FlipOutcome,
    GammaRamp, KmsDevice, KmsError, KmsObject, RetryPolicy,
};

/// Per-device knobs taken from the `debug {}` config section.
#[derive(Debug, Clone, Copy)]
pub struct GpuSettings {
    pub use_cursor_plane: bool,
    pub monitor_names: bool,
    pub turn_off_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self::from_config(&scanout_config::Debug::default())
    }
}

impl GpuSettings {
    pub fn from_config(debug: &scanout_config::Debug) -> Self {
        Self {
            use_cursor_plane: !debug.disable_cursor_plane,
            monitor_names: !debug.disable_monitor_names,
            turn_off_delay: Duration::from_millis(debug.dpms_turn_off_delay_ms),
            retry: RetryPolicy::default()
                .with_attempts(debug.commit_busy_retries.saturating_add(1)),
        }
    }
}

/// Output set changes the rest of the program has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuEvent {
    OutputAdded(connector::Handle),
    OutputRemoved(OutputName),
}

/// One KMS device and the outputs driven on it.
///
/// Owns every object of the device. Outputs lease a CRTC and its planes for as long as they
/// exist; a CRTC backs at most one output.
pub struct DrmGpu {
    objects: DrmObjects,
    outputs: Vec<DrmOutput>,
    settings: GpuSettings,
    /// Leftovers from a previous DRM master were switched off.
    reconciled: bool,
    /// Queued configuration hit a commit in flight and goes out after its completion.
    apply_after_flip: bool,
    /// Non-desktop connectors we already told about.
    non_desktop: HashSet<connector::Handle>,
}

impl DrmGpu {
    /// Takes over `device`. Devices without atomic modesetting are refused.
    pub fn new(device: Rc<dyn KmsDevice>, settings: GpuSettings) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("DrmGpu::new");

        if !device.is_atomic() {
            return Err(KmsError::Unsupported("device lacks atomic modesetting"));
        }

        let objects = DrmObjects::discover(device, settings.retry)?;
        debug!(
            "found {} CRTCs, {} planes, {} connectors",
            objects.crtcs().len(),
            objects.planes().len(),
            objects.connectors().len(),
        );

        Ok(Self {
            objects,
            outputs: Vec::new(),
            settings,
            reconciled: false,
            apply_after_flip: false,
            non_desktop: HashSet::new(),
        })
    }

    pub fn objects(&self) -> &DrmObjects {
        &self.objects
    }

    pub fn settings(&self) -> &GpuSettings {
        &self.settings
    }

    pub fn outputs(&self) -> impl Iterator<Item = &DrmOutput> {
        self.outputs.iter()
    }

    pub fn output(&self, connector: connector::Handle) -> Option<&DrmOutput> {
        self.outputs.iter().find(|o| o.connector() == connector)
    }

    pub fn output_for_crtc(&self, crtc: crtc::Handle) -> Option<&DrmOutput> {
        self.outputs.iter().find(|o| o.crtc() == crtc)
    }

    fn output_mut(&mut self, connector: connector::Handle) -> Result<&mut DrmOutput, KmsError> {
        self.outputs
            .iter_mut()
            .find(|o| o.connector() == connector)
            .ok_or(KmsError::Removed)
    }

    fn is_leased(&self, crtc: crtc::Handle) -> bool {
        self.outputs.iter().any(|o| o.crtc() == crtc)
    }

    /// Re-probes the connectors and brings the output set in line with them.
    ///
    /// Every output is removed exactly once: its pipeline is released, so a completion event
    /// still in flight for its CRTC is recognized as stale.
    pub fn update_outputs(
        &mut self,
        config: &scanout_config::Outputs,
    ) -> Result<Vec<GpuEvent>, KmsError> {
        let _span = tracy_client::span!("DrmGpu::update_outputs");

        let mut events = Vec::new();

        for connector in self.objects.rescan_connectors()? {
            events.extend(self.remove_output(connector.handle()));
        }

        let disconnected = self
            .outputs
            .iter()
            .map(DrmOutput::connector)
            .filter(|&handle| {
                self.objects
                    .connector(handle)
                    .map_or(true, |c| !c.is_connected() || c.is_non_desktop())
            })
            .collect::<Vec<_>>();
        for handle in disconnected {
            events.extend(self.remove_output(handle));
        }

        for output in &mut self.outputs {
            if let Some(connector) = self.objects.connector(output.connector()) {
                if output.update_modes(connector) {
                    debug!("{}: queued a mode change", connector.name());
                }
            }
        }

        let mut new = Vec::new();
        for connector in self.objects.connectors() {
            let handle = connector.handle();
            if !connector.is_connected() {
                self.non_desktop.remove(&handle);
                continue;
            }
            if connector.is_non_desktop() {
                if self.non_desktop.insert(handle) {
                    debug!("{}: connector is non-desktop, skipping", connector.name());
                }
                continue;
            }
            if self.output(handle).is_none() {
                new.push(handle);
            }
        }

        for handle in new {
            match self.add_output(handle, config) {
                Ok(()) => events.push(GpuEvent::OutputAdded(handle)),
                Err(err) => {
                    let name = self.objects.connector(handle).map(DrmConnector::name);
                    warn!("error adding output for {}: {err}", name.unwrap_or("connector"));
                }
            }
        }

        if !self.reconciled {
            self.reconciled = true;
            if let Err(err) = self.switch_off_leftovers() {
                warn!("error switching off unused CRTCs: {err}");
            }
        }

        Ok(events)
    }

    /// Builds outputs for the connected connectors without touching what another DRM master
    /// left lit. Used for listing outputs.
    pub fn probe_outputs(
        &mut self,
        config: &scanout_config::Outputs,
    ) -> Result<Vec<GpuEvent>, KmsError> {
        self.reconciled = true;
        self.update_outputs(config)
    }

    fn add_output(
        &mut self,
        handle: connector::Handle,
        config: &scanout_config::Outputs,
    ) -> Result<(), KmsError> {
        let connector = self.objects.connector(handle).ok_or(KmsError::Removed)?;
        let crtc = self
            .pick_crtc(connector)
            .ok_or(KmsError::Unsupported("no free CRTC"))?;

        let name = if self.settings.monitor_names {
            connector.output_name().clone()
        } else {
            OutputName::from_connector(connector.name())
        };
        let output_config = config.find(&name).cloned().unwrap_or_default();
        let mut output = DrmOutput::new(
            &self.objects,
            handle,
            crtc,
            output_config,
            self.next_free_position(),
            self.settings.use_cursor_plane,
        )?;
        if !self.settings.monitor_names {
            output.hide_monitor_name();
        }

        info!(
            "new output {} on {crtc:?}",
            output.name().format_make_model_serial_or_connector(),
        );
        self.outputs.push(output);
        Ok(())
    }

    /// The connector's current CRTC if it is free, else the first free one that can drive it.
    fn pick_crtc(&self, connector: &DrmConnector) -> Option<crtc::Handle> {
        let usable = |crtc: crtc::Handle| {
            !self.is_leased(crtc)
                && connector.possible_crtcs().contains(&crtc)
                && self
                    .objects
                    .crtc(crtc)
                    .is_some_and(|c| c.primary_plane().is_some())
        };

        connector.crtc().filter(|&crtc| usable(crtc)).or_else(|| {
            self.objects
                .crtcs()
                .iter()
                .map(|c| c.handle())
                .find(|&crtc| usable(crtc))
        })
    }

    /// Right next to the rightmost output.
    fn next_free_position(&self) -> (i32, i32) {
        let x = self
            .outputs
            .iter()
            .filter_map(DrmOutput::logical_geometry)
            .map(|geo| geo.x.saturating_add(geo.width as i32))
            .max()
            .unwrap_or(0);
        (x, 0)
    }

    /// Switches off whatever a previous DRM master left lit on CRTCs we do not use.
    fn switch_off_leftovers(&mut self) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmGpu::switch_off_leftovers");

        let mut commit = AtomicCommit::new();
        if let Err(err) = self.stage_leftovers(&mut commit) {
            self.objects.finish(&commit, false);
            return Err(err);
        }
        if commit.is_empty() {
            return Ok(());
        }
        commit.set_allow_modeset(true);
        self.objects.apply(commit)
    }

    fn stage_leftovers(&mut self, commit: &mut AtomicCommit) -> Result<(), KmsError> {
        let leased = self
            .outputs
            .iter()
            .map(|o| (o.crtc(), o.connector()))
            .collect::<Vec<_>>();
        let is_leased = |crtc: crtc::Handle| leased.iter().any(|&(c, _)| c == crtc);

        let connectors = handles(self.objects.connectors(), DrmConnector::handle);
        for handle in connectors {
            let Some(connector) = self.objects.connector_mut(handle) else {
                continue;
            };
            let Some(crtc) = connector.crtc() else {
                continue;
            };
            if !leased.contains(&(crtc, handle)) {
                debug!("{}: detaching from {crtc:?}", connector.name());
                connector.disable(commit)?;
            }
        }

        let crtcs = handles(self.objects.crtcs(), DrmCrtc::handle);
        for handle in crtcs.into_iter().filter(|&crtc| !is_leased(crtc)) {
            let Some(crtc) = self.objects.crtc_mut(handle) else {
                continue;
            };
            if crtc.is_active() || crtc.object().value("MODE_ID").is_some_and(|id| id != 0) {
                debug!("switching off unused {handle:?}");
                crtc.disable(commit)?;
            }
        }

        let planes = handles(self.objects.planes(), DrmPlane::handle);
        for handle in planes {
            let Some(plane) = self.objects.plane_mut(handle) else {
                continue;
            };
            if plane.crtc().is_some_and(|crtc| !is_leased(crtc)) {
                plane.disable(commit)?;
            }
        }

        Ok(())
    }

    /// Turns the output for `connector` off and forgets it.
    fn remove_output(&mut self, connector: connector::Handle) -> Option<GpuEvent> {
        let index = self.outputs.iter().position(|o| o.connector() == connector)?;
        let mut output = self.outputs.remove(index);
        let name = output.name().clone();
        info!("removing output {}", name.connector);

        let lit = self
            .objects
            .crtc(output.crtc())
            .is_some_and(|crtc| crtc.is_active());
        if lit || output.pipeline().current().enabled {
            let mut commit = AtomicCommit::new();
            let res = output
                .pipeline_mut()
                .stage_disable(&mut self.objects, &mut commit)
                .and_then(|()| self.objects.submit(commit));
            if let Err(err) = res {
                debug!("{}: error switching off: {err}", name.connector);
            }
        }

        output.pipeline_mut().release(&mut self.objects);
        output.release_buffers();
        Some(GpuEvent::OutputRemoved(name))
    }

    /// Queues the configuration `config` asks for on every output.
    ///
    /// Returns whether anything changed. Nothing reaches the hardware until
    /// [`Self::apply_queued_changes`].
    pub fn queue_config(&mut self, config: &scanout_config::Outputs) -> bool {
        let mut changed = false;
        for output in &mut self.outputs {
            let Some(connector) = self.objects.connector(output.connector()) else {
                continue;
            };
            let output_config = config.find(output.name()).cloned().unwrap_or_default();
            match output.queue_config(connector, output_config) {
                Ok(queued) => changed |= queued,
                Err(err) => warn!("{}: error queueing configuration: {err}", connector.name()),
            }
        }
        changed
    }

    /// Drops every queued candidate.
    pub fn revert_queued_changes(&mut self) {
        self.apply_after_flip = false;
        for output in &mut self.outputs {
            output.revert_queued_changes();
        }
    }

    /// Tests the queued changes of all outputs as one transaction and commits them.
    ///
    /// Either every candidate is applied or none is: the request that passed the test is the
    /// one submitted. While a commit is in flight on an affected output this returns
    /// `Busy { attempts: 0 }` and retries after its completion.
    pub fn apply_queued_changes(&mut self) -> Result<bool, KmsError> {
        let _span = tracy_client::span!("DrmGpu::apply_queued_changes");

        let mut changed = false;
        let mut pending = Vec::new();
        for (i, output) in self.outputs.iter_mut().enumerate() {
            match output.settle_without_commit() {
                Some(settled) => changed |= settled,
                None => pending.push(i),
            }
        }
        if pending.is_empty() {
            self.apply_after_flip = false;
            return Ok(changed);
        }

        if pending
            .iter()
            .any(|&i| self.outputs[i].pipeline().is_applying())
        {
            debug!("applying the configuration after the pending commits");
            self.apply_after_flip = true;
            return Err(KmsError::Busy { attempts: 0 });
        }
        self.apply_after_flip = false;

        let mut commit = AtomicCommit::new();
        let mut staged = Vec::with_capacity(pending.len());

        for &i in &pending {
            let output = &mut self.outputs[i];
            let Some(candidate) = output.pipeline().queued().cloned() else {
                continue;
            };
            let was_active = self
                .objects
                .crtc(output.crtc())
                .is_some_and(DrmCrtc::is_active);
            let res = output.frame_for(&self.objects, &candidate).and_then(|fb| {
                output
                    .pipeline_mut()
                    .stage(&mut self.objects, &mut commit, candidate, fb)
            });
            match res {
                Ok(s) => staged.push((i, s, was_active)),
                Err(err) => {
                    warn!("{}: error staging configuration: {err}", output.name().connector);
                    self.objects.finish(&commit, false);
                    self.discard(&pending, &err);
                    return Err(err);
                }
            }
        }

        // Events cover every CRTC in the commit, and the kernel refuses one for a CRTC that
        // stays off. Such a commit goes out blocking instead.
        let blocking = staged
            .iter()
            .any(|(_, s, was_active)| !s.has_event() && !was_active);
        if blocking {
            commit.clear_flip_events();
        }
        let events = !commit.flip_crtcs().is_empty();

        for &i in &pending {
            self.outputs[i].pipeline_mut().set_testing(true);
        }
        let res = commit.test(&**self.objects.device());
        for &i in &pending {
            self.outputs[i].pipeline_mut().set_testing(false);
        }
        if let Err(err) = res {
            debug!("test commit failed: {err}");
            self.objects.finish(&commit, false);
            self.discard(&pending, &err);
            return Err(err);
        }

        if let Err(err) = self.objects.submit(commit) {
            warn!("commit failed after a passing test: {err}");
            self.discard(&pending, &err);
            return Err(err);
        }

        for (i, staged, was_active) in staged {
            let switched_off = !staged.has_event() && was_active;
            let output = &mut self.outputs[i];
            output.commit_succeeded(&mut self.objects, staged, blocking);
            if events && switched_off {
                if let Some(crtc) = self.objects.crtc_mut(output.crtc()) {
                    crtc.expect_stale_event();
                }
            }
        }

        Ok(true)
    }

    /// Drops the candidates of `pending` after a failure, unless the device was merely busy.
    fn discard(&mut self, pending: &[usize], err: &KmsError) {
        if err.is_busy() {
            return;
        }
        for &i in pending {
            self.outputs[i].revert_queued_changes();
        }
    }

    /// Shows `fb` on the output driven by `crtc`.
    pub fn present(&mut self, crtc: crtc::Handle, fb: Rc<DrmFramebuffer>) -> Result<(), KmsError> {
        let output = self
            .outputs
            .iter_mut()
            .find(|o| o.crtc() == crtc)
            .ok_or(KmsError::Removed)?;
        output.present(&mut self.objects, fb)
    }

    /// Handles a completion event. Returns the output whose frame is now on screen.
    pub fn on_page_flip(&mut self, crtc: crtc::Handle) -> Option<connector::Handle> {
        let _span = tracy_client::span!("DrmGpu::on_page_flip");

        let Some(output) = self.outputs.iter_mut().find(|o| o.crtc() == crtc) else {
            match self.objects.crtc_mut(crtc).map(|c| c.page_flip_event()) {
                Some(FlipOutcome::Stale) => {
                    debug!("ignoring completion event for released {crtc:?}");
                }
                _ => error!("completion event for {crtc:?} without an output"),
            }
            return None;
        };

        let connector = output.connector();
        let outcome = output.on_page_flip(&mut self.objects);
        match outcome {
            FlipOutcome::Completed => (),
            FlipOutcome::Stale => {
                debug!("{}: ignoring stale completion event", output.name().connector);
                return None;
            }
            FlipOutcome::Unexpected => {
                error!("{}: unexpected completion event", output.name().connector);
                return None;
            }
        }

        if self.apply_after_flip && !self.outputs.iter().any(|o| o.pipeline().is_applying()) {
            match self.apply_queued_changes() {
                Ok(_) | Err(KmsError::Busy { attempts: 0 }) => (),
                Err(err) => warn!("error applying queued configuration: {err}"),
            }
        }

        Some(connector)
    }

    pub fn set_dpms(
        &mut self,
        connector: connector::Handle,
        mode: DpmsMode,
    ) -> Result<DpmsChange, KmsError> {
        let delay = self.settings.turn_off_delay;
        let index = self
            .outputs
            .iter()
            .position(|o| o.connector() == connector)
            .ok_or(KmsError::Removed)?;
        self.outputs[index].set_dpms(&mut self.objects, mode, delay)
    }

    /// Performs a power-down scheduled by [`Self::set_dpms`].
    pub fn turn_off(&mut self, connector: connector::Handle) -> Result<DpmsChange, KmsError> {
        let index = self
            .outputs
            .iter()
            .position(|o| o.connector() == connector)
            .ok_or(KmsError::Removed)?;
        self.outputs[index].turn_off(&mut self.objects)
    }

    pub fn gamma_ramp_size(&self, connector: connector::Handle) -> Result<usize, KmsError> {
        let output = self.output(connector).ok_or(KmsError::Removed)?;
        Ok(output.gamma_ramp_size(&self.objects))
    }

    pub fn set_gamma_ramp(
        &mut self,
        connector: connector::Handle,
        ramp: Option<GammaRamp>,
    ) -> Result<(), KmsError> {
        let index = self
            .outputs
            .iter()
            .position(|o| o.connector() == connector)
            .ok_or(KmsError::Removed)?;
        self.outputs[index].set_gamma_ramp(&mut self.objects, ramp)
    }

    /// Returns whether the hardware cursor is in use on `connector`.
    pub fn update_cursor(
        &mut self,
        connector: connector::Handle,
        image: Option<CursorImage<'_>>,
    ) -> bool {
        let Some(output) = self.outputs.iter_mut().find(|o| o.connector() == connector) else {
            return false;
        };
        output.update_cursor(&mut self.objects, image)
    }

    pub fn move_cursor(&mut self, connector: connector::Handle, position: (i32, i32)) -> bool {
        self.output_mut(connector)
            .is_ok_and(|output| output.move_cursor(position))
    }

    /// Re-reads the kernel state after the session was inactive and makes the next commit of
    /// every output a full modeset.
    pub fn resume(&mut self) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmGpu::resume");

        self.objects.update_properties()?;
        for output in &mut self.outputs {
            output.pipeline_mut().force_modeset(&mut self.objects);
        }
        Ok(())
    }

    /// Switches every output off in a single commit and releases all of them.
    pub fn shutdown(&mut self) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmGpu::shutdown");

        let mut commit = AtomicCommit::new();
        let mut res = Ok(());
        for output in &mut self.outputs {
            if let Err(err) = output
                .pipeline_mut()
                .stage_disable(&mut self.objects, &mut commit)
            {
                res = Err(err);
                break;
            }
        }

        res = match res {
            Ok(()) if !commit.is_empty() => self.objects.submit(commit),
            Ok(()) => Ok(()),
            Err(err) => {
                self.objects.finish(&commit, false);
                Err(err)
            }
        };

        self.release_all();
        res
    }

    /// Forgets every output after the device disappeared. Nothing reaches the kernel.
    pub fn device_lost(&mut self) -> Vec<GpuEvent> {
        let names = self
            .outputs
            .iter()
            .map(|o| GpuEvent::OutputRemoved(o.name().clone()))
            .collect();
        self.release_all();
        names
    }

    fn release_all(&mut self) {
        for mut output in self.outputs.drain(..) {
            output.pipeline_mut().release(&mut self.objects);
            output.release_buffers();
        }
    }

    /// Snapshot of every output, internal panels first.
    pub fn output_infos(&self) -> Vec<OutputInfo> {
        let mut outputs = self.outputs.iter().collect::<Vec<_>>();
        outputs.sort_by(|a, b| a.name().compare(b.name()));
        outputs.into_iter().map(DrmOutput::info).collect()
    }
}

fn handles<T, H>(objects: &[T], handle: impl Fn(&T) -> H) -> Vec<H> {
    objects.iter().map(handle).collect()
}
