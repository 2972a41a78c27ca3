use std::rc::Rc;
use std::time::Duration;

use scanout_config::OutputName;
use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{connector, crtc, Mode, ModeTypeFlags};

use super::pipeline::{CursorPlacement, DrmPipeline, PipelineConfig, Staged};
use crate::ipc::{LogicalOutput, ModeInfo, OutputInfo};
use crate::kms::{
    calculate_drm_mode_from_modeline, mode_refresh_mhz, pick_mode, refresh_interval, same_timing,
    Capabilities, DrmConnector, DrmFramebuffer, DrmObjects, DumbSwapchain, FlipOutcome,
    GammaRamp, KmsDevice, KmsError,
};

/// Slots in the cursor swapchain: one on screen, one in flight, one being drawn.
const CURSOR_BUFFERS: usize = 3;

/// Scales outside this range are clamped.
const MIN_SCALE: f64 = 0.1;
const MAX_SCALE: f64 = 10.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

impl DpmsMode {
    pub fn is_on(self) -> bool {
        self == DpmsMode::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DpmsMode::On => "on",
            DpmsMode::Standby => "standby",
            DpmsMode::Suspend => "suspend",
            DpmsMode::Off => "off",
        }
    }
}

/// What a DPMS request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsChange {
    Unchanged,
    /// Power-down happens when the turn-off timer fires, or after the commit in flight.
    TurnOffScheduled,
    TurnedOff,
    /// The output is on again and needs a fresh frame.
    TurnedOn,
}

/// A cursor image in ARGB8888, rows tightly packed.
#[derive(Debug, Clone, Copy)]
pub struct CursorImage<'a> {
    pub size: (u32, u32),
    pub hotspot: (i32, i32),
    pub pixels: &'a [u8],
}

/// A connector driven by this process.
#[derive(Debug)]
pub struct DrmOutput {
    name: OutputName,
    pipeline: DrmPipeline,
    config: scanout_config::Output,
    /// Configuration behind the queued candidate and its custom-mode flag. Becomes `config`
    /// once the candidate is applied and is dropped with it.
    pending_config: Option<(scanout_config::Output, bool)>,
    modes: Vec<Mode>,
    physical_size: Option<(u32, u32)>,
    vrr_capable: bool,
    /// Whether the mode came from a modeline or CVT rather than the connector's list.
    custom_mode: bool,
    dpms: DpmsMode,
    turn_off_pending: bool,
    /// Power-down was due while a commit was in flight.
    deferred_turn_off: bool,
    /// Gamma ramp set while a commit was in flight.
    deferred_gamma: Option<Option<GammaRamp>>,
    cursor_swapchain: Option<DumbSwapchain>,
    cursor_position: (i32, i32),
    cursor_hotspot: (i32, i32),
    software_cursor: bool,
    /// Black frame used for modesets before anything was drawn.
    blank: Option<Rc<DrmFramebuffer>>,
}

impl DrmOutput {
    /// Sets up an output for `connector` on `crtc`. Nothing is committed yet.
    ///
    /// When a previous DRM master left the connector lit with the mode we want, that state is
    /// adopted and the first commit needs no modeset.
    pub fn new(
        objects: &DrmObjects,
        connector: connector::Handle,
        crtc: crtc::Handle,
        config: scanout_config::Output,
        default_position: (i32, i32),
        use_cursor_plane: bool,
    ) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("DrmOutput::new");

        let conn = objects.connector(connector).ok_or(KmsError::Removed)?;
        let drm_crtc = objects.crtc(crtc).ok_or(KmsError::Removed)?;
        let name = conn.output_name().clone();

        let (initial, custom_mode) = pipeline_config(conn, &config, default_position)?;
        let mut pipeline =
            DrmPipeline::new(connector, drm_crtc, use_cursor_plane, initial.clone())?;

        if initial.is_lit() && conn.crtc() == Some(crtc) && drm_crtc.is_active() {
            match drm_crtc.query_current_mode(&**objects.device()) {
                Ok(Some(current)) if initial.mode.is_some_and(|m| same_timing(&m, &current)) => {
                    debug!("{}: keeping the mode set by the previous master", name.connector);
                    pipeline.adopt(initial);
                }
                Ok(_) => debug!("{}: lit with a different mode", name.connector),
                Err(err) => debug!("{}: error querying the current mode: {err}", name.connector),
            }
        }

        Ok(Self {
            name,
            pipeline,
            config,
            pending_config: None,
            modes: conn.modes().to_vec(),
            physical_size: conn.physical_size(),
            vrr_capable: conn.is_vrr_capable(),
            custom_mode,
            dpms: DpmsMode::On,
            turn_off_pending: false,
            deferred_turn_off: false,
            deferred_gamma: None,
            cursor_swapchain: None,
            cursor_position: (0, 0),
            cursor_hotspot: (0, 0),
            software_cursor: false,
            blank: None,
        })
    }

    pub fn name(&self) -> &OutputName {
        &self.name
    }

    /// Forgets make, model and serial, leaving only the connector name.
    pub fn hide_monitor_name(&mut self) {
        self.name = OutputName::from_connector(self.name.connector.clone());
    }

    pub fn connector(&self) -> connector::Handle {
        self.pipeline.connector()
    }

    pub fn crtc(&self) -> crtc::Handle {
        self.pipeline.crtc()
    }

    pub fn pipeline(&self) -> &DrmPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut DrmPipeline {
        &mut self.pipeline
    }

    pub fn config(&self) -> &scanout_config::Output {
        &self.config
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn dpms(&self) -> DpmsMode {
        self.dpms
    }

    /// Whether the cursor has to be drawn into the frames.
    pub fn uses_software_cursor(&self) -> bool {
        self.software_cursor
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.effective().enabled
    }

    /// Enabled, powered and not waiting to be powered down.
    pub fn wants_frames(&self) -> bool {
        self.dpms.is_on() && self.pipeline.current().is_lit()
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.pipeline.current().mode.map(refresh_interval)
    }

    pub fn gamma_ramp_size(&self, objects: &DrmObjects) -> usize {
        objects
            .crtc(self.crtc())
            .map_or(0, |crtc| crtc.gamma_ramp_size())
    }

    /// Position and size in the global space, taking the queued configuration into account.
    pub fn logical_geometry(&self) -> Option<LogicalOutput> {
        let config = self.pipeline.effective();
        let mode = config.mode.filter(|_| config.enabled)?;
        let (w, h) = mode.size();
        let scale = config.scale.clamp(MIN_SCALE, MAX_SCALE);
        Some(LogicalOutput {
            x: config.position.0,
            y: config.position.1,
            width: (f64::from(w) / scale).round() as u32,
            height: (f64::from(h) / scale).round() as u32,
            scale,
        })
    }

    /// Queues the configuration `config` asks for.
    ///
    /// Gamma and the DPMS state carry over. Returns whether anything changed.
    pub fn queue_config(
        &mut self,
        connector: &DrmConnector,
        config: scanout_config::Output,
    ) -> Result<bool, KmsError> {
        let effective = self.pipeline.effective();
        let (mut candidate, custom_mode) =
            pipeline_config(connector, &config, effective.position)?;
        candidate.gamma = effective.gamma.clone();
        candidate.active = candidate.enabled && self.dpms.is_on();

        if self.pipeline.queue_changes(candidate) {
            self.pending_config = Some((config, custom_mode));
            return Ok(true);
        }
        self.pending_config = None;
        self.config = config;
        self.custom_mode = custom_mode;
        Ok(false)
    }

    /// Takes over the configuration of a candidate that is no longer queued.
    fn promote_pending_config(&mut self) {
        if self.pipeline.queued().is_some() {
            return;
        }
        if let Some((config, custom_mode)) = self.pending_config.take() {
            self.config = config;
            self.custom_mode = custom_mode;
        }
    }

    /// Queues turning the output on or off, keeping everything else.
    pub fn update_enablement(&mut self, enable: bool) -> bool {
        let mut candidate = self.pipeline.effective().clone();
        if enable && candidate.mode.is_none() {
            warn!("{}: cannot enable an output without a mode", self.name.connector);
            return false;
        }
        candidate.enabled = enable;
        candidate.active = enable && self.dpms.is_on();
        self.pipeline.queue_changes(candidate)
    }

    /// Tests and commits the queued configuration.
    ///
    /// The last frame is kept on screen if it still fits, otherwise a black frame is shown until
    /// the next present.
    pub fn apply_queued_changes(&mut self, objects: &mut DrmObjects) -> Result<bool, KmsError> {
        let Some(candidate) = self.pipeline.queued().cloned() else {
            return Ok(false);
        };
        let fb = self.frame_for(objects, &candidate)?;
        let res = self.pipeline.apply_queued_changes(objects, fb);
        match &res {
            Ok(_) => self.promote_pending_config(),
            Err(err) if !err.is_busy() => self.pending_config = None,
            Err(_) => (),
        }
        res
    }

    pub fn revert_queued_changes(&mut self) {
        self.pending_config = None;
        self.pipeline.revert_queued_changes();
    }

    /// Settles the candidate if the hardware does not need to change.
    ///
    /// Returns whether anything changed, or `None` when the candidate needs a commit.
    pub(super) fn settle_without_commit(&mut self) -> Option<bool> {
        let settled = self.pipeline.settle_without_commit();
        if settled.is_some() {
            self.promote_pending_config();
        }
        settled
    }

    /// Records that a commit carrying `staged` went through. `completed` tells that it was
    /// submitted without completion events.
    pub(super) fn commit_succeeded(
        &mut self,
        objects: &mut DrmObjects,
        staged: Staged,
        completed: bool,
    ) {
        if completed {
            self.pipeline.commit_completed(objects, staged);
        } else {
            self.pipeline.commit_succeeded(objects, staged);
        }
        self.promote_pending_config();
    }

    /// Commits the current configuration with `change` applied, without waiting for the queued
    /// candidate. The candidate gets the same change, so applying it later keeps it.
    fn commit_direct(
        &mut self,
        objects: &mut DrmObjects,
        change: impl Fn(&mut PipelineConfig),
    ) -> Result<(), KmsError> {
        let mut config = self.pipeline.current().clone();
        change(&mut config);
        if config != *self.pipeline.current() {
            let fb = self.frame_for(objects, &config)?;
            self.pipeline.commit_config(objects, config, fb)?;
        }

        if let Some(queued) = self.pipeline.queued_mut() {
            change(queued);
        }
        Ok(())
    }

    /// The frame to show with `candidate`: the one on screen if it fits, else a black one.
    pub(super) fn frame_for(
        &mut self,
        objects: &DrmObjects,
        candidate: &PipelineConfig,
    ) -> Result<Option<Rc<DrmFramebuffer>>, KmsError> {
        let Some(mode) = candidate.mode.filter(|_| candidate.is_lit()) else {
            return Ok(None);
        };

        let crtc = objects.crtc(self.crtc()).ok_or(KmsError::Removed)?;
        if let Some(fb) = crtc
            .next()
            .or(crtc.current())
            .filter(|fb| fb.matches_mode(&mode))
        {
            return Ok(Some(fb.clone()));
        }

        self.blank(objects.device(), &mode).map(Some)
    }

    fn blank(
        &mut self,
        device: &Rc<dyn KmsDevice>,
        mode: &Mode,
    ) -> Result<Rc<DrmFramebuffer>, KmsError> {
        if let Some(blank) = self.blank.as_ref().filter(|fb| fb.matches_mode(mode)) {
            return Ok(blank.clone());
        }

        let (w, h) = mode.size();
        let fb = Rc::new(DrmFramebuffer::dumb(
            device,
            (u32::from(w), u32::from(h)),
            DrmFourcc::Xrgb8888,
        )?);
        self.blank = Some(fb.clone());
        Ok(fb)
    }

    /// Shows `fb` with the next vblank.
    ///
    /// On error the frame was not shown and must be presented again or dropped.
    pub fn present(
        &mut self,
        objects: &mut DrmObjects,
        fb: Rc<DrmFramebuffer>,
    ) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmOutput::present");

        if !self.dpms.is_on() {
            return Err(KmsError::Inactive);
        }
        self.pipeline.present(objects, fb)
    }

    /// Handles a completion event for this output's CRTC.
    pub fn on_page_flip(&mut self, objects: &mut DrmObjects) -> FlipOutcome {
        let outcome = self.pipeline.page_flip(objects);
        if outcome != FlipOutcome::Completed {
            return outcome;
        }

        if self.deferred_turn_off {
            self.deferred_turn_off = false;
            debug!("{}: performing deferred power-down", self.name.connector);
            if let Err(err) = self.power_down(objects) {
                warn!("{}: error powering down: {err}", self.name.connector);
            }
        }
        if let Some(ramp) = self.deferred_gamma.take() {
            if let Err(err) = self.commit_gamma(objects, ramp) {
                warn!("{}: error setting gamma: {err}", self.name.connector);
            }
        }

        outcome
    }

    /// Sets the gamma ramp, `None` meaning linear.
    ///
    /// A ramp of the wrong size is refused before anything reaches the kernel, and a refused
    /// ramp leaves the previous one active. The ramp goes out on its own, without the queued
    /// candidate; while a commit is in flight it follows that commit's completion.
    pub fn set_gamma_ramp(
        &mut self,
        objects: &mut DrmObjects,
        ramp: Option<GammaRamp>,
    ) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmOutput::set_gamma_ramp");

        let crtc = objects.crtc(self.crtc()).ok_or(KmsError::Removed)?;
        if let Some(ramp) = &ramp {
            let expected = crtc.gamma_ramp_size();
            if ramp.size() != expected {
                return Err(KmsError::Malformed(format!(
                    "gamma ramp has {} entries, expected {expected}",
                    ramp.size()
                )));
            }
        }
        if !crtc.capabilities().contains(Capabilities::GAMMA_LUT) {
            return Err(KmsError::Unsupported("CRTC has no GAMMA_LUT property"));
        }

        if self.pipeline.is_applying() {
            debug!("{}: setting gamma after the pending commit", self.name.connector);
            self.deferred_gamma = Some(ramp);
            return Ok(());
        }
        self.deferred_gamma = None;
        self.commit_gamma(objects, ramp)
    }

    fn commit_gamma(
        &mut self,
        objects: &mut DrmObjects,
        ramp: Option<GammaRamp>,
    ) -> Result<(), KmsError> {
        self.commit_direct(objects, |config| config.gamma = ramp.clone())
    }

    /// Changes the power state.
    ///
    /// Powering down waits for `turn_off_delay`; the caller calls [`Self::turn_off`] when it
    /// elapses. Standby and Suspend power down like Off.
    pub fn set_dpms(
        &mut self,
        objects: &mut DrmObjects,
        mode: DpmsMode,
        turn_off_delay: Duration,
    ) -> Result<DpmsChange, KmsError> {
        let previous = self.dpms;
        self.dpms = mode;

        match (previous.is_on(), mode.is_on()) {
            (true, false) => {
                self.turn_off_pending = true;
                if turn_off_delay.is_zero() {
                    self.turn_off(objects)
                } else {
                    Ok(DpmsChange::TurnOffScheduled)
                }
            }
            (false, true) => {
                if self.turn_off_pending || self.deferred_turn_off {
                    debug!("{}: cancelling power-down", self.name.connector);
                    self.turn_off_pending = false;
                    self.deferred_turn_off = false;
                    return Ok(DpmsChange::TurnedOn);
                }

                match self.power_up(objects) {
                    Ok(()) => Ok(DpmsChange::TurnedOn),
                    Err(err) => {
                        self.dpms = previous;
                        Err(err)
                    }
                }
            }
            _ => Ok(DpmsChange::Unchanged),
        }
    }

    /// Performs a power-down requested through [`Self::set_dpms`], unless it was cancelled.
    pub fn turn_off(&mut self, objects: &mut DrmObjects) -> Result<DpmsChange, KmsError> {
        if !self.turn_off_pending {
            return Ok(DpmsChange::Unchanged);
        }
        self.turn_off_pending = false;

        if self.pipeline.is_applying() {
            debug!(
                "{}: deferring power-down until the pending commit completes",
                self.name.connector
            );
            self.deferred_turn_off = true;
            return Ok(DpmsChange::TurnOffScheduled);
        }

        self.power_down(objects)?;
        Ok(DpmsChange::TurnedOff)
    }

    fn power_down(&mut self, objects: &mut DrmObjects) -> Result<(), KmsError> {
        self.commit_direct(objects, |config| config.active = false)
    }

    fn power_up(&mut self, objects: &mut DrmObjects) -> Result<(), KmsError> {
        self.commit_direct(objects, |config| config.active = config.enabled)
    }

    /// Puts `image` on the cursor plane, or hides the cursor.
    ///
    /// Returns whether the hardware cursor is used. When the plane cannot take the image the
    /// output silently switches to a software cursor.
    pub fn update_cursor(
        &mut self,
        objects: &mut DrmObjects,
        image: Option<CursorImage<'_>>,
    ) -> bool {
        let _span = tracy_client::span!("DrmOutput::update_cursor");

        match self.try_update_cursor(objects, image) {
            Ok(()) => {
                if self.software_cursor {
                    debug!("{}: hardware cursor works again", self.name.connector);
                }
                self.software_cursor = false;
                true
            }
            Err(err) => {
                if !self.software_cursor {
                    debug!(
                        "{}: falling back to software cursor: {err}",
                        self.name.connector
                    );
                }
                self.software_cursor = true;
                if let Err(err) = self.pipeline.set_cursor(objects, None) {
                    trace!("{}: error hiding the cursor plane: {err}", self.name.connector);
                }
                false
            }
        }
    }

    fn try_update_cursor(
        &mut self,
        objects: &mut DrmObjects,
        image: Option<CursorImage<'_>>,
    ) -> Result<(), KmsError> {
        let Some(image) = image else {
            self.cursor_hotspot = (0, 0);
            return self.pipeline.set_cursor(objects, None);
        };

        if self.pipeline.cursor_plane().is_none() {
            return Err(KmsError::Unsupported("no cursor plane"));
        }

        let device = objects.device().clone();
        let plane_size = device.cursor_size();
        if image.size.0 > plane_size.0 || image.size.1 > plane_size.1 {
            return Err(KmsError::Unsupported("cursor image is larger than the cursor plane"));
        }
        let expected = image.size.0 as usize * image.size.1 as usize * 4;
        if image.pixels.len() != expected {
            return Err(KmsError::Malformed(format!(
                "cursor image has {} bytes, expected {expected}",
                image.pixels.len()
            )));
        }

        let mut swapchain = match self.cursor_swapchain.take() {
            Some(swapchain) => swapchain,
            None => DumbSwapchain::new(&device, plane_size, DrmFourcc::Argb8888, CURSOR_BUFFERS)?,
        };
        let fb = swapchain.acquire();
        self.cursor_swapchain = Some(swapchain);
        let fb = fb.ok_or(KmsError::Busy { attempts: 0 })?;

        fb.fill(&mut |data, pitch| copy_cursor(data, pitch as usize, &image))?;

        self.cursor_hotspot = image.hotspot;
        let position = cursor_origin(self.cursor_position, image.hotspot);
        self.pipeline
            .set_cursor(objects, Some(CursorPlacement { fb, position }))
    }

    /// Moves the cursor hotspot to `position` in mode pixels.
    ///
    /// Returns whether the hardware cursor moved, in which case a commit is needed to show it.
    pub fn move_cursor(&mut self, position: (i32, i32)) -> bool {
        self.cursor_position = position;
        if self.software_cursor || self.pipeline.cursor().is_none() {
            return false;
        }
        self.pipeline
            .move_cursor(cursor_origin(position, self.cursor_hotspot));
        true
    }

    /// Refreshes the mode list after a hotplug event.
    ///
    /// The committed configuration stays unless its mode disappeared, in which case a fallback
    /// mode is queued, or the output is disabled when nothing is left. Returns whether changes
    /// were queued.
    pub fn update_modes(&mut self, connector: &DrmConnector) -> bool {
        self.modes = connector.modes().to_vec();
        self.physical_size = connector.physical_size();
        self.vrr_capable = connector.is_vrr_capable();

        let mut candidate = self.pipeline.effective().clone();
        if !candidate.enabled || self.custom_mode {
            return false;
        }
        if candidate
            .mode
            .is_some_and(|mode| self.modes.iter().any(|m| same_timing(m, &mode)))
        {
            return false;
        }

        match resolve_mode(&self.name.connector, &self.modes, &self.config) {
            Some((mode, _)) => {
                info!(
                    "{}: active mode is gone, switching to {}x{}@{:.3}",
                    self.name.connector,
                    mode.size().0,
                    mode.size().1,
                    f64::from(mode_refresh_mhz(&mode)) / 1000.,
                );
                candidate.mode = Some(mode);
            }
            None => {
                warn!("{}: no modes left, disabling", self.name.connector);
                candidate.enabled = false;
                candidate.active = false;
                candidate.mode = None;
            }
        }
        self.pipeline.queue_changes(candidate)
    }

    /// Drops the cursor buffers and the blank frame.
    pub(super) fn release_buffers(&mut self) {
        self.cursor_swapchain = None;
        self.blank = None;
    }

    pub fn info(&self) -> OutputInfo {
        let current = self.pipeline.current();
        let current_mode = current
            .mode
            .filter(|_| current.enabled)
            .and_then(|mode| self.modes.iter().position(|m| same_timing(m, &mode)));

        OutputInfo {
            name: self.name.connector.clone(),
            make: self.name.make.clone(),
            model: self.name.model.clone(),
            serial: self.name.serial.clone(),
            physical_size: self.physical_size,
            modes: self.modes.iter().map(mode_info).collect(),
            current_mode,
            enabled: current.enabled,
            dpms: self.dpms.as_str().to_owned(),
            vrr_supported: self.vrr_capable,
            vrr_enabled: current.vrr,
            software_cursor: self.software_cursor,
            logical: self.logical_geometry(),
        }
    }
}

fn mode_info(mode: &Mode) -> ModeInfo {
    let (width, height) = mode.size();
    ModeInfo {
        width,
        height,
        refresh_rate: mode_refresh_mhz(mode) as u32,
        is_preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    }
}

/// Resolves the mode for `config`. The flag tells whether the mode is custom.
fn resolve_mode(
    connector: &str,
    modes: &[Mode],
    config: &scanout_config::Output,
) -> Option<(Mode, bool)> {
    if let Some(modeline) = &config.modeline {
        match calculate_drm_mode_from_modeline(modeline) {
            Ok(mode) => return Some((mode, true)),
            Err(err) => {
                warn!(
                    "{connector}: invalid custom modeline; \
                     falling back to advertised modes: {err:?}"
                );
            }
        }
    }

    let custom = config
        .mode
        .is_some_and(|m| m.custom && m.mode.refresh.is_some());
    let (mode, fallback) = pick_mode(modes, config.mode)?;

    if let (true, Some(target)) = (fallback, config.mode) {
        warn!(
            "{connector}: configured mode {}x{}{} could not be found, falling back to preferred",
            target.mode.width,
            target.mode.height,
            if let Some(refresh) = target.mode.refresh {
                format!("@{refresh}")
            } else {
                String::new()
            },
        );
    }

    Some((mode, custom))
}

/// The configuration `config` asks for on `connector`. The flag tells whether the mode is
/// custom.
fn pipeline_config(
    connector: &DrmConnector,
    config: &scanout_config::Output,
    default_position: (i32, i32),
) -> Result<(PipelineConfig, bool), KmsError> {
    let name = connector.name();
    let resolved = resolve_mode(name, connector.modes(), config);
    if resolved.is_none() && !config.off {
        return Err(KmsError::Unsupported("connector has no modes"));
    }

    let vrr = config.is_vrr_enabled();
    if vrr && !connector.is_vrr_capable() {
        warn!("{name}: cannot enable VRR because connector does not support it");
    }

    let enabled = !config.off;
    let pipeline_config = PipelineConfig {
        enabled,
        active: enabled,
        mode: resolved.map(|(mode, _)| mode),
        position: config
            .position
            .map_or(default_position, |pos| (pos.x, pos.y)),
        scale: config.scale.map_or(1., |scale| clamp_scale(name, scale.0)),
        vrr: vrr && connector.is_vrr_capable(),
        gamma: None,
    };
    if let Some(mode) = pipeline_config.mode {
        debug!("{name}: picking mode: {mode:?}");
    }

    Ok((pipeline_config, resolved.is_some_and(|(_, custom)| custom)))
}

fn clamp_scale(connector: &str, scale: f64) -> f64 {
    let clamped = scale.clamp(MIN_SCALE, MAX_SCALE);
    if clamped != scale {
        warn!("{connector}: scale {scale} is out of range, using {clamped}");
    }
    clamped
}

/// Where the top-left corner of the cursor image goes.
fn cursor_origin(position: (i32, i32), hotspot: (i32, i32)) -> (i32, i32) {
    (position.0 - hotspot.0, position.1 - hotspot.1)
}

/// Copies `image` into the top-left corner of a cursor buffer, clearing the rest.
fn copy_cursor(data: &mut [u8], pitch: usize, image: &CursorImage<'_>) {
    let (w, h) = (image.size.0 as usize, image.size.1 as usize);
    let row_len = w * 4;

    for (y, row) in data.chunks_mut(pitch).enumerate() {
        if y < h {
            let src = &image.pixels[y * row_len..(y + 1) * row_len];
            row[..row_len].copy_from_slice(src);
            row[row_len..].fill(0);
        } else {
            row.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use insta::assert_snapshot;

    use super::*;
    use crate::backend::tty::pipeline::PipelinePhase;
    use crate::kms::fake::{test_mode, FakeDevice};
    use crate::kms::{PlaneType, RetryPolicy};

    struct Setup {
        fake: Rc<FakeDevice>,
        objects: DrmObjects,
        connector: connector::Handle,
        crtc: crtc::Handle,
    }

    fn setup_with(cursor_plane: bool) -> Setup {
        let fake = Rc::new(FakeDevice::new());
        let crtc = fake.add_crtc(256);
        fake.add_plane(PlaneType::Primary, &[crtc]);
        if cursor_plane {
            fake.add_plane(PlaneType::Cursor, &[crtc]);
        }
        let connector = fake.add_connector(fake.default_modes(), &[crtc]);
        let objects = DrmObjects::discover(fake.clone(), RetryPolicy::no_retry()).unwrap();
        Setup {
            fake,
            objects,
            connector,
            crtc,
        }
    }

    fn setup() -> Setup {
        setup_with(true)
    }

    fn output(s: &Setup) -> DrmOutput {
        DrmOutput::new(
            &s.objects,
            s.connector,
            s.crtc,
            scanout_config::Output::default(),
            (0, 0),
            true,
        )
        .unwrap()
    }

    fn frame(s: &Setup) -> Rc<DrmFramebuffer> {
        Rc::new(
            DrmFramebuffer::dumb(s.objects.device(), (1920, 1080), DrmFourcc::Xrgb8888).unwrap(),
        )
    }

    /// Presents a frame and delivers its completion event.
    fn show_frame(s: &mut Setup, output: &mut DrmOutput) {
        let fb = frame(s);
        output.present(&mut s.objects, fb).unwrap();
        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        assert_eq!(output.on_page_flip(&mut s.objects), FlipOutcome::Completed);
    }

    #[test]
    fn picks_preferred_mode() {
        let s = setup();
        let output = output(&s);
        let mode = output.pipeline().current().mode.unwrap();
        assert_eq!(mode.size(), (1920, 1080));
        assert_eq!(mode_refresh_mhz(&mode) / 1000, 60);
        assert_eq!(output.pipeline().phase(), PipelinePhase::Idle);
    }

    #[test]
    fn configured_mode_and_position() {
        let s = setup();
        let config = scanout_config::Output {
            mode: Some(scanout_config::Mode {
                custom: false,
                mode: "1920x1080@144".parse().unwrap(),
            }),
            position: Some(scanout_config::Position { x: 100, y: 0 }),
            scale: Some(scanout_config::FloatOrInt(2.)),
            ..Default::default()
        };
        let output =
            DrmOutput::new(&s.objects, s.connector, s.crtc, config, (0, 0), true).unwrap();
        let geometry = output.logical_geometry().unwrap();
        assert_eq!((geometry.x, geometry.y), (100, 0));
        assert_eq!((geometry.width, geometry.height), (960, 540));
        let refresh = mode_refresh_mhz(&output.pipeline().current().mode.unwrap());
        assert!((refresh - 144_000).abs() <= 1, "{refresh}");
    }

    #[test]
    fn zero_scale_is_clamped() {
        let s = setup();
        let config = scanout_config::Output {
            scale: Some(scanout_config::FloatOrInt(0.)),
            ..Default::default()
        };
        let output =
            DrmOutput::new(&s.objects, s.connector, s.crtc, config, (0, 0), true).unwrap();
        let geometry = output.logical_geometry().unwrap();
        assert_eq!((geometry.width, geometry.height), (19200, 10800));
        assert_eq!(geometry.scale, MIN_SCALE);
    }

    #[test]
    fn adopts_matching_kernel_state() {
        let mut s = setup();
        let mode = test_mode(1920, 1080, 60, true);
        s.fake.light_up(s.crtc, mode);
        s.fake.route(s.connector, s.crtc);
        s.objects = DrmObjects::discover(s.fake.clone(), RetryPolicy::no_retry()).unwrap();

        let output = output(&s);
        assert_eq!(output.pipeline().phase(), PipelinePhase::Committed);
    }

    #[test]
    fn missing_cursor_plane_falls_back_silently() {
        let mut s = setup_with(false);
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        let pixels = vec![0xff; 24 * 24 * 4];
        let image = CursorImage {
            size: (24, 24),
            hotspot: (0, 0),
            pixels: &pixels,
        };
        assert!(!output.update_cursor(&mut s.objects, Some(image)));
        assert!(output.uses_software_cursor());
        assert!(!output.move_cursor((10, 10)));
    }

    #[test]
    fn rejected_cursor_plane_falls_back() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        s.fake.reject_property("CRTC_X");
        let pixels = vec![0xff; 24 * 24 * 4];
        let image = CursorImage {
            size: (24, 24),
            hotspot: (4, 4),
            pixels: &pixels,
        };
        assert!(!output.update_cursor(&mut s.objects, Some(image)));
        assert!(output.uses_software_cursor());
        assert!(output.pipeline().cursor().is_none());

        // Frames keep flowing without the cursor plane.
        s.fake.accept_property("CRTC_X");
        show_frame(&mut s, &mut output);
    }

    #[test]
    fn hardware_cursor_reaches_the_plane() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        assert!(!output.move_cursor((100, 50)));
        let pixels = vec![0xff; 2 * 2 * 4];
        let image = CursorImage {
            size: (2, 2),
            hotspot: (1, 1),
            pixels: &pixels,
        };
        assert!(output.update_cursor(&mut s.objects, Some(image)));
        assert!(!output.uses_software_cursor());

        let placement = output.pipeline().cursor().unwrap();
        assert_eq!(placement.position, (99, 49));
        let data = s.fake.framebuffer_data(placement.fb.handle()).unwrap();
        // 64x64 plane, pitch 256: first two pixels of each of the first two rows are set.
        assert!(data[..8].iter().all(|&b| b == 0xff));
        assert!(data[8..256].iter().all(|&b| b == 0));
        assert!(data[256..264].iter().all(|&b| b == 0xff));
        assert!(data[512..].iter().all(|&b| b == 0));

        assert!(output.move_cursor((200, 100)));
        show_frame(&mut s, &mut output);
        let plane = s.objects.plane(output.pipeline().cursor_plane().unwrap()).unwrap();
        assert_eq!(plane.object().value("CRTC_X"), Some(199));
    }

    #[test]
    fn wrong_size_gamma_is_refused_without_ioctl() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);
        s.fake.clear_commits();
        let blobs = s.fake.blob_count();

        let err = output
            .set_gamma_ramp(&mut s.objects, Some(GammaRamp::linear(255)))
            .unwrap_err();
        assert!(matches!(err, KmsError::Malformed(_)));
        assert!(s.fake.commits().is_empty());
        assert_eq!(s.fake.blob_count(), blobs);
    }

    #[test]
    fn gamma_ramp_is_committed() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        output
            .set_gamma_ramp(&mut s.objects, Some(GammaRamp::linear(256)))
            .unwrap();
        assert_ne!(s.fake.property_value(s.crtc.into(), "GAMMA_LUT"), Some(0));
        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        output.on_page_flip(&mut s.objects);
        assert!(output.pipeline().current().gamma.is_some());

        output.set_gamma_ramp(&mut s.objects, None).unwrap();
        assert_eq!(s.fake.property_value(s.crtc.into(), "GAMMA_LUT"), Some(0));
    }

    fn queue_mode(s: &Setup, output: &mut DrmOutput, mode: &str) {
        let config = scanout_config::Output {
            mode: Some(scanout_config::Mode {
                custom: false,
                mode: mode.parse().unwrap(),
            }),
            ..Default::default()
        };
        let connector = s.objects.connector(s.connector).unwrap();
        assert!(output.queue_config(connector, config).unwrap());
    }

    #[test]
    fn gamma_leaves_queued_mode_alone() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);
        queue_mode(&s, &mut output, "1280x720");

        output
            .set_gamma_ramp(&mut s.objects, Some(GammaRamp::linear(256)))
            .unwrap();
        assert_eq!(s.fake.crtc_mode(s.crtc).unwrap().size(), (1920, 1080));
        assert_ne!(s.fake.property_value(s.crtc.into(), "GAMMA_LUT"), Some(0));
        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        assert_eq!(output.on_page_flip(&mut s.objects), FlipOutcome::Completed);

        // Still waiting for approval, now with the new ramp.
        let queued = output.pipeline().queued().unwrap();
        assert_eq!(queued.mode.unwrap().size(), (1280, 720));
        assert!(queued.gamma.is_some());

        output.revert_queued_changes();
        assert_eq!(output.pipeline().phase(), PipelinePhase::Committed);
        let current = output.pipeline().current();
        assert_eq!(current.mode.unwrap().size(), (1920, 1080));
        assert!(current.gamma.is_some());
        assert_eq!(s.fake.crtc_mode(s.crtc).unwrap().size(), (1920, 1080));
    }

    #[test]
    fn gamma_waits_for_frame_in_flight() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);
        output.present(&mut s.objects, frame(&s)).unwrap();

        s.fake.clear_commits();
        output
            .set_gamma_ramp(&mut s.objects, Some(GammaRamp::linear(256)))
            .unwrap();
        assert!(s.fake.commits().is_empty());

        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        assert_eq!(output.on_page_flip(&mut s.objects), FlipOutcome::Completed);
        assert_ne!(s.fake.property_value(s.crtc.into(), "GAMMA_LUT"), Some(0));
        assert!(output.pipeline().queued().is_none());
    }

    #[test]
    fn power_down_leaves_queued_mode_alone() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);
        queue_mode(&s, &mut output, "1280x720");

        let change = output
            .set_dpms(&mut s.objects, DpmsMode::Off, Duration::ZERO)
            .unwrap();
        assert_eq!(change, DpmsChange::TurnedOff);
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(0));
        assert_eq!(s.fake.crtc_mode(s.crtc).unwrap().size(), (1920, 1080));

        let queued = output.pipeline().queued().unwrap();
        assert_eq!(queued.mode.unwrap().size(), (1280, 720));
        assert!(!queued.active);
    }

    #[test]
    fn dpms_off_after_delay() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        let change = output
            .set_dpms(&mut s.objects, DpmsMode::Off, Duration::from_millis(250))
            .unwrap();
        assert_eq!(change, DpmsChange::TurnOffScheduled);
        // Still lit until the timer fires.
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(1));
        assert!(matches!(
            output.present(&mut s.objects, frame(&s)),
            Err(KmsError::Inactive)
        ));

        assert_eq!(output.turn_off(&mut s.objects).unwrap(), DpmsChange::TurnedOff);
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(0));
        assert!(s.objects.crtc(s.crtc).unwrap().current().is_none());

        let change = output
            .set_dpms(&mut s.objects, DpmsMode::On, Duration::ZERO)
            .unwrap();
        assert_eq!(change, DpmsChange::TurnedOn);
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(1));

        // The modeset shows a black frame first.
        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        assert_eq!(output.on_page_flip(&mut s.objects), FlipOutcome::Completed);
        show_frame(&mut s, &mut output);
    }

    #[test]
    fn dpms_on_cancels_pending_turn_off() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        output
            .set_dpms(&mut s.objects, DpmsMode::Standby, Duration::from_millis(250))
            .unwrap();
        let change = output
            .set_dpms(&mut s.objects, DpmsMode::On, Duration::from_millis(250))
            .unwrap();
        assert_eq!(change, DpmsChange::TurnedOn);

        s.fake.clear_commits();
        assert_eq!(output.turn_off(&mut s.objects).unwrap(), DpmsChange::Unchanged);
        assert!(s.fake.commits().is_empty());
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(1));
    }

    #[test]
    fn turn_off_mid_flight_waits_for_completion() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        output.present(&mut s.objects, frame(&s)).unwrap();
        assert!(output.pipeline().is_applying());

        let change = output
            .set_dpms(&mut s.objects, DpmsMode::Off, Duration::ZERO)
            .unwrap();
        assert_eq!(change, DpmsChange::TurnOffScheduled);
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(1));

        assert_eq!(s.fake.take_flips(), vec![s.crtc]);
        assert_eq!(output.on_page_flip(&mut s.objects), FlipOutcome::Completed);
        assert_eq!(s.fake.property_value(s.crtc.into(), "ACTIVE"), Some(0));
        assert!(!s.fake.has_pending_flip(s.crtc));
    }

    #[test]
    fn vanished_mode_falls_back() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        s.fake
            .set_modes(s.connector, vec![test_mode(1280, 720, 60, true)]);
        assert!(s.objects.rescan_connectors().unwrap().is_empty());
        let connector = s.objects.connector(s.connector).unwrap();
        assert!(output.update_modes(connector));
        assert!(output.apply_queued_changes(&mut s.objects).unwrap());
        assert_eq!(s.fake.crtc_mode(s.crtc).unwrap().size(), (1280, 720));
    }

    #[test]
    fn rejected_modeline_keeps_previous_configuration() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);
        s.fake.set_max_mode_width(1920);

        let config = scanout_config::Output {
            modeline: Some(scanout_config::Modeline {
                clock: 241.5,
                hdisplay: 2560,
                hsync_start: 2608,
                hsync_end: 2640,
                htotal: 2720,
                vdisplay: 1440,
                vsync_start: 1443,
                vsync_end: 1448,
                vtotal: 1481,
                hsync_polarity: scanout_config::HSyncPolarity::PHSync,
                vsync_polarity: scanout_config::VSyncPolarity::NVSync,
            }),
            ..Default::default()
        };
        let connector = s.objects.connector(s.connector).unwrap();
        assert!(output.queue_config(connector, config).unwrap());
        let err = output.apply_queued_changes(&mut s.objects).unwrap_err();
        assert!(matches!(err, KmsError::Rejected(_)), "{err:?}");
        assert!(output.config().modeline.is_none());

        // The advertised modes still drive the fallback.
        s.fake
            .set_modes(s.connector, vec![test_mode(1280, 720, 60, true)]);
        assert!(s.objects.rescan_connectors().unwrap().is_empty());
        let connector = s.objects.connector(s.connector).unwrap();
        assert!(output.update_modes(connector));
        assert!(output.apply_queued_changes(&mut s.objects).unwrap());
        assert_eq!(s.fake.crtc_mode(s.crtc).unwrap().size(), (1280, 720));
    }

    #[test]
    fn applied_configuration_is_kept() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        queue_mode(&s, &mut output, "1280x720");
        assert!(output.config().mode.is_none());
        assert!(output.apply_queued_changes(&mut s.objects).unwrap());
        let mode = output.config().mode.unwrap();
        assert_eq!((mode.mode.width, mode.mode.height), (1280, 720));
    }

    #[test]
    fn unchanged_modes_keep_configuration() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        let connector = s.objects.connector(s.connector).unwrap();
        assert!(!output.update_modes(connector));
        assert_eq!(output.pipeline().phase(), PipelinePhase::Committed);
    }

    #[test]
    fn info_snapshot() {
        let mut s = setup();
        let mut output = output(&s);
        show_frame(&mut s, &mut output);

        let info = serde_json::to_string_pretty(&output.info()).unwrap();
        assert_snapshot!(info, @r#"
        {
          "name": "DP-1",
          "make": null,
          "model": null,
          "serial": null,
          "physical_size": [
            600,
            340
          ],
          "modes": [
            {
              "width": 1920,
              "height": 1080,
              "refresh_rate": 60000,
              "is_preferred": true
            },
            {
              "width": 1920,
              "height": 1080,
              "refresh_rate": 143999,
              "is_preferred": false
            },
            {
              "width": 1280,
              "height": 720,
              "refresh_rate": 60000,
              "is_preferred": false
            }
          ],
          "current_mode": 0,
          "enabled": true,
          "dpms": "on",
          "vrr_supported": false,
          "vrr_enabled": false,
          "software_cursor": false,
          "logical": {
            "x": 0,
            "y": 0,
            "width": 1920,
            "height": 1080,
            "scale": 1.0
          }
        }
        "#);
    }
}
