//! One connector, its CRTC and planes, driven as a unit.

use std::rc::Rc;

use smithay::reexports::drm::control::{connector, crtc, plane, Mode};

use crate::kms::{
    same_timing, AtomicCommit, DrmCrtc, DrmFramebuffer, DrmObjects, FlipOutcome, GammaRamp,
    KmsError, KmsObject, PropertyBlob,
};

/// Where a pipeline is in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Nothing was committed yet.
    Idle,
    /// The last configuration is active and confirmed by the kernel.
    Committed,
    /// A candidate configuration waits for [`DrmPipeline::apply_queued_changes`].
    Queued,
    /// A candidate is being checked with a test-only commit.
    Testing,
    /// A commit was submitted and its completion event is outstanding.
    Applying,
}

/// The state of one output as far as the kernel is concerned, plus its placement.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub enabled: bool,
    /// `false` keeps the mode but powers the CRTC down (DPMS).
    pub active: bool,
    pub mode: Option<Mode>,
    pub position: (i32, i32),
    pub scale: f64,
    pub vrr: bool,
    /// `None` leaves the hardware LUT empty, i.e. linear.
    pub gamma: Option<GammaRamp>,
}

impl PipelineConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            active: false,
            mode: None,
            position: (0, 0),
            scale: 1.,
            vrr: false,
            gamma: None,
        }
    }

    pub fn with_mode(mode: Mode) -> Self {
        Self {
            enabled: true,
            active: true,
            mode: Some(mode),
            ..Self::disabled()
        }
    }

    /// Enabled and powered on.
    pub fn is_lit(&self) -> bool {
        self.enabled && self.active
    }

    fn same_mode(&self, other: &Self) -> bool {
        match (&self.mode, &other.mode) {
            (Some(a), Some(b)) => same_timing(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether going from `self` to `other` needs `ALLOW_MODESET`.
    fn needs_modeset_to(&self, other: &Self) -> bool {
        self.enabled != other.enabled || self.active != other.active || !self.same_mode(other)
    }

    /// Equal in everything the kernel sees; placement is ours alone.
    fn same_hardware_state(&self, other: &Self) -> bool {
        self.enabled == other.enabled
            && self.active == other.active
            && self.same_mode(other)
            && self.vrr == other.vrr
            && self.gamma == other.gamma
    }
}

impl PartialEq for PipelineConfig {
    fn eq(&self, other: &Self) -> bool {
        self.same_hardware_state(other)
            && self.position == other.position
            && self.scale == other.scale
    }
}

/// Cursor image and where its top-left corner goes, in mode pixels.
#[derive(Debug, Clone)]
pub struct CursorPlacement {
    pub fb: Rc<DrmFramebuffer>,
    pub position: (i32, i32),
}

#[derive(Debug)]
struct ModeBlob {
    mode: Mode,
    blob: PropertyBlob,
}

#[derive(Debug)]
struct GammaBlob {
    ramp: GammaRamp,
    blob: PropertyBlob,
}

/// What one pipeline contributed to a commit, kept until the commit is settled.
#[derive(Debug)]
pub(super) struct Staged {
    config: PipelineConfig,
    fb: Option<Rc<DrmFramebuffer>>,
    cursor_fb: Option<Rc<DrmFramebuffer>>,
    mode_blob: Option<ModeBlob>,
    gamma_blob: Option<GammaBlob>,
    modeset: bool,
    event: bool,
}

impl Staged {
    pub fn is_modeset(&self) -> bool {
        self.modeset
    }

    /// Whether the CRTC stays lit and a completion event will follow.
    pub fn has_event(&self) -> bool {
        self.event
    }
}

#[derive(Debug)]
pub struct DrmPipeline {
    connector: connector::Handle,
    crtc: crtc::Handle,
    primary_plane: plane::Handle,
    cursor_plane: Option<plane::Handle>,
    phase: PipelinePhase,
    /// Whether any commit went through (or the kernel state was adopted).
    committed: bool,
    current: PipelineConfig,
    queued: Option<PipelineConfig>,
    in_flight: Option<PipelineConfig>,
    cursor: Option<CursorPlacement>,
    force_modeset: bool,
    mode_blob: Option<ModeBlob>,
    gamma_blob: Option<GammaBlob>,
}

impl DrmPipeline {
    /// Binds `connector` to `crtc` and its planes. Nothing reaches the kernel until the first
    /// commit, which is a modeset to `initial`.
    pub fn new(
        connector: connector::Handle,
        crtc: &DrmCrtc,
        use_cursor_plane: bool,
        initial: PipelineConfig,
    ) -> Result<Self, KmsError> {
        let primary_plane = crtc
            .primary_plane()
            .ok_or(KmsError::Unsupported("CRTC has no primary plane"))?;

        Ok(Self {
            connector,
            crtc: crtc.handle(),
            primary_plane,
            cursor_plane: crtc.cursor_plane().filter(|_| use_cursor_plane),
            phase: PipelinePhase::Idle,
            committed: false,
            current: initial,
            queued: None,
            in_flight: None,
            cursor: None,
            force_modeset: false,
            mode_blob: None,
            gamma_blob: None,
        })
    }

    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    pub fn primary_plane(&self) -> plane::Handle {
        self.primary_plane
    }

    pub fn cursor_plane(&self) -> Option<plane::Handle> {
        self.cursor_plane
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// The last configuration the kernel confirmed (or the initial one while idle).
    pub fn current(&self) -> &PipelineConfig {
        &self.current
    }

    pub fn queued(&self) -> Option<&PipelineConfig> {
        self.queued.as_ref()
    }

    pub(super) fn queued_mut(&mut self) -> Option<&mut PipelineConfig> {
        self.queued.as_mut()
    }

    /// What the output will look like once the queued candidate is applied.
    pub fn effective(&self) -> &PipelineConfig {
        self.queued.as_ref().unwrap_or(&self.current)
    }

    pub fn is_applying(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn cursor(&self) -> Option<&CursorPlacement> {
        self.cursor.as_ref()
    }

    fn resting_phase(&self) -> PipelinePhase {
        if self.in_flight.is_some() {
            PipelinePhase::Applying
        } else if self.queued.is_some() {
            PipelinePhase::Queued
        } else if self.committed {
            PipelinePhase::Committed
        } else {
            PipelinePhase::Idle
        }
    }

    fn set_phase(&mut self, phase: PipelinePhase) {
        if self.phase != phase {
            trace!("{:?}: {:?} -> {phase:?}", self.crtc, self.phase);
            self.phase = phase;
        }
    }

    /// Takes over what the kernel is already showing, so that the first commit need not be a
    /// modeset.
    pub fn adopt(&mut self, config: PipelineConfig) {
        debug!("{:?}: adopting the kernel configuration", self.crtc);
        self.current = config;
        self.committed = true;
        let phase = self.resting_phase();
        self.set_phase(phase);
    }

    /// Stages `config` as the candidate. Returns `false` when it equals the current
    /// configuration and nothing was queued.
    ///
    /// The hardware is not touched.
    pub fn queue_changes(&mut self, config: PipelineConfig) -> bool {
        if config == self.current && !self.force_modeset {
            self.queued = None;
            let phase = self.resting_phase();
            self.set_phase(phase);
            return false;
        }

        self.queued = Some(config);
        let phase = self.resting_phase();
        self.set_phase(phase);
        true
    }

    /// Drops the candidate without touching the hardware.
    pub fn revert_queued_changes(&mut self) {
        if self.queued.take().is_some() {
            debug!("{:?}: reverting queued changes", self.crtc);
        }
        let phase = self.resting_phase();
        self.set_phase(phase);
    }

    /// Tests the candidate and commits it.
    ///
    /// `fb` is shown on the primary plane if the candidate lights the output up. Returns whether
    /// anything changed. A rejected candidate is discarded; a busy device keeps it queued.
    pub fn apply_queued_changes(
        &mut self,
        objects: &mut DrmObjects,
        fb: Option<Rc<DrmFramebuffer>>,
    ) -> Result<bool, KmsError> {
        let _span = tracy_client::span!("DrmPipeline::apply_queued_changes");

        if let Some(changed) = self.settle_without_commit() {
            return Ok(changed);
        }
        let Some(candidate) = self.queued.clone() else {
            return Ok(false);
        };

        if self.in_flight.is_some() {
            return Err(KmsError::Busy { attempts: 0 });
        }

        let mut commit = AtomicCommit::new();
        let res = self
            .stage(objects, &mut commit, candidate, fb)
            .and_then(|staged| self.commit_staged(objects, commit, staged, true));

        match res {
            Ok(()) => Ok(true),
            Err(err) => {
                if !err.is_busy() {
                    self.queued = None;
                }
                let phase = self.resting_phase();
                self.set_phase(phase);
                Err(err)
            }
        }
    }

    /// Tests and commits `config` right away, leaving the queued candidate alone.
    ///
    /// Used for changes that do not wait for the candidate, such as gamma and DPMS. Fails with
    /// `Busy { attempts: 0 }` while a commit is in flight.
    pub fn commit_config(
        &mut self,
        objects: &mut DrmObjects,
        config: PipelineConfig,
        fb: Option<Rc<DrmFramebuffer>>,
    ) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmPipeline::commit_config");

        if self.in_flight.is_some() {
            return Err(KmsError::Busy { attempts: 0 });
        }

        let mut commit = AtomicCommit::new();
        let staged = self.stage(objects, &mut commit, config, fb)?;
        self.commit_staged(objects, commit, staged, true)
    }

    /// Settles the candidate if the hardware does not need to change.
    ///
    /// Returns whether anything changed, or `None` when the candidate needs a commit.
    pub(super) fn settle_without_commit(&mut self) -> Option<bool> {
        let Some(candidate) = &self.queued else {
            return Some(false);
        };
        if !self.committed || self.force_modeset {
            return None;
        }

        if *candidate == self.current {
            self.revert_queued_changes();
            return Some(false);
        }
        if !candidate.same_hardware_state(&self.current) {
            return None;
        }

        debug!("{:?}: applying placement-only change", self.crtc);
        self.current = self.queued.take()?;
        let phase = self.resting_phase();
        self.set_phase(phase);
        Some(true)
    }

    /// Marks the pipeline as being tested as part of a larger commit, or done with it.
    pub(super) fn set_testing(&mut self, testing: bool) {
        let phase = if testing {
            PipelinePhase::Testing
        } else {
            self.resting_phase()
        };
        self.set_phase(phase);
    }

    /// Shows `fb` with the next vblank.
    ///
    /// Fails with `Busy { attempts: 0 }` while a previous commit is in flight. On failure the
    /// buffer slots are untouched and `fb` is not displayed.
    pub fn present(
        &mut self,
        objects: &mut DrmObjects,
        fb: Rc<DrmFramebuffer>,
    ) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmPipeline::present");

        if self.in_flight.is_some() {
            return Err(KmsError::Busy { attempts: 0 });
        }
        if objects
            .crtc(self.crtc)
            .ok_or(KmsError::Removed)?
            .is_flip_pending()
        {
            return Err(KmsError::Busy { attempts: 0 });
        }
        if !self.current.is_lit() {
            return Err(KmsError::Inactive);
        }

        let mut commit = AtomicCommit::new();
        let staged = self.stage(objects, &mut commit, self.current.clone(), Some(fb))?;
        let test = staged.is_modeset();
        if test {
            debug!("{:?}: presenting with a modeset", self.crtc);
        }
        self.commit_staged(objects, commit, staged, test)
    }

    /// Changes the hardware cursor, checking with the kernel first.
    ///
    /// On failure the previous cursor stays. The change reaches the screen with the next commit.
    pub fn set_cursor(
        &mut self,
        objects: &mut DrmObjects,
        cursor: Option<CursorPlacement>,
    ) -> Result<(), KmsError> {
        if cursor.is_some() && self.cursor_plane.is_none() {
            return Err(KmsError::Unsupported("no cursor plane"));
        }

        let previous = std::mem::replace(&mut self.cursor, cursor);

        let crtc = objects.crtc(self.crtc).ok_or(KmsError::Removed)?;
        let fb = crtc.next().or(crtc.current()).cloned();
        let Some(fb) = fb.filter(|_| self.current.is_lit() && self.committed) else {
            // Checked together with the next modeset.
            return Ok(());
        };

        let mut commit = AtomicCommit::new();
        let res = self
            .stage(objects, &mut commit, self.current.clone(), Some(fb))
            .and_then(|_staged| objects.test(commit));
        if res.is_err() {
            self.cursor = previous;
        }
        res
    }

    /// Moves the cursor without re-validating; the plane keeps its size and buffer.
    pub fn move_cursor(&mut self, position: (i32, i32)) {
        if let Some(cursor) = &mut self.cursor {
            cursor.position = position;
        }
    }

    /// Accounts for a completion event on this pipeline's CRTC.
    pub fn page_flip(&mut self, objects: &mut DrmObjects) -> FlipOutcome {
        let Some(crtc) = objects.crtc_mut(self.crtc) else {
            return FlipOutcome::Unexpected;
        };

        let outcome = crtc.page_flip_event();
        if outcome == FlipOutcome::Completed {
            self.flip_completed(objects);
        }
        outcome
    }

    /// Promotes the in-flight buffers of the planes and the in-flight configuration.
    fn flip_completed(&mut self, objects: &mut DrmObjects) {
        for plane in [Some(self.primary_plane), self.cursor_plane].into_iter().flatten() {
            if let Some(plane) = objects.plane_mut(plane) {
                plane.flip_buffer();
            }
        }

        if let Some(config) = self.in_flight.take() {
            self.current = config;
        }
        let phase = self.resting_phase();
        self.set_phase(phase);
    }

    /// Makes the next commit a full modeset and forgets buffers, e.g. after the session was
    /// inactive and someone else drove the hardware.
    pub fn force_modeset(&mut self, objects: &mut DrmObjects) {
        self.force_modeset = true;
        self.release_buffers(objects);
        self.in_flight = None;
        let phase = self.resting_phase();
        self.set_phase(phase);
    }

    /// Stages the switch-off of every object of this pipeline.
    pub(super) fn stage_disable(
        &mut self,
        objects: &mut DrmObjects,
        commit: &mut AtomicCommit,
    ) -> Result<(), KmsError> {
        // The connector may already be gone from the device.
        if let Some(connector) = objects.connector_mut(self.connector) {
            connector.disable(commit)?;
        }
        if let Some(crtc) = objects.crtc_mut(self.crtc) {
            crtc.disable(commit)?;
        }
        for plane in [Some(self.primary_plane), self.cursor_plane].into_iter().flatten() {
            if let Some(plane) = objects.plane_mut(plane) {
                plane.disable(commit)?;
            }
        }
        commit.set_allow_modeset(true);
        Ok(())
    }

    /// Drops every buffer reference after the pipeline was switched off or lost.
    ///
    /// An outstanding completion event for the CRTC will be recognized as stale.
    pub(super) fn release(&mut self, objects: &mut DrmObjects) {
        self.release_buffers(objects);
        self.in_flight = None;
        self.queued = None;
        self.cursor = None;
        self.mode_blob = None;
        self.gamma_blob = None;
        self.current.enabled = false;
        self.current.active = false;
        let phase = self.resting_phase();
        self.set_phase(phase);
    }

    fn release_buffers(&mut self, objects: &mut DrmObjects) {
        if let Some(crtc) = objects.crtc_mut(self.crtc) {
            crtc.release_buffers();
        }
        for plane in [Some(self.primary_plane), self.cursor_plane].into_iter().flatten() {
            if let Some(plane) = objects.plane_mut(plane) {
                plane.release_buffers();
            }
        }
    }

    fn needs_modeset(&self, config: &PipelineConfig) -> bool {
        !self.committed || self.force_modeset || self.current.needs_modeset_to(config)
    }

    /// Stages the full state for `config` into `commit`.
    ///
    /// On error nothing of this pipeline stays staged.
    pub(super) fn stage(
        &mut self,
        objects: &mut DrmObjects,
        commit: &mut AtomicCommit,
        config: PipelineConfig,
        fb: Option<Rc<DrmFramebuffer>>,
    ) -> Result<Staged, KmsError> {
        let res = self.stage_inner(objects, commit, config, fb);
        if res.is_err() {
            self.revert_objects(objects);
        }
        res
    }

    fn stage_inner(
        &mut self,
        objects: &mut DrmObjects,
        commit: &mut AtomicCommit,
        config: PipelineConfig,
        fb: Option<Rc<DrmFramebuffer>>,
    ) -> Result<Staged, KmsError> {
        let lit = config.is_lit();
        let mode = match (config.enabled, config.mode) {
            (true, Some(mode)) => Some(mode),
            (true, None) => {
                return Err(KmsError::Malformed(String::from(
                    "enabled output without a mode",
                )))
            }
            (false, _) => None,
        };
        let fb = fb.filter(|_| lit);
        if lit && fb.is_none() {
            return Err(KmsError::Malformed(String::from(
                "active output without a buffer",
            )));
        }

        let device = objects.device().clone();

        let mut mode_blob = None;
        let mode_id = match mode {
            None => 0,
            Some(mode) => match &self.mode_blob {
                Some(current) if same_timing(&current.mode, &mode) => current.blob.id(),
                _ => {
                    let blob = PropertyBlob::mode(&device, &mode)?;
                    let id = blob.id();
                    mode_blob = Some(ModeBlob { mode, blob });
                    id
                }
            },
        };

        let crtc = objects.crtc(self.crtc).ok_or(KmsError::Removed)?;
        let has_gamma_lut = crtc.object().has("GAMMA_LUT");
        let gamma_size = crtc.gamma_ramp_size();

        let mut gamma_blob = None;
        let gamma_id = match &config.gamma {
            Some(_) if !has_gamma_lut => {
                return Err(KmsError::Unsupported("CRTC has no GAMMA_LUT property"));
            }
            Some(ramp) if ramp.size() != gamma_size => {
                return Err(KmsError::Malformed(format!(
                    "gamma ramp has {} entries, expected {gamma_size}",
                    ramp.size()
                )));
            }
            Some(ramp) => match &self.gamma_blob {
                Some(current) if current.ramp == *ramp => Some(current.blob.id()),
                _ => {
                    let blob = PropertyBlob::new(&device, &mut ramp.to_blob_data())?;
                    let id = blob.id();
                    gamma_blob = Some(GammaBlob {
                        ramp: ramp.clone(),
                        blob,
                    });
                    Some(id)
                }
            },
            None => has_gamma_lut.then_some(0),
        };

        let connector = objects
            .connector_mut(self.connector)
            .ok_or(KmsError::Removed)?;
        if config.enabled {
            connector.stage_crtc(self.crtc)?;
        } else {
            connector.object_mut().stage("CRTC_ID", 0)?;
        }
        commit.add(connector.object());

        let crtc = objects.crtc_mut(self.crtc).ok_or(KmsError::Removed)?;
        let object = crtc.object_mut();
        object.stage("MODE_ID", mode_id)?;
        object.stage("ACTIVE", u64::from(lit))?;
        object.stage_optional("VRR_ENABLED", u64::from(lit && config.vrr))?;
        if let Some(gamma_id) = gamma_id {
            object.stage("GAMMA_LUT", gamma_id)?;
        }
        commit.add(crtc.object());

        let primary = objects
            .plane_mut(self.primary_plane)
            .ok_or(KmsError::Removed)?;
        match (&fb, mode) {
            (Some(fb), Some(mode)) => {
                let (w, h) = mode.size();
                primary.stage_buffer(self.crtc, fb, (0, 0, u32::from(w), u32::from(h)))?;
                commit.add(primary.object());
            }
            _ => primary.disable(commit)?,
        }

        let mut cursor_fb = None;
        if let Some(handle) = self.cursor_plane {
            let plane = objects.plane_mut(handle).ok_or(KmsError::Removed)?;
            match self.cursor.as_ref().filter(|_| lit) {
                Some(cursor) => {
                    let (w, h) = cursor.fb.size();
                    let (x, y) = cursor.position;
                    plane.stage_buffer(self.crtc, &cursor.fb, (x, y, w, h))?;
                    commit.add(plane.object());
                    cursor_fb = Some(cursor.fb.clone());
                }
                None => plane.disable(commit)?,
            }
        }

        let modeset = self.needs_modeset(&config);
        commit.set_allow_modeset(modeset);
        if lit {
            commit.request_flip_event(self.crtc);
        }

        Ok(Staged {
            config,
            fb,
            cursor_fb,
            mode_blob,
            gamma_blob,
            modeset,
            event: lit,
        })
    }

    fn revert_objects(&self, objects: &mut DrmObjects) {
        if let Some(connector) = objects.connector_mut(self.connector) {
            connector.object_mut().revert_pending();
        }
        if let Some(crtc) = objects.crtc_mut(self.crtc) {
            crtc.object_mut().revert_pending();
        }
        for plane in [Some(self.primary_plane), self.cursor_plane].into_iter().flatten() {
            if let Some(plane) = objects.plane_mut(plane) {
                plane.object_mut().revert_pending();
            }
        }
    }

    /// Tests (if asked) and submits a commit carrying only this pipeline, then settles it.
    fn commit_staged(
        &mut self,
        objects: &mut DrmObjects,
        commit: AtomicCommit,
        staged: Staged,
        test: bool,
    ) -> Result<(), KmsError> {
        if test {
            self.set_phase(PipelinePhase::Testing);
            if let Err(err) = commit.test(&**objects.device()) {
                debug!("{:?}: test commit failed: {err}", self.crtc);
                objects.finish(&commit, false);
                let phase = self.resting_phase();
                self.set_phase(phase);
                return Err(err);
            }
        }

        match objects.submit(commit) {
            Ok(()) => {
                self.commit_succeeded(objects, staged);
                Ok(())
            }
            Err(err) => {
                if test {
                    warn!("{:?}: commit failed after a passing test: {err}", self.crtc);
                } else {
                    debug!("{:?}: commit failed: {err}", self.crtc);
                }
                let phase = self.resting_phase();
                self.set_phase(phase);
                Err(err)
            }
        }
    }

    /// Records a commit carrying `staged` that was submitted without completion events.
    ///
    /// The kernel was done when the submission returned, so the new state is on screen.
    pub(super) fn commit_completed(&mut self, objects: &mut DrmObjects, staged: Staged) {
        let event = staged.event;
        self.commit_succeeded(objects, staged);
        if event {
            if let Some(crtc) = objects.crtc_mut(self.crtc) {
                crtc.flip_buffer();
            }
            self.flip_completed(objects);
        }
    }

    /// Records a successfully submitted commit carrying `staged`.
    pub(super) fn commit_succeeded(&mut self, objects: &mut DrmObjects, staged: Staged) {
        let Staged {
            config,
            fb,
            cursor_fb,
            mode_blob,
            gamma_blob,
            modeset: _,
            event,
        } = staged;

        if mode_blob.is_some() || !config.enabled {
            self.mode_blob = mode_blob;
        }
        if gamma_blob.is_some() || config.gamma.is_none() {
            self.gamma_blob = gamma_blob;
        }
        self.force_modeset = false;
        self.committed = true;
        if self.queued.as_ref() == Some(&config) {
            self.queued = None;
        }

        if event {
            if let (Some(crtc), Some(fb)) = (objects.crtc_mut(self.crtc), fb.clone()) {
                crtc.set_next(fb);
            }
            if let Some(plane) = objects.plane_mut(self.primary_plane) {
                plane.set_next(fb);
            }
            if let Some(plane) = self.cursor_plane.and_then(|h| objects.plane_mut(h)) {
                plane.set_next(cursor_fb);
            }
            self.in_flight = Some(config);
        } else {
            // Nothing is scanned out anymore.
            self.release_buffers(objects);
            self.current = config;
        }

        let phase = self.resting_phase();
        self.set_phase(phase);
    }
}
