use std::rc::Rc;

use smithay::reexports::drm::control::{crtc, plane, Mode};

use super::{
    AtomicCommit, Capabilities, DrmFramebuffer, DrmObject, KmsDevice, KmsError, KmsObject,
};

const REQUIRED_PROPERTIES: &[&str] = &["MODE_ID", "ACTIVE"];

/// What a completion event meant for a CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipOutcome {
    /// The in-flight buffer is now on screen.
    Completed,
    /// The flip was cancelled locally; the event is swallowed.
    Stale,
    /// Nothing was in flight.
    Unexpected,
}

/// A display controller and the buffers it is scanning out.
#[derive(Debug)]
pub struct DrmCrtc {
    handle: crtc::Handle,
    object: DrmObject,
    pipe_index: usize,
    primary_plane: Option<plane::Handle>,
    cursor_plane: Option<plane::Handle>,
    legacy_gamma_length: u32,
    caps: Capabilities,
    current: Option<Rc<DrmFramebuffer>>,
    next: Option<Rc<DrmFramebuffer>>,
    /// Flips whose completion event is still due but no longer wanted.
    cancelled_flips: u32,
}

impl DrmCrtc {
    pub fn discover(
        device: &dyn KmsDevice,
        handle: crtc::Handle,
        pipe_index: usize,
    ) -> Result<Self, KmsError> {
        let info = device.crtc(handle)?;
        let object = DrmObject::discover(device, handle.into(), REQUIRED_PROPERTIES)?;
        let caps = Capabilities::from_properties(object.properties());

        Ok(Self {
            handle,
            object,
            pipe_index,
            primary_plane: None,
            cursor_plane: None,
            legacy_gamma_length: info.gamma_length,
            caps,
            current: None,
            next: None,
            cancelled_flips: 0,
        })
    }

    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Position of this CRTC in the device's resource list.
    pub fn pipe_index(&self) -> usize {
        self.pipe_index
    }

    pub fn primary_plane(&self) -> Option<plane::Handle> {
        self.primary_plane
    }

    pub fn cursor_plane(&self) -> Option<plane::Handle> {
        self.cursor_plane
    }

    pub(super) fn set_planes(
        &mut self,
        primary: Option<plane::Handle>,
        cursor: Option<plane::Handle>,
    ) {
        self.primary_plane = primary;
        self.cursor_plane = cursor;
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Entries per channel of the gamma table, zero when gamma is unsupported.
    pub fn gamma_ramp_size(&self) -> usize {
        if let Some(size) = self.object.value("GAMMA_LUT_SIZE") {
            if self.caps.contains(Capabilities::GAMMA_LUT) {
                return size as usize;
            }
        }
        self.legacy_gamma_length as usize
    }

    pub fn is_active(&self) -> bool {
        self.object.value("ACTIVE") == Some(1)
    }

    /// Reads the mode straight from the kernel, bypassing the property cache.
    ///
    /// Used to adopt a configuration left behind by a previous DRM master.
    pub fn query_current_mode(&self, device: &dyn KmsDevice) -> Result<Option<Mode>, KmsError> {
        Ok(device.crtc(self.handle)?.mode)
    }

    pub fn current(&self) -> Option<&Rc<DrmFramebuffer>> {
        self.current.as_ref()
    }

    pub fn next(&self) -> Option<&Rc<DrmFramebuffer>> {
        self.next.as_ref()
    }

    pub fn is_flip_pending(&self) -> bool {
        self.next.is_some()
    }

    /// Records the buffer a submitted commit will show.
    pub fn set_next(&mut self, fb: Rc<DrmFramebuffer>) {
        self.next = Some(fb);
    }

    /// Promotes the in-flight buffer; the previous one is released.
    pub fn flip_buffer(&mut self) {
        if let Some(next) = self.next.take() {
            self.current = Some(next);
        }
    }

    /// Drops both buffers.
    ///
    /// A flip still in flight is remembered as cancelled so that its completion event is
    /// recognized and ignored.
    pub fn release_buffers(&mut self) {
        if self.next.take().is_some() {
            self.cancelled_flips += 1;
        }
        self.current = None;
    }

    /// Notes that a commit switching this CRTC off asked for a completion event, which carries
    /// no buffer and has to be ignored.
    pub fn expect_stale_event(&mut self) {
        self.cancelled_flips += 1;
    }

    /// Accounts for a completion event on this CRTC.
    pub fn page_flip_event(&mut self) -> FlipOutcome {
        if self.cancelled_flips > 0 {
            self.cancelled_flips -= 1;
            return FlipOutcome::Stale;
        }

        if self.next.is_none() {
            return FlipOutcome::Unexpected;
        }

        self.flip_buffer();
        FlipOutcome::Completed
    }
}

impl KmsObject for DrmCrtc {
    fn object(&self) -> &DrmObject {
        &self.object
    }

    fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), KmsError> {
        self.object.stage("ACTIVE", 0)?;
        self.object.stage("MODE_ID", 0)?;
        self.object.stage_optional("VRR_ENABLED", 0)?;
        commit.add(&self.object);
        Ok(())
    }
}
