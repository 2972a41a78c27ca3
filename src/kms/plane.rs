use std::rc::Rc;

use smithay::reexports::drm::control::{self, crtc, plane};

use super::object::raw_id;
use super::{AtomicCommit, Capabilities, DrmFramebuffer, DrmObject, KmsDevice, KmsError, KmsObject};

const REQUIRED_PROPERTIES: &[&str] = &[
    "type", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W",
    "CRTC_H",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneType {
    fn from_raw(value: u64) -> Self {
        // DRM_PLANE_TYPE_*
        match value {
            1 => PlaneType::Primary,
            2 => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        }
    }
}

/// A scanout plane: where on which CRTC a framebuffer is shown.
#[derive(Debug)]
pub struct DrmPlane {
    handle: plane::Handle,
    object: DrmObject,
    plane_type: PlaneType,
    possible_crtcs: Vec<crtc::Handle>,
    formats: Vec<u32>,
    caps: Capabilities,
    current: Option<Rc<DrmFramebuffer>>,
    next: Option<Rc<DrmFramebuffer>>,
}

impl DrmPlane {
    pub fn discover(device: &dyn KmsDevice, handle: plane::Handle) -> Result<Self, KmsError> {
        let info = device.plane(handle)?;
        let object = DrmObject::discover(device, handle.into(), REQUIRED_PROPERTIES)?;

        let plane_type = PlaneType::from_raw(object.value("type").unwrap_or(0));
        let caps = Capabilities::from_properties(object.properties());

        Ok(Self {
            handle,
            object,
            plane_type,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            caps,
            current: None,
            next: None,
        })
    }

    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    pub fn is_compatible(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
    }

    pub fn supports_format(&self, fourcc: u32) -> bool {
        self.formats.contains(&fourcc)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// CRTC the kernel currently has this plane on.
    pub fn crtc(&self) -> Option<crtc::Handle> {
        control::from_u32(self.object.value("CRTC_ID")? as u32)
    }

    /// CRTC the next commit will put this plane on.
    pub fn pending_crtc(&self) -> Option<crtc::Handle> {
        control::from_u32(self.object.effective("CRTC_ID")? as u32)
    }

    /// Stages `fb` at `dst` on `crtc`, showing the whole buffer.
    ///
    /// A plane still attached to another CRTC is detached in the same transaction: the new
    /// `CRTC_ID` replaces the old one in the request, so the kernel sees one claim per plane.
    pub fn stage_buffer(
        &mut self,
        crtc: crtc::Handle,
        fb: &DrmFramebuffer,
        dst: (i32, i32, u32, u32),
    ) -> Result<(), KmsError> {
        if !self.is_compatible(crtc) {
            return Err(KmsError::Malformed(format!(
                "{:?} cannot be used with {crtc:?}",
                self.handle()
            )));
        }

        if let Some(previous) = self.crtc().filter(|&previous| previous != crtc) {
            debug!(
                "moving {:?} from {previous:?} to {crtc:?}",
                self.handle()
            );
            self.stage_detached()?;
        }

        let (w, h) = fb.size();
        let (x, y, dst_w, dst_h) = dst;

        let object = &mut self.object;
        object.stage("FB_ID", raw_id(fb.handle()))?;
        object.stage("CRTC_ID", raw_id(crtc))?;
        object.stage("SRC_X", 0)?;
        object.stage("SRC_Y", 0)?;
        object.stage("SRC_W", to_fixed(w))?;
        object.stage("SRC_H", to_fixed(h))?;
        object.stage("CRTC_X", i64::from(x) as u64)?;
        object.stage("CRTC_Y", i64::from(y) as u64)?;
        object.stage("CRTC_W", dst_w.into())?;
        object.stage("CRTC_H", dst_h.into())?;
        Ok(())
    }

    fn stage_detached(&mut self) -> Result<(), KmsError> {
        self.object.stage("FB_ID", 0)?;
        self.object.stage("CRTC_ID", 0)
    }

    pub fn current(&self) -> Option<&Rc<DrmFramebuffer>> {
        self.current.as_ref()
    }

    pub fn next(&self) -> Option<&Rc<DrmFramebuffer>> {
        self.next.as_ref()
    }

    pub fn set_next(&mut self, fb: Option<Rc<DrmFramebuffer>>) {
        self.next = fb;
    }

    /// Promotes the in-flight buffer once its flip completed.
    pub fn flip_buffer(&mut self) {
        if let Some(next) = self.next.take() {
            self.current = Some(next);
        }
    }

    /// Drops both buffer slots, e.g. after the plane was switched off.
    pub fn release_buffers(&mut self) {
        self.current = None;
        self.next = None;
    }
}

impl KmsObject for DrmPlane {
    fn object(&self) -> &DrmObject {
        &self.object
    }

    fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), KmsError> {
        self.stage_detached()?;
        commit.add(&self.object);
        Ok(())
    }
}

/// Converts to the 16.16 fixed point the `SRC_*` properties use.
fn to_fixed(value: u32) -> u64 {
    u64::from(value) << 16
}
