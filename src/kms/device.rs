use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;

use smithay::backend::drm::{DrmDevice, DrmError};
use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::dumbbuffer::DumbBuffer;
use smithay::reexports::drm::control::{
    self, atomic, connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device,
    Mode, ResourceHandle,
};
use smithay::reexports::drm::Device as _;

use super::{
    ConnectorSnapshot, CrtcSnapshot, DumbAllocation, KmsDevice, ObjectId, PlaneSnapshot,
    PropertyKind, PropertySnapshot, RequestEntry, ResourceIds,
};

/// A DRM card driven through smithay's [`DrmDevice`].
pub struct DrmCard {
    drm: RefCell<DrmDevice>,
    dumb_buffers: RefCell<HashMap<framebuffer::Handle, DumbBuffer>>,
}

impl DrmCard {
    pub fn new(drm: DrmDevice) -> Self {
        Self {
            drm: RefCell::new(drm),
            dumb_buffers: RefCell::new(HashMap::new()),
        }
    }

    /// Gives up DRM master while the session is inactive.
    pub fn pause(&self) {
        self.drm.borrow_mut().pause();
    }

    pub fn activate(&self) -> Result<(), DrmError> {
        self.drm.borrow_mut().activate(false)
    }

    /// Whether we hold DRM master.
    pub fn is_active(&self) -> bool {
        self.drm.borrow().is_active()
    }

    fn read_properties<H: ResourceHandle>(&self, handle: H) -> io::Result<Vec<PropertySnapshot>> {
        let drm = self.drm.borrow();
        let props = drm.get_properties(handle)?;
        let mut snapshots = Vec::new();
        for (prop, value) in props {
            let info = drm.get_property(prop)?;
            let Ok(name) = info.name().to_str() else {
                continue;
            };
            snapshots.push(PropertySnapshot {
                handle: prop,
                name: name.to_owned(),
                value,
                kind: property_kind(&info),
                immutable: !info.mutable(),
            });
        }
        Ok(snapshots)
    }
}

fn property_kind(info: &property::Info) -> PropertyKind {
    match info.value_type() {
        property::ValueType::Boolean => PropertyKind::Boolean,
        property::ValueType::UnsignedRange(min, max) => PropertyKind::Range(min, max),
        property::ValueType::SignedRange(min, max) => PropertyKind::SignedRange(min, max),
        property::ValueType::Enum(values) => {
            let (_, values) = values.values();
            PropertyKind::Enum(
                values
                    .iter()
                    .map(|v| (v.value(), v.name().to_string_lossy().into_owned()))
                    .collect(),
            )
        }
        property::ValueType::Bitmask => PropertyKind::Bitmask,
        property::ValueType::Blob => PropertyKind::Blob,
        property::ValueType::Object
        | property::ValueType::CRTC
        | property::ValueType::Connector
        | property::ValueType::Encoder
        | property::ValueType::Framebuffer
        | property::ValueType::Plane
        | property::ValueType::Property => PropertyKind::Object,
        _ => PropertyKind::Unknown,
    }
}

impl KmsDevice for DrmCard {
    fn is_atomic(&self) -> bool {
        self.drm.borrow().is_atomic()
    }

    fn cursor_size(&self) -> (u32, u32) {
        let size = self.drm.borrow().cursor_size();
        (size.w, size.h)
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        let drm = self.drm.borrow();
        let res = drm.resource_handles()?;
        let planes = drm.plane_handles()?;
        Ok(ResourceIds {
            crtcs: res.crtcs().to_vec(),
            connectors: res.connectors().to_vec(),
            planes: planes.into_iter().collect(),
        })
    }

    fn crtc(&self, crtc: crtc::Handle) -> io::Result<CrtcSnapshot> {
        let info = self.drm.borrow().get_crtc(crtc)?;
        Ok(CrtcSnapshot {
            handle: crtc,
            mode: info.mode(),
            gamma_length: info.gamma_length(),
        })
    }

    fn plane(&self, plane: plane::Handle) -> io::Result<PlaneSnapshot> {
        let drm = self.drm.borrow();
        let info = drm.get_plane(plane)?;
        let res = drm.resource_handles()?;
        Ok(PlaneSnapshot {
            handle: plane,
            crtc: info.crtc(),
            possible_crtcs: res.filter_crtcs(info.possible_crtcs()),
            formats: info.formats().to_vec(),
        })
    }

    fn connector(
        &self,
        connector: connector::Handle,
        force_probe: bool,
    ) -> io::Result<ConnectorSnapshot> {
        let drm = self.drm.borrow();
        let info = drm.get_connector(connector, force_probe)?;
        let res = drm.resource_handles()?;

        let mut possible_crtcs = Vec::new();
        for encoder in info.encoders() {
            let encoder = drm.get_encoder(*encoder)?;
            for crtc in res.filter_crtcs(encoder.possible_crtcs()) {
                if !possible_crtcs.contains(&crtc) {
                    possible_crtcs.push(crtc);
                }
            }
        }

        Ok(ConnectorSnapshot {
            handle: connector,
            interface: info.interface(),
            interface_id: info.interface_id(),
            connected: info.state() == connector::State::Connected,
            modes: info.modes().to_vec(),
            physical_size: info.size(),
            possible_crtcs,
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertySnapshot>> {
        match object {
            ObjectId::Connector(handle) => self.read_properties(handle),
            ObjectId::Crtc(handle) => self.read_properties(handle),
            ObjectId::Plane(handle) => self.read_properties(handle),
        }
    }

    fn blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.drm.borrow().get_property_blob(blob)
    }

    fn create_blob(&self, data: &mut [u8]) -> io::Result<u64> {
        let drm = self.drm.borrow();
        let blob = drm_ffi::mode::create_property_blob(drm.as_fd(), data)?;
        Ok(u64::from(blob.blob_id))
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        match self.drm.borrow().create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(id),
            _ => Err(io::Error::other("mode blob has the wrong type")),
        }
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.drm.borrow().destroy_property_blob(blob)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &[RequestEntry]) -> io::Result<()> {
        let mut req = atomic::AtomicModeReq::new();
        for &(object, prop, value) in request {
            let value = property::Value::Unknown(value);
            match object {
                ObjectId::Connector(handle) => req.add_property(handle, prop, value),
                ObjectId::Crtc(handle) => req.add_property(handle, prop, value),
                ObjectId::Plane(handle) => req.add_property(handle, prop, value),
            }
        }
        self.drm.borrow().atomic_commit(flags, req)
    }

    fn create_dumb_framebuffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> io::Result<DumbAllocation> {
        let drm = self.drm.borrow();
        let buffer = drm.create_dumb_buffer(size, format, 32)?;
        let depth = match format {
            DrmFourcc::Argb8888 => 32,
            _ => 24,
        };
        let framebuffer = match drm.add_framebuffer(&buffer, depth, 32) {
            Ok(fb) => fb,
            Err(err) => {
                let _ = drm.destroy_dumb_buffer(buffer);
                return Err(err);
            }
        };

        let pitch = control::buffer::Buffer::pitch(&buffer);
        self.dumb_buffers.borrow_mut().insert(framebuffer, buffer);
        Ok(DumbAllocation { framebuffer, pitch })
    }

    fn fill_dumb_framebuffer(
        &self,
        framebuffer: framebuffer::Handle,
        fill: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()> {
        let mut buffers = self.dumb_buffers.borrow_mut();
        let buffer = buffers
            .get_mut(&framebuffer)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let pitch = control::buffer::Buffer::pitch(&*buffer);
        let drm = self.drm.borrow();
        let mut mapping = drm.map_dumb_buffer(buffer)?;
        fill(mapping.as_mut(), pitch);
        Ok(())
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        let drm = self.drm.borrow();
        drm.destroy_framebuffer(framebuffer)?;
        if let Some(buffer) = self.dumb_buffers.borrow_mut().remove(&framebuffer) {
            drm.destroy_dumb_buffer(buffer)?;
        }
        Ok(())
    }
}
