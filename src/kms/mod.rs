//! Kernel modesetting objects and the atomic commit machinery.
//!
//! Everything here reaches the kernel through [`KmsDevice`]. The real implementation wraps a
//! smithay [`DrmDevice`](smithay::backend::drm::DrmDevice); tests drive the same code through an
//! in-memory fake that validates requests the way the kernel does.

use std::io;

use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{self, AtomicCommitFlags, Mode};

mod buffer;
mod commit;
mod connector;
mod crtc;
mod device;
mod error;
mod gamma;
mod mode;
mod object;
mod objects;
mod plane;
mod property;

#[cfg(test)]
pub mod fake;

pub use self::buffer::{DrmFramebuffer, DumbSwapchain, PropertyBlob};
pub use self::commit::{AtomicCommit, RetryPolicy};
pub use self::connector::DrmConnector;
pub use self::crtc::{DrmCrtc, FlipOutcome};
pub use self::device::DrmCard;
pub use self::error::KmsError;
pub use self::gamma::{DrmColorLut, GammaRamp};
pub use self::mode::{
    calculate_drm_mode_from_modeline, calculate_mode_cvt, mode_refresh_mhz, pick_mode,
    refresh_interval, same_timing,
};
pub use self::object::{Capabilities, DrmObject, KmsObject, ObjectId, ObjectType};
pub use self::objects::DrmObjects;
pub use self::plane::{DrmPlane, PlaneType};
pub use self::property::{DrmProperty, PropertyKind};

/// Object handles exposed by a device, in kernel order.
#[derive(Debug, Clone, Default)]
pub struct ResourceIds {
    pub crtcs: Vec<control::crtc::Handle>,
    pub connectors: Vec<control::connector::Handle>,
    pub planes: Vec<control::plane::Handle>,
}

#[derive(Debug, Clone)]
pub struct CrtcSnapshot {
    pub handle: control::crtc::Handle,
    pub mode: Option<Mode>,
    /// Size of the legacy gamma table, zero when unsupported.
    pub gamma_length: u32,
}

#[derive(Debug, Clone)]
pub struct PlaneSnapshot {
    pub handle: control::plane::Handle,
    pub crtc: Option<control::crtc::Handle>,
    pub possible_crtcs: Vec<control::crtc::Handle>,
    pub formats: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ConnectorSnapshot {
    pub handle: control::connector::Handle,
    pub interface: control::connector::Interface,
    pub interface_id: u32,
    pub connected: bool,
    pub modes: Vec<Mode>,
    /// Physical size in millimeters.
    pub physical_size: Option<(u32, u32)>,
    pub possible_crtcs: Vec<control::crtc::Handle>,
}

#[derive(Debug, Clone)]
pub struct PropertySnapshot {
    pub handle: control::property::Handle,
    pub name: String,
    pub value: u64,
    pub kind: PropertyKind,
    pub immutable: bool,
}

/// A dumb buffer wrapped in a framebuffer object.
#[derive(Debug, Clone, Copy)]
pub struct DumbAllocation {
    pub framebuffer: control::framebuffer::Handle,
    pub pitch: u32,
}

/// One `(object, property, value)` triple of an atomic request.
pub type RequestEntry = (ObjectId, control::property::Handle, u64);

/// The subset of the KMS uAPI the pipeline needs.
///
/// All methods mirror a single ioctl, so errors carry the raw errno for classification by
/// [`KmsError::from_io`].
pub trait KmsDevice {
    fn is_atomic(&self) -> bool;
    /// Largest cursor the hardware accepts.
    fn cursor_size(&self) -> (u32, u32);

    fn resources(&self) -> io::Result<ResourceIds>;
    fn crtc(&self, crtc: control::crtc::Handle) -> io::Result<CrtcSnapshot>;
    fn plane(&self, plane: control::plane::Handle) -> io::Result<PlaneSnapshot>;
    fn connector(
        &self,
        connector: control::connector::Handle,
        force_probe: bool,
    ) -> io::Result<ConnectorSnapshot>;
    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertySnapshot>>;

    fn blob(&self, blob: u64) -> io::Result<Vec<u8>>;
    fn create_blob(&self, data: &mut [u8]) -> io::Result<u64>;
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64>;
    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &[RequestEntry]) -> io::Result<()>;

    fn create_dumb_framebuffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> io::Result<DumbAllocation>;
    /// Maps a dumb framebuffer and hands its pixels and pitch to `fill`.
    fn fill_dumb_framebuffer(
        &self,
        framebuffer: control::framebuffer::Handle,
        fill: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()>;
    fn destroy_framebuffer(&self, framebuffer: control::framebuffer::Handle) -> io::Result<()>;
}
