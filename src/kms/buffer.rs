use std::fmt;
use std::rc::Rc;

use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{framebuffer, Mode};

use super::{KmsDevice, KmsError};

/// A scanout framebuffer, destroyed when the last reference goes away.
///
/// Shared as `Rc<DrmFramebuffer>` between the producer and the CRTC/plane slots holding it.
pub struct DrmFramebuffer {
    device: Rc<dyn KmsDevice>,
    handle: framebuffer::Handle,
    size: (u32, u32),
    format: DrmFourcc,
    dumb: bool,
}

impl DrmFramebuffer {
    /// Takes ownership of a framebuffer created elsewhere.
    pub fn import(
        device: Rc<dyn KmsDevice>,
        handle: framebuffer::Handle,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> Self {
        Self {
            device,
            handle,
            size,
            format,
            dumb: false,
        }
    }

    /// Allocates a CPU-mappable buffer. The kernel hands it out zeroed, i.e. black.
    pub fn dumb(
        device: &Rc<dyn KmsDevice>,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("DrmFramebuffer::dumb");

        let allocation = device.create_dumb_framebuffer(size, format)?;
        trace!(
            "allocated {}x{} {format:?} dumb framebuffer {:?}",
            size.0,
            size.1,
            allocation.framebuffer
        );

        Ok(Self {
            device: device.clone(),
            handle: allocation.framebuffer,
            size,
            format,
            dumb: true,
        })
    }

    pub fn handle(&self) -> framebuffer::Handle {
        self.handle
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    pub fn matches_mode(&self, mode: &Mode) -> bool {
        let (w, h) = mode.size();
        self.size == (u32::from(w), u32::from(h))
    }

    /// Maps the buffer and lets `fill` write pixels given the row pitch in bytes.
    pub fn fill(&self, fill: &mut dyn FnMut(&mut [u8], u32)) -> Result<(), KmsError> {
        if !self.dumb {
            return Err(KmsError::Unsupported("only dumb buffers can be mapped"));
        }

        self.device.fill_dumb_framebuffer(self.handle, fill)?;
        Ok(())
    }
}

impl Drop for DrmFramebuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_framebuffer(self.handle) {
            warn!("error destroying framebuffer {:?}: {err:?}", self.handle);
        }
    }
}

impl fmt::Debug for DrmFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmFramebuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

/// A kernel property blob, destroyed on drop.
pub struct PropertyBlob {
    device: Rc<dyn KmsDevice>,
    id: u64,
}

impl PropertyBlob {
    pub fn new(device: &Rc<dyn KmsDevice>, data: &mut [u8]) -> Result<Self, KmsError> {
        let id = device.create_blob(data)?;
        Ok(Self {
            device: device.clone(),
            id,
        })
    }

    pub fn mode(device: &Rc<dyn KmsDevice>, mode: &Mode) -> Result<Self, KmsError> {
        let id = device.create_mode_blob(mode)?;
        Ok(Self {
            device: device.clone(),
            id,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PropertyBlob {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_blob(self.id) {
            warn!("error destroying property blob {}: {err:?}", self.id);
        }
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyBlob").field(&self.id).finish()
    }
}

/// A small ring of dumb framebuffers for CPU-drawn content.
#[derive(Debug)]
pub struct DumbSwapchain {
    slots: Vec<Rc<DrmFramebuffer>>,
    last: Option<usize>,
}

impl DumbSwapchain {
    pub fn new(
        device: &Rc<dyn KmsDevice>,
        size: (u32, u32),
        format: DrmFourcc,
        count: usize,
    ) -> Result<Self, KmsError> {
        let slots = (0..count.max(1))
            .map(|_| DrmFramebuffer::dumb(device, size, format).map(Rc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { slots, last: None })
    }

    pub fn size(&self) -> (u32, u32) {
        self.slots[0].size()
    }

    /// Next slot nobody else holds a reference to.
    pub fn acquire(&mut self) -> Option<Rc<DrmFramebuffer>> {
        let start = self.last.map_or(0, |last| last + 1);
        let count = self.slots.len();
        let index = (start..start + count)
            .map(|i| i % count)
            .find(|&i| Rc::strong_count(&self.slots[i]) == 1)?;
        self.last = Some(index);
        Some(self.slots[index].clone())
    }

    /// The slot handed out most recently.
    pub fn current(&self) -> Option<&Rc<DrmFramebuffer>> {
        self.last.map(|i| &self.slots[i])
    }
}
