use std::rc::Rc;

use smithay::reexports::drm::control::{connector, crtc, plane};

use super::{
    AtomicCommit, DrmConnector, DrmCrtc, DrmObject, DrmPlane, KmsDevice, KmsError, KmsObject,
    ObjectId, PlaneType, RetryPolicy,
};

/// Every KMS object of one device, indexed by kernel handle.
pub struct DrmObjects {
    device: Rc<dyn KmsDevice>,
    crtcs: Vec<DrmCrtc>,
    planes: Vec<DrmPlane>,
    connectors: Vec<DrmConnector>,
    retry: RetryPolicy,
}

impl DrmObjects {
    pub fn discover(device: Rc<dyn KmsDevice>, retry: RetryPolicy) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("DrmObjects::discover");

        let resources = device.resources()?;

        let mut planes = Vec::with_capacity(resources.planes.len());
        for handle in resources.planes {
            match DrmPlane::discover(&*device, handle) {
                Ok(plane) => planes.push(plane),
                Err(err) => warn!("ignoring {handle:?}: {err}"),
            }
        }

        let mut crtcs = Vec::with_capacity(resources.crtcs.len());
        for (pipe, handle) in resources.crtcs.into_iter().enumerate() {
            let mut crtc = DrmCrtc::discover(&*device, handle, pipe)?;
            let primary = pick_plane(&planes, &crtcs, handle, PlaneType::Primary);
            let cursor = pick_plane(&planes, &crtcs, handle, PlaneType::Cursor);
            crtc.set_planes(primary, cursor);
            debug!(
                "{handle:?} (pipe {pipe}): primary {primary:?}, cursor {cursor:?}, gamma size {}",
                crtc.gamma_ramp_size()
            );
            crtcs.push(crtc);
        }

        let mut connectors = Vec::with_capacity(resources.connectors.len());
        for handle in resources.connectors {
            match DrmConnector::discover(&*device, handle) {
                Ok(connector) => connectors.push(connector),
                Err(err) => warn!("ignoring {handle:?}: {err}"),
            }
        }

        Ok(Self {
            device,
            crtcs,
            planes,
            connectors,
            retry,
        })
    }

    pub fn device(&self) -> &Rc<dyn KmsDevice> {
        &self.device
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn crtcs(&self) -> &[DrmCrtc] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[DrmPlane] {
        &self.planes
    }

    pub fn connectors(&self) -> &[DrmConnector] {
        &self.connectors
    }

    pub fn crtc(&self, handle: crtc::Handle) -> Option<&DrmCrtc> {
        self.crtcs.iter().find(|c| c.handle() == handle)
    }

    pub fn crtc_mut(&mut self, handle: crtc::Handle) -> Option<&mut DrmCrtc> {
        self.crtcs.iter_mut().find(|c| c.handle() == handle)
    }

    pub fn plane(&self, handle: plane::Handle) -> Option<&DrmPlane> {
        self.planes.iter().find(|p| p.handle() == handle)
    }

    pub fn plane_mut(&mut self, handle: plane::Handle) -> Option<&mut DrmPlane> {
        self.planes.iter_mut().find(|p| p.handle() == handle)
    }

    pub fn connector(&self, handle: connector::Handle) -> Option<&DrmConnector> {
        self.connectors.iter().find(|c| c.handle() == handle)
    }

    pub fn connector_mut(&mut self, handle: connector::Handle) -> Option<&mut DrmConnector> {
        self.connectors.iter_mut().find(|c| c.handle() == handle)
    }

    fn object_mut(&mut self, id: ObjectId) -> Option<&mut DrmObject> {
        match id {
            ObjectId::Connector(h) => self.connector_mut(h).map(KmsObject::object_mut),
            ObjectId::Crtc(h) => self.crtc_mut(h).map(KmsObject::object_mut),
            ObjectId::Plane(h) => self.plane_mut(h).map(KmsObject::object_mut),
        }
    }

    /// Settles the staged values of everything `commit` touched: kept on success, dropped on
    /// failure.
    pub fn finish(&mut self, commit: &AtomicCommit, success: bool) {
        for &id in commit.objects() {
            if let Some(object) = self.object_mut(id) {
                if success {
                    object.apply_pending();
                } else {
                    object.revert_pending();
                }
            }
        }
    }

    /// Checks `commit` with the kernel. Staged values are dropped either way.
    pub fn test(&mut self, commit: AtomicCommit) -> Result<(), KmsError> {
        let res = commit.test(&*self.device);
        self.finish(&commit, false);
        res
    }

    /// Tests `commit`, then submits the identical request for real.
    ///
    /// Nothing is submitted when the test fails; the cache only changes on success.
    pub fn apply(&mut self, commit: AtomicCommit) -> Result<(), KmsError> {
        let res = commit
            .test(&*self.device)
            .and_then(|()| commit.submit(&*self.device, self.retry));
        self.finish(&commit, res.is_ok());
        res
    }

    /// Submits `commit` without a test pass.
    pub fn submit(&mut self, commit: AtomicCommit) -> Result<(), KmsError> {
        let res = commit.submit(&*self.device, self.retry);
        self.finish(&commit, res.is_ok());
        res
    }

    /// Re-reads every cached property value, e.g. after another DRM master drove the device.
    ///
    /// Connectors that vanished are left for [`Self::rescan_connectors`].
    pub fn update_properties(&mut self) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmObjects::update_properties");

        let device = &*self.device;
        for crtc in &mut self.crtcs {
            crtc.update_properties(device)?;
        }
        for plane in &mut self.planes {
            plane.update_properties(device)?;
        }
        for connector in &mut self.connectors {
            match connector.update_properties(device) {
                Ok(()) => (),
                Err(KmsError::Removed) => debug!("{} is gone", connector.name()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Re-reads the connector list after a hotplug event.
    ///
    /// Returns connectors that disappeared from the device; they are dropped from the arena.
    /// New connectors are discovered, and known ones re-probed.
    pub fn rescan_connectors(&mut self) -> Result<Vec<DrmConnector>, KmsError> {
        let _span = tracy_client::span!("DrmObjects::rescan_connectors");

        let resources = self.device.resources()?;

        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connectors)
            .into_iter()
            .partition(|c| resources.connectors.contains(&c.handle()));
        self.connectors = kept;

        let mut vanished = removed;
        let mut i = 0;
        while i < self.connectors.len() {
            match self.connectors[i].update(&*self.device) {
                Ok(_) => i += 1,
                Err(KmsError::Removed) => vanished.push(self.connectors.remove(i)),
                Err(err) => {
                    warn!("error probing {}: {err}", self.connectors[i].name());
                    i += 1;
                }
            }
        }

        for handle in resources.connectors {
            if self.connector(handle).is_some() {
                continue;
            }
            match DrmConnector::discover(&*self.device, handle) {
                Ok(connector) => {
                    debug!("new connector {}", connector.name());
                    self.connectors.push(connector);
                }
                Err(err) => warn!("ignoring {handle:?}: {err}"),
            }
        }

        Ok(vanished)
    }
}

/// First plane of `ty` usable on `crtc` that no earlier CRTC claimed.
fn pick_plane(
    planes: &[DrmPlane],
    crtcs: &[DrmCrtc],
    crtc: crtc::Handle,
    ty: PlaneType,
) -> Option<plane::Handle> {
    let taken = |handle: plane::Handle| {
        crtcs
            .iter()
            .any(|c| c.primary_plane() == Some(handle) || c.cursor_plane() == Some(handle))
    };

    planes
        .iter()
        .filter(|p| p.plane_type() == ty && p.is_compatible(crtc) && !taken(p.handle()))
        // Prefer planes already on this CRTC, then dedicated ones.
        .min_by_key(|p| (p.crtc() != Some(crtc), p.possible_crtcs().len()))
        .map(DrmPlane::handle)
}
