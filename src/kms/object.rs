use bitflags::bitflags;
use smithay::reexports::drm::control::{connector, crtc, plane, property, RawResourceHandle};

use super::{AtomicCommit, DrmProperty, KmsDevice, KmsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Connector,
    Crtc,
    Plane,
}

/// Typed kernel object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Connector(connector::Handle),
    Crtc(crtc::Handle),
    Plane(plane::Handle),
}

impl ObjectId {
    pub fn object_type(self) -> ObjectType {
        match self {
            ObjectId::Connector(_) => ObjectType::Connector,
            ObjectId::Crtc(_) => ObjectType::Crtc,
            ObjectId::Plane(_) => ObjectType::Plane,
        }
    }

    pub fn raw(self) -> u32 {
        let raw: RawResourceHandle = match self {
            ObjectId::Connector(handle) => handle.into(),
            ObjectId::Crtc(handle) => handle.into(),
            ObjectId::Plane(handle) => handle.into(),
        };
        raw.get()
    }
}

/// Raw kernel id of a handle, as stored in object-typed properties.
pub(crate) fn raw_id(handle: impl Into<RawResourceHandle>) -> u64 {
    u64::from(handle.into().get())
}

impl From<connector::Handle> for ObjectId {
    fn from(handle: connector::Handle) -> Self {
        ObjectId::Connector(handle)
    }
}

impl From<crtc::Handle> for ObjectId {
    fn from(handle: crtc::Handle) -> Self {
        ObjectId::Crtc(handle)
    }
}

impl From<plane::Handle> for ObjectId {
    fn from(handle: plane::Handle) -> Self {
        ObjectId::Plane(handle)
    }
}

bitflags! {
    /// Optional features an object advertises through its property set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const GAMMA_LUT = 1 << 0;
        const CTM = 1 << 1;
        const VRR = 1 << 2;
        const ROTATION = 1 << 3;
        const IN_FORMATS = 1 << 4;
        const EDID = 1 << 5;
        const LINK_STATUS = 1 << 6;
    }
}

impl Capabilities {
    pub(super) fn from_properties(properties: &[DrmProperty]) -> Self {
        let mut caps = Capabilities::empty();
        for prop in properties {
            caps |= match prop.name() {
                "GAMMA_LUT" => Capabilities::GAMMA_LUT,
                "CTM" => Capabilities::CTM,
                "VRR_ENABLED" | "vrr_capable" => Capabilities::VRR,
                "rotation" => Capabilities::ROTATION,
                "IN_FORMATS" => Capabilities::IN_FORMATS,
                "EDID" => Capabilities::EDID,
                "link-status" => Capabilities::LINK_STATUS,
                _ => Capabilities::empty(),
            };
        }
        caps
    }
}

/// Property cache shared by connectors, CRTCs and planes.
///
/// The property set is fixed at discovery; a later refresh only updates values.
#[derive(Debug)]
pub struct DrmObject {
    id: ObjectId,
    properties: Vec<DrmProperty>,
}

impl DrmObject {
    /// Reads every property of `id`, failing if any of `required` is missing.
    pub fn discover(
        device: &dyn KmsDevice,
        id: ObjectId,
        required: &[&str],
    ) -> Result<Self, KmsError> {
        let properties = device
            .properties(id)?
            .into_iter()
            .map(DrmProperty::from_snapshot)
            .collect::<Vec<_>>();

        let object = Self { id, properties };
        for name in required {
            if !object.has(name) {
                return Err(KmsError::MissingProperty {
                    object: id,
                    name: (*name).to_owned(),
                });
            }
        }

        trace!(
            "discovered {id:?} with {} properties",
            object.properties.len()
        );
        Ok(object)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.id.object_type()
    }

    pub fn properties(&self) -> &[DrmProperty] {
        &self.properties
    }

    pub fn prop(&self, name: &str) -> Option<&DrmProperty> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn prop_mut(&mut self, name: &str) -> Option<&mut DrmProperty> {
        self.properties.iter_mut().find(|p| p.name() == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.prop(name).is_some()
    }

    /// Kernel value of a property.
    pub fn value(&self, name: &str) -> Option<u64> {
        self.prop(name).map(DrmProperty::value)
    }

    /// Value the next commit will carry.
    pub fn effective(&self, name: &str) -> Option<u64> {
        self.prop(name).map(DrmProperty::effective)
    }

    pub fn stage(&mut self, name: &str, value: u64) -> Result<(), KmsError> {
        let id = self.id;
        self.prop_mut(name)
            .ok_or_else(|| KmsError::MissingProperty {
                object: id,
                name: name.to_owned(),
            })?
            .stage(value)
    }

    /// Stages `value` if the property exists. Returns whether it does.
    pub fn stage_optional(&mut self, name: &str, value: u64) -> Result<bool, KmsError> {
        match self.prop_mut(name) {
            Some(prop) => prop.stage(value).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.properties.iter().any(|p| p.pending().is_some())
    }

    pub fn pending(&self) -> impl Iterator<Item = (property::Handle, u64)> + '_ {
        self.properties
            .iter()
            .filter_map(|p| p.pending().map(|value| (p.handle(), value)))
    }

    pub fn apply_pending(&mut self) {
        for prop in &mut self.properties {
            prop.apply_pending();
        }
    }

    pub fn revert_pending(&mut self) {
        for prop in &mut self.properties {
            prop.revert();
        }
    }

    /// Re-reads property values from the kernel.
    ///
    /// Staged values survive. Fails with [`KmsError::Removed`] once the object is gone.
    pub fn update_properties(&mut self, device: &dyn KmsDevice) -> Result<(), KmsError> {
        let _span = tracy_client::span!("DrmObject::update_properties");

        let snapshots = device.properties(self.id)?;
        for snapshot in snapshots {
            if let Some(prop) = self
                .properties
                .iter_mut()
                .find(|p| p.handle() == snapshot.handle)
            {
                prop.update_value(snapshot.value);
            }
        }

        Ok(())
    }
}

/// Behavior shared by connectors, CRTCs and planes.
pub trait KmsObject {
    fn object(&self) -> &DrmObject;
    fn object_mut(&mut self) -> &mut DrmObject;

    /// Stages the property values that switch this object off and adds them to `commit`.
    fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), KmsError>;

    fn id(&self) -> ObjectId {
        self.object().id()
    }

    fn update_properties(&mut self, device: &dyn KmsDevice) -> Result<(), KmsError> {
        self.object_mut().update_properties(device)
    }
}
