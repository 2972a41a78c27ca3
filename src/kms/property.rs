use smithay::reexports::drm::control::property;

use super::{KmsError, PropertySnapshot};

/// The value type of a KMS property, as far as validation cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Boolean,
    Range(u64, u64),
    SignedRange(i64, i64),
    /// Allowed `(value, name)` pairs.
    Enum(Vec<(u64, String)>),
    Bitmask,
    Blob,
    /// An object id, zero meaning none.
    Object,
    Unknown,
}

/// A cached kernel property with an optional staged value.
///
/// `value` is what the kernel last reported or accepted. A staged value sits in `pending` until a
/// commit carrying it succeeds ([`DrmProperty::apply_pending`]) or fails
/// ([`DrmProperty::revert`]).
#[derive(Debug, Clone)]
pub struct DrmProperty {
    handle: property::Handle,
    name: String,
    kind: PropertyKind,
    immutable: bool,
    value: u64,
    pending: Option<u64>,
}

impl DrmProperty {
    pub fn from_snapshot(snapshot: PropertySnapshot) -> Self {
        Self {
            handle: snapshot.handle,
            name: snapshot.name,
            kind: snapshot.kind,
            immutable: snapshot.immutable,
            value: snapshot.value,
            pending: None,
        }
    }

    pub fn handle(&self) -> property::Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Last value known to be in effect in the kernel.
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// The value the next commit will carry.
    pub fn effective(&self) -> u64 {
        self.pending.unwrap_or(self.value)
    }

    pub fn stage(&mut self, value: u64) -> Result<(), KmsError> {
        if self.immutable {
            return Err(KmsError::Malformed(format!(
                "property {} is immutable",
                self.name
            )));
        }

        if !self.accepts(value) {
            return Err(KmsError::Malformed(format!(
                "value {value} out of range for property {}",
                self.name
            )));
        }

        self.pending = Some(value);
        Ok(())
    }

    pub fn stage_enum(&mut self, name: &str) -> Result<(), KmsError> {
        let value = self.enum_value(name).ok_or_else(|| {
            KmsError::Malformed(format!("property {} has no value {name:?}", self.name))
        })?;
        self.stage(value)
    }

    fn accepts(&self, value: u64) -> bool {
        match &self.kind {
            PropertyKind::Boolean => value <= 1,
            PropertyKind::Range(min, max) => (*min..=*max).contains(&value),
            PropertyKind::SignedRange(min, max) => (*min..=*max).contains(&(value as i64)),
            PropertyKind::Enum(values) => values.iter().any(|(v, _)| *v == value),
            PropertyKind::Object => value <= u64::from(u32::MAX),
            PropertyKind::Bitmask | PropertyKind::Blob | PropertyKind::Unknown => true,
        }
    }

    /// Whether the staged value differs from the kernel's.
    pub fn needs_commit(&self) -> bool {
        self.pending.is_some_and(|pending| pending != self.value)
    }

    pub fn apply_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.value = pending;
        }
    }

    pub fn revert(&mut self) {
        self.pending = None;
    }

    /// Records a value read back from the kernel. Staged values are left alone.
    pub fn update_value(&mut self, value: u64) {
        self.value = value;
    }

    pub fn enum_value(&self, name: &str) -> Option<u64> {
        match &self.kind {
            PropertyKind::Enum(values) => values
                .iter()
                .find_map(|(value, n)| (n == name).then_some(*value)),
            _ => None,
        }
    }

    pub fn enum_name(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Enum(values) => values
                .iter()
                .find_map(|(value, name)| (*value == self.value).then_some(name.as_str())),
            _ => None,
        }
    }
}
