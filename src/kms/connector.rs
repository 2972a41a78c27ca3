use anyhow::{ensure, Context};
use scanout_config::OutputName;
use smithay::reexports::drm::control::{self, connector, crtc, Mode};

use super::object::raw_id;
use super::{
    same_timing, AtomicCommit, Capabilities, DrmObject, KmsDevice, KmsError, KmsObject,
};

const REQUIRED_PROPERTIES: &[&str] = &["CRTC_ID"];

/// A physical output port.
#[derive(Debug)]
pub struct DrmConnector {
    handle: connector::Handle,
    object: DrmObject,
    interface: connector::Interface,
    interface_id: u32,
    name: OutputName,
    connected: bool,
    modes: Vec<Mode>,
    physical_size: Option<(u32, u32)>,
    possible_crtcs: Vec<crtc::Handle>,
    caps: Capabilities,
}

impl DrmConnector {
    pub fn discover(device: &dyn KmsDevice, handle: connector::Handle) -> Result<Self, KmsError> {
        let _span = tracy_client::span!("DrmConnector::discover");

        let info = device.connector(handle, false)?;
        let object = DrmObject::discover(device, handle.into(), REQUIRED_PROPERTIES)?;
        let caps = Capabilities::from_properties(object.properties());
        let connector_name = format_connector_name(info.interface, info.interface_id);
        let name = make_output_name(device, &object, connector_name);

        Ok(Self {
            handle,
            object,
            interface: info.interface,
            interface_id: info.interface_id,
            name,
            connected: info.connected,
            modes: info.modes,
            physical_size: info.physical_size,
            possible_crtcs: info.possible_crtcs,
            caps,
        })
    }

    /// Probes the connector again. Returns whether the mode list changed.
    pub fn update(&mut self, device: &dyn KmsDevice) -> Result<bool, KmsError> {
        let _span = tracy_client::span!("DrmConnector::update");

        let info = device.connector(self.handle, true)?;
        self.object.update_properties(device)?;

        let modes_changed = self.modes.len() != info.modes.len()
            || !self
                .modes
                .iter()
                .zip(&info.modes)
                .all(|(a, b)| same_timing(a, b));

        self.connected = info.connected;
        self.modes = info.modes;
        self.physical_size = info.physical_size;
        self.possible_crtcs = info.possible_crtcs;
        self.name = make_output_name(device, &self.object, self.name.connector.clone());

        Ok(modes_changed)
    }

    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Kernel-style connector name such as `DP-1`.
    pub fn name(&self) -> &str {
        &self.name.connector
    }

    pub fn output_name(&self) -> &OutputName {
        &self.name
    }

    pub fn interface(&self) -> connector::Interface {
        self.interface
    }

    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn physical_size(&self) -> Option<(u32, u32)> {
        self.physical_size
    }

    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Headsets and similar devices that must not become part of the desktop.
    pub fn is_non_desktop(&self) -> bool {
        self.object.value("non-desktop") == Some(1)
    }

    pub fn is_vrr_capable(&self) -> bool {
        self.object.value("vrr_capable") == Some(1)
    }

    /// `false` only when the kernel reports a broken link that needs retraining.
    pub fn link_ok(&self) -> bool {
        self.object
            .prop("link-status")
            .and_then(|p| p.enum_name())
            .map_or(true, |status| status != "Bad")
    }

    /// CRTC the kernel currently routes this connector to.
    pub fn crtc(&self) -> Option<crtc::Handle> {
        control::from_u32(self.object.value("CRTC_ID")? as u32)
    }

    pub fn stage_crtc(&mut self, crtc: crtc::Handle) -> Result<(), KmsError> {
        self.object.stage("CRTC_ID", raw_id(crtc))?;
        // A link the kernel marked bad is retrained by asking for a good one with the modeset.
        if !self.link_ok() {
            if let Some(prop) = self.object.prop_mut("link-status") {
                prop.stage_enum("Good")?;
            }
        }
        Ok(())
    }
}

impl KmsObject for DrmConnector {
    fn object(&self) -> &DrmObject {
        &self.object
    }

    fn object_mut(&mut self) -> &mut DrmObject {
        &mut self.object
    }

    fn disable(&mut self, commit: &mut AtomicCommit) -> Result<(), KmsError> {
        self.object.stage("CRTC_ID", 0)?;
        commit.add(&self.object);
        Ok(())
    }
}

pub(crate) fn format_connector_name(interface: connector::Interface, id: u32) -> String {
    format!("{}-{}", interface.as_str(), id)
}

fn get_edid_info(
    device: &dyn KmsDevice,
    object: &DrmObject,
) -> anyhow::Result<libdisplay_info::info::Info> {
    let blob = object.value("EDID").context("no EDID property")?;
    ensure!(blob != 0, "EDID blob is empty");
    let data = device.blob(blob).context("error getting EDID blob value")?;
    libdisplay_info::info::Info::parse_edid(&data).context("error parsing EDID")
}

fn make_output_name(device: &dyn KmsDevice, object: &DrmObject, connector: String) -> OutputName {
    let info = get_edid_info(device, object)
        .map_err(|err| debug!("error getting EDID info for {connector}: {err:?}"))
        .ok();
    OutputName {
        connector,
        make: info.as_ref().and_then(|info| info.make()),
        model: info.as_ref().and_then(|info| info.model()),
        serial: info.as_ref().and_then(|info| info.serial()),
    }
}
