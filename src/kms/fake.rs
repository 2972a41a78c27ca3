//! In-memory KMS device for tests.
//!
//! Commits are validated roughly the way the kernel does it: unknown objects, immutable or
//! unknown properties, modesets without `ALLOW_MODESET`, events on inactive CRTCs and nonblocking
//! commits racing a pending flip are all refused with the matching errno.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

use drm_ffi::drm_mode_modeinfo;
use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{
    self, connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Mode,
};

use super::mode::mode_name;
use super::object::raw_id;
use super::{
    same_timing, ConnectorSnapshot, CrtcSnapshot, DumbAllocation, KmsDevice, ObjectId,
    PlaneSnapshot, PlaneType, PropertyKind, PropertySnapshot, RequestEntry, ResourceIds,
};

#[derive(Debug, Clone)]
struct FakeProperty {
    handle: property::Handle,
    name: String,
    kind: PropertyKind,
    immutable: bool,
    value: u64,
}

#[derive(Debug, Clone)]
struct FakeCrtc {
    handle: crtc::Handle,
    gamma_length: u32,
    mode: Option<Mode>,
    props: Vec<FakeProperty>,
}

#[derive(Debug, Clone)]
struct FakePlane {
    handle: plane::Handle,
    possible_crtcs: Vec<crtc::Handle>,
    formats: Vec<u32>,
    props: Vec<FakeProperty>,
}

#[derive(Debug, Clone)]
struct FakeConnector {
    handle: connector::Handle,
    interface: connector::Interface,
    interface_id: u32,
    connected: bool,
    modes: Vec<Mode>,
    possible_crtcs: Vec<crtc::Handle>,
    props: Vec<FakeProperty>,
}

#[derive(Debug)]
struct FakeFramebuffer {
    pitch: u32,
    data: Vec<u8>,
}

/// A commit as the device saw it, with property names resolved.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub flags: AtomicCommitFlags,
    pub entries: Vec<(ObjectId, String, u64)>,
}

impl CommitRecord {
    pub fn is_test(&self) -> bool {
        self.flags.contains(AtomicCommitFlags::TEST_ONLY)
    }

    pub fn value(&self, object: ObjectId, name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(o, n, _)| *o == object && n == name)
            .map(|(_, _, v)| *v)
    }

    pub fn touches(&self, object: ObjectId) -> bool {
        self.entries.iter().any(|(o, _, _)| *o == object)
    }
}

#[derive(Debug)]
struct State {
    next_id: u32,
    atomic: bool,
    removed: bool,
    crtcs: Vec<FakeCrtc>,
    planes: Vec<FakePlane>,
    connectors: Vec<FakeConnector>,
    blobs: HashMap<u64, Vec<u8>>,
    mode_blobs: HashMap<u64, Mode>,
    framebuffers: HashMap<framebuffer::Handle, FakeFramebuffer>,
    pending_flips: Vec<crtc::Handle>,
    busy: u32,
    fail_next: Option<i32>,
    rejected_properties: Vec<String>,
    max_mode_width: Option<u16>,
    real_commit_attempts: u32,
    commits: Vec<CommitRecord>,
}

impl State {
    fn alloc_raw(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn alloc<T: From<control::RawResourceHandle>>(&mut self) -> T {
        let id = self.alloc_raw();
        control::from_u32(id).unwrap()
    }

    fn property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        immutable: bool,
        value: u64,
    ) -> FakeProperty {
        FakeProperty {
            handle: self.alloc(),
            name: name.to_owned(),
            kind,
            immutable,
            value,
        }
    }

    fn props(&self, id: ObjectId) -> Option<&Vec<FakeProperty>> {
        match id {
            ObjectId::Connector(h) => self
                .connectors
                .iter()
                .find(|c| c.handle == h)
                .map(|c| &c.props),
            ObjectId::Crtc(h) => self.crtcs.iter().find(|c| c.handle == h).map(|c| &c.props),
            ObjectId::Plane(h) => self.planes.iter().find(|p| p.handle == h).map(|p| &p.props),
        }
    }

    fn props_mut(&mut self, id: ObjectId) -> Option<&mut Vec<FakeProperty>> {
        match id {
            ObjectId::Connector(h) => self
                .connectors
                .iter_mut()
                .find(|c| c.handle == h)
                .map(|c| &mut c.props),
            ObjectId::Crtc(h) => self
                .crtcs
                .iter_mut()
                .find(|c| c.handle == h)
                .map(|c| &mut c.props),
            ObjectId::Plane(h) => self
                .planes
                .iter_mut()
                .find(|p| p.handle == h)
                .map(|p| &mut p.props),
        }
    }

    fn check_alive(&self) -> io::Result<()> {
        if self.removed {
            return Err(errno(libc::ENODEV));
        }
        Ok(())
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn get(props: &[FakeProperty], name: &str) -> Option<u64> {
    props.iter().find(|p| p.name == name).map(|p| p.value)
}

fn set(props: &mut [FakeProperty], name: &str, value: u64) -> bool {
    match props.iter_mut().find(|p| p.name == name) {
        Some(prop) => {
            prop.value = value;
            true
        }
        None => false,
    }
}

fn object_handle<T: From<control::RawResourceHandle>>(value: u64) -> Option<T> {
    control::from_u32(u32::try_from(value).ok()?)
}

/// A mode with simple blanking: `htotal = w + 160`, `vtotal = h + 40`.
pub fn test_mode(width: u16, height: u16, refresh: u32, preferred: bool) -> Mode {
    let htotal = width + 160;
    let vtotal = height + 40;
    let clock = (u64::from(htotal) * u64::from(vtotal) * u64::from(refresh) + 500) / 1000;
    let type_ = if preferred {
        drm_ffi::DRM_MODE_TYPE_PREFERRED | drm_ffi::DRM_MODE_TYPE_DRIVER
    } else {
        drm_ffi::DRM_MODE_TYPE_DRIVER
    };

    Mode::from(drm_mode_modeinfo {
        clock: clock as u32,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal,
        vrefresh: refresh,
        flags: drm_ffi::DRM_MODE_FLAG_PHSYNC | drm_ffi::DRM_MODE_FLAG_NVSYNC,
        type_,
        name: mode_name(&format!("{width}x{height}")),
        hskew: 0,
        vscan: 0,
    })
}

#[derive(Debug)]
pub struct FakeDevice {
    state: RefCell<State>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_id: 0,
                atomic: true,
                removed: false,
                crtcs: Vec::new(),
                planes: Vec::new(),
                connectors: Vec::new(),
                blobs: HashMap::new(),
                mode_blobs: HashMap::new(),
                framebuffers: HashMap::new(),
                pending_flips: Vec::new(),
                busy: 0,
                fail_next: None,
                rejected_properties: Vec::new(),
                max_mode_width: None,
                real_commit_attempts: 0,
                commits: Vec::new(),
            }),
        }
    }

    /// Adds a CRTC with atomic gamma of `gamma_lut_size` entries.
    pub fn add_crtc(&self, gamma_lut_size: u32) -> crtc::Handle {
        self.add_crtc_inner(gamma_lut_size, true)
    }

    /// Adds a CRTC that only has the legacy gamma table.
    pub fn add_legacy_gamma_crtc(&self, gamma_length: u32) -> crtc::Handle {
        self.add_crtc_inner(gamma_length, false)
    }

    fn add_crtc_inner(&self, gamma_size: u32, atomic_gamma: bool) -> crtc::Handle {
        let mut state = self.state.borrow_mut();
        let handle = state.alloc();
        let mut props = vec![
            state.property("ACTIVE", PropertyKind::Boolean, false, 0),
            state.property("MODE_ID", PropertyKind::Blob, false, 0),
            state.property("VRR_ENABLED", PropertyKind::Boolean, false, 0),
        ];
        if atomic_gamma {
            props.push(state.property("GAMMA_LUT", PropertyKind::Blob, false, 0));
            props.push(state.property(
                "GAMMA_LUT_SIZE",
                PropertyKind::Range(0, u64::from(u32::MAX)),
                true,
                u64::from(gamma_size),
            ));
            props.push(state.property("CTM", PropertyKind::Blob, false, 0));
        }
        state.crtcs.push(FakeCrtc {
            handle,
            gamma_length: gamma_size,
            mode: None,
            props,
        });
        handle
    }

    pub fn add_plane(&self, ty: PlaneType, possible_crtcs: &[crtc::Handle]) -> plane::Handle {
        let mut state = self.state.borrow_mut();
        let handle = state.alloc();
        let type_value = match ty {
            PlaneType::Overlay => 0,
            PlaneType::Primary => 1,
            PlaneType::Cursor => 2,
        };
        let type_kind = PropertyKind::Enum(vec![
            (0, String::from("Overlay")),
            (1, String::from("Primary")),
            (2, String::from("Cursor")),
        ]);
        let src = PropertyKind::Range(0, u64::from(u32::MAX));
        let dst = PropertyKind::SignedRange(i64::from(i32::MIN), i64::from(i32::MAX));
        let dst_size = PropertyKind::Range(0, i32::MAX as u64);
        let props = vec![
            state.property("type", type_kind, true, type_value),
            state.property("FB_ID", PropertyKind::Object, false, 0),
            state.property("CRTC_ID", PropertyKind::Object, false, 0),
            state.property("SRC_X", src.clone(), false, 0),
            state.property("SRC_Y", src.clone(), false, 0),
            state.property("SRC_W", src.clone(), false, 0),
            state.property("SRC_H", src, false, 0),
            state.property("CRTC_X", dst.clone(), false, 0),
            state.property("CRTC_Y", dst, false, 0),
            state.property("CRTC_W", dst_size.clone(), false, 0),
            state.property("CRTC_H", dst_size, false, 0),
        ];
        state.planes.push(FakePlane {
            handle,
            possible_crtcs: possible_crtcs.to_vec(),
            formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Argb8888 as u32],
            props,
        });
        handle
    }

    /// Adds a connected DisplayPort connector.
    pub fn add_connector(
        &self,
        modes: Vec<Mode>,
        possible_crtcs: &[crtc::Handle],
    ) -> connector::Handle {
        self.add_connector_with(connector::Interface::DisplayPort, modes, possible_crtcs)
    }

    pub fn add_connector_with(
        &self,
        interface: connector::Interface,
        modes: Vec<Mode>,
        possible_crtcs: &[crtc::Handle],
    ) -> connector::Handle {
        let mut state = self.state.borrow_mut();
        let handle = state.alloc();
        let interface_id = state
            .connectors
            .iter()
            .filter(|c| c.interface == interface)
            .map(|c| c.interface_id)
            .max()
            .unwrap_or(0)
            + 1;
        let dpms = PropertyKind::Enum(vec![
            (0, String::from("On")),
            (1, String::from("Standby")),
            (2, String::from("Suspend")),
            (3, String::from("Off")),
        ]);
        let link_status =
            PropertyKind::Enum(vec![(0, String::from("Good")), (1, String::from("Bad"))]);
        let props = vec![
            state.property("CRTC_ID", PropertyKind::Object, false, 0),
            state.property("DPMS", dpms, false, 0),
            state.property("EDID", PropertyKind::Blob, true, 0),
            state.property("non-desktop", PropertyKind::Range(0, 1), true, 0),
            state.property("vrr_capable", PropertyKind::Range(0, 1), true, 0),
            state.property("link-status", link_status, false, 0),
        ];
        state.connectors.push(FakeConnector {
            handle,
            interface,
            interface_id,
            connected: true,
            modes,
            possible_crtcs: possible_crtcs.to_vec(),
            props,
        });
        handle
    }

    /// 1920x1080 at 60 and 144 Hz (60 preferred) plus 1280x720 at 60 Hz.
    pub fn default_modes(&self) -> Vec<Mode> {
        vec![
            test_mode(1920, 1080, 60, true),
            test_mode(1920, 1080, 144, false),
            test_mode(1280, 720, 60, false),
        ]
    }

    /// Changes a property on the kernel side, ignoring mutability.
    pub fn set_property(&self, object: ObjectId, name: &str, value: u64) {
        let mut state = self.state.borrow_mut();
        let props = state.props_mut(object).unwrap();
        assert!(set(props, name, value), "no property {name} on {object:?}");
    }

    pub fn property_value(&self, object: ObjectId, name: &str) -> Option<u64> {
        let state = self.state.borrow();
        get(state.props(object)?, name)
    }

    pub fn set_modes(&self, connector: connector::Handle, modes: Vec<Mode>) {
        let mut state = self.state.borrow_mut();
        let conn = state.connectors.iter_mut().find(|c| c.handle == connector).unwrap();
        conn.modes = modes;
    }

    pub fn set_connected(&self, connector: connector::Handle, connected: bool) {
        let mut state = self.state.borrow_mut();
        let conn = state.connectors.iter_mut().find(|c| c.handle == connector).unwrap();
        conn.connected = connected;
    }

    /// Unplugs a connector object entirely, as happens with DP MST.
    pub fn remove_connector(&self, connector: connector::Handle) {
        self.state.borrow_mut().connectors.retain(|c| c.handle != connector);
    }

    /// Leaves `crtc` scanning out `mode`, as a previous DRM master would.
    pub fn light_up(&self, crtc: crtc::Handle, mode: Mode) {
        let mut state = self.state.borrow_mut();
        let blob = u64::from(state.alloc_raw());
        state.mode_blobs.insert(blob, mode);
        let fake = state.crtcs.iter_mut().find(|c| c.handle == crtc).unwrap();
        fake.mode = Some(mode);
        set(&mut fake.props, "MODE_ID", blob);
        set(&mut fake.props, "ACTIVE", 1);
    }

    /// Routes `connector` to `crtc` on the kernel side.
    pub fn route(&self, connector: connector::Handle, crtc: crtc::Handle) {
        self.set_property(connector.into(), "CRTC_ID", raw_id(crtc));
    }

    pub fn set_atomic(&self, atomic: bool) {
        self.state.borrow_mut().atomic = atomic;
    }

    /// The next `count` real commits fail with `EBUSY`.
    pub fn set_busy(&self, count: u32) {
        self.state.borrow_mut().busy = count;
    }

    /// The next real commit fails with `code`.
    pub fn fail_next_commit(&self, code: i32) {
        self.state.borrow_mut().fail_next = Some(code);
    }

    /// Any commit carrying a property called `name` is refused with `EINVAL`.
    pub fn reject_property(&self, name: &str) {
        self.state.borrow_mut().rejected_properties.push(name.to_owned());
    }

    pub fn accept_property(&self, name: &str) {
        self.state.borrow_mut().rejected_properties.retain(|n| n != name);
    }

    /// Modes wider than `width` are refused with `EINVAL`.
    pub fn set_max_mode_width(&self, width: u16) {
        self.state.borrow_mut().max_mode_width = Some(width);
    }

    /// Every ioctl fails with `ENODEV` from now on.
    pub fn unplug(&self) {
        self.state.borrow_mut().removed = true;
    }

    /// Non-test commits issued, including refused ones.
    pub fn real_commit_attempts(&self) -> u32 {
        self.state.borrow().real_commit_attempts
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.borrow().commits.clone()
    }

    pub fn last_real_commit(&self) -> Option<CommitRecord> {
        self.state.borrow().commits.iter().rev().find(|c| !c.is_test()).cloned()
    }

    pub fn clear_commits(&self) {
        self.state.borrow_mut().commits.clear();
    }

    pub fn framebuffer_exists(&self, fb: framebuffer::Handle) -> bool {
        self.state.borrow().framebuffers.contains_key(&fb)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn framebuffer_data(&self, fb: framebuffer::Handle) -> Option<Vec<u8>> {
        self.state.borrow().framebuffers.get(&fb).map(|fb| fb.data.clone())
    }

    pub fn blob_count(&self) -> usize {
        let state = self.state.borrow();
        state.blobs.len() + state.mode_blobs.len()
    }

    /// Delivers the vblank of every pending flip.
    pub fn take_flips(&self) -> Vec<crtc::Handle> {
        std::mem::take(&mut self.state.borrow_mut().pending_flips)
    }

    pub fn has_pending_flip(&self, crtc: crtc::Handle) -> bool {
        self.state.borrow().pending_flips.contains(&crtc)
    }

    pub fn crtc_mode(&self, crtc: crtc::Handle) -> Option<Mode> {
        let state = self.state.borrow();
        state.crtcs.iter().find(|c| c.handle == crtc)?.mode
    }

    fn validate(
        state: &State,
        flags: AtomicCommitFlags,
        request: &[RequestEntry],
    ) -> io::Result<(NextState, Vec<crtc::Handle>)> {
        if flags.contains(AtomicCommitFlags::TEST_ONLY)
            && flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT)
        {
            return Err(errno(libc::EINVAL));
        }

        let mut next = NextState {
            crtcs: state.crtcs.clone(),
            planes: state.planes.clone(),
            connectors: state.connectors.clone(),
        };

        let mut touched_crtcs = Vec::new();
        let mut touched_connectors = Vec::new();
        let mut touched_planes = Vec::new();

        for &(object, prop, value) in request {
            let props = match object {
                ObjectId::Connector(h) => next
                    .connectors
                    .iter_mut()
                    .find(|c| c.handle == h)
                    .map(|c| &mut c.props),
                ObjectId::Crtc(h) => next
                    .crtcs
                    .iter_mut()
                    .find(|c| c.handle == h)
                    .map(|c| &mut c.props),
                ObjectId::Plane(h) => next
                    .planes
                    .iter_mut()
                    .find(|p| p.handle == h)
                    .map(|p| &mut p.props),
            }
            .ok_or_else(|| errno(libc::ENOENT))?;

            let prop = props
                .iter_mut()
                .find(|p| p.handle == prop)
                .ok_or_else(|| errno(libc::EINVAL))?;
            if prop.immutable || state.rejected_properties.contains(&prop.name) {
                return Err(errno(libc::EINVAL));
            }
            prop.value = value;

            match object {
                ObjectId::Connector(h) => touched_connectors.push(h),
                ObjectId::Crtc(h) => touched_crtcs.push(h),
                ObjectId::Plane(h) => touched_planes.push(h),
            }
        }

        let mut needs_modeset = false;

        for crtc in &mut next.crtcs {
            let old = state.crtcs.iter().find(|c| c.handle == crtc.handle).unwrap();
            let active = get(&crtc.props, "ACTIVE") == Some(1);
            let mode_id = get(&crtc.props, "MODE_ID").unwrap_or(0);

            if active != (get(&old.props, "ACTIVE") == Some(1)) {
                needs_modeset = true;
            }

            if mode_id != get(&old.props, "MODE_ID").unwrap_or(0) {
                let mode = match mode_id {
                    0 => None,
                    id => Some(*state.mode_blobs.get(&id).ok_or_else(|| errno(libc::EINVAL))?),
                };
                let changed = match (mode, old.mode) {
                    (Some(a), Some(b)) => !same_timing(&a, &b),
                    (None, None) => false,
                    _ => true,
                };
                needs_modeset |= changed;
                crtc.mode = mode;
            }

            if active && crtc.mode.is_none() {
                return Err(errno(libc::EINVAL));
            }
            if let (Some(max), Some(mode)) = (state.max_mode_width, crtc.mode) {
                if mode.size().0 > max && active {
                    return Err(errno(libc::EINVAL));
                }
            }

            let gamma = get(&crtc.props, "GAMMA_LUT").unwrap_or(0);
            if gamma != get(&old.props, "GAMMA_LUT").unwrap_or(0) && gamma != 0 {
                let size = get(&crtc.props, "GAMMA_LUT_SIZE").unwrap_or(0);
                let data = state.blobs.get(&gamma).ok_or_else(|| errno(libc::EINVAL))?;
                if data.len() as u64 != size * 8 {
                    return Err(errno(libc::EINVAL));
                }
            }
        }

        let mut affected = touched_crtcs.clone();
        let mut add_affected = |crtc: Option<crtc::Handle>| {
            if let Some(crtc) = crtc {
                if !affected.contains(&crtc) {
                    affected.push(crtc);
                }
            }
        };

        for conn in &next.connectors {
            let old = state.connectors.iter().find(|c| c.handle == conn.handle).unwrap();
            let crtc_id = get(&conn.props, "CRTC_ID").unwrap_or(0);
            if crtc_id != get(&old.props, "CRTC_ID").unwrap_or(0) {
                needs_modeset = true;
                add_affected(object_handle(get(&old.props, "CRTC_ID").unwrap_or(0)));
            }
            if let Some(crtc) = object_handle::<crtc::Handle>(crtc_id) {
                if !conn.possible_crtcs.contains(&crtc) {
                    return Err(errno(libc::EINVAL));
                }
            }
            if touched_connectors.contains(&conn.handle) {
                add_affected(object_handle(crtc_id));
            }
        }

        for plane in &next.planes {
            let fb_id = get(&plane.props, "FB_ID").unwrap_or(0);
            let crtc_id = get(&plane.props, "CRTC_ID").unwrap_or(0);
            if (fb_id == 0) != (crtc_id == 0) {
                return Err(errno(libc::EINVAL));
            }
            if let Some(fb) = object_handle::<framebuffer::Handle>(fb_id) {
                if !state.framebuffers.contains_key(&fb) {
                    return Err(errno(libc::EINVAL));
                }
            }
            if let Some(crtc) = object_handle::<crtc::Handle>(crtc_id) {
                if !plane.possible_crtcs.contains(&crtc) {
                    return Err(errno(libc::EINVAL));
                }
            }
            if touched_planes.contains(&plane.handle) {
                add_affected(object_handle(crtc_id));
                let old = state.planes.iter().find(|p| p.handle == plane.handle).unwrap();
                add_affected(object_handle(get(&old.props, "CRTC_ID").unwrap_or(0)));
            }
        }

        for &crtc in &affected {
            let Some(fake) = next.crtcs.iter().find(|c| c.handle == crtc) else {
                return Err(errno(libc::ENOENT));
            };
            let enabled = fake.mode.is_some();
            let raw = raw_id(crtc);
            let has_connectors = next
                .connectors
                .iter()
                .any(|c| get(&c.props, "CRTC_ID") == Some(raw));
            let has_planes = next
                .planes
                .iter()
                .any(|p| get(&p.props, "CRTC_ID") == Some(raw));
            if enabled != has_connectors || (has_planes && !enabled) {
                return Err(errno(libc::EINVAL));
            }
        }

        if needs_modeset && !flags.contains(AtomicCommitFlags::ALLOW_MODESET) {
            return Err(errno(libc::EINVAL));
        }

        if flags.contains(AtomicCommitFlags::NONBLOCK)
            && affected.iter().any(|c| state.pending_flips.contains(c))
        {
            return Err(errno(libc::EBUSY));
        }

        let mut flips = Vec::new();
        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            if affected.is_empty() {
                return Err(errno(libc::EINVAL));
            }
            // Switching a CRTC off still sends an event; one that stays off cannot.
            for crtc in affected {
                let is_active = |crtcs: &[FakeCrtc]| {
                    crtcs
                        .iter()
                        .find(|c| c.handle == crtc)
                        .is_some_and(|c| get(&c.props, "ACTIVE") == Some(1))
                };
                if !is_active(&state.crtcs) && !is_active(&next.crtcs) {
                    return Err(errno(libc::EINVAL));
                }
                flips.push(crtc);
            }
        }

        Ok((next, flips))
    }
}

/// Object state a commit would produce.
struct NextState {
    crtcs: Vec<FakeCrtc>,
    planes: Vec<FakePlane>,
    connectors: Vec<FakeConnector>,
}

impl KmsDevice for FakeDevice {
    fn is_atomic(&self) -> bool {
        self.state.borrow().atomic
    }

    fn cursor_size(&self) -> (u32, u32) {
        (64, 64)
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        let state = self.state.borrow();
        state.check_alive()?;
        Ok(ResourceIds {
            crtcs: state.crtcs.iter().map(|c| c.handle).collect(),
            connectors: state.connectors.iter().map(|c| c.handle).collect(),
            planes: state.planes.iter().map(|p| p.handle).collect(),
        })
    }

    fn crtc(&self, crtc: crtc::Handle) -> io::Result<CrtcSnapshot> {
        let state = self.state.borrow();
        state.check_alive()?;
        let fake = state
            .crtcs
            .iter()
            .find(|c| c.handle == crtc)
            .ok_or_else(|| errno(libc::ENOENT))?;
        Ok(CrtcSnapshot {
            handle: crtc,
            mode: fake.mode,
            gamma_length: fake.gamma_length,
        })
    }

    fn plane(&self, plane: plane::Handle) -> io::Result<PlaneSnapshot> {
        let state = self.state.borrow();
        state.check_alive()?;
        let fake = state
            .planes
            .iter()
            .find(|p| p.handle == plane)
            .ok_or_else(|| errno(libc::ENOENT))?;
        Ok(PlaneSnapshot {
            handle: plane,
            crtc: object_handle(get(&fake.props, "CRTC_ID").unwrap_or(0)),
            possible_crtcs: fake.possible_crtcs.clone(),
            formats: fake.formats.clone(),
        })
    }

    fn connector(
        &self,
        connector: connector::Handle,
        _force_probe: bool,
    ) -> io::Result<ConnectorSnapshot> {
        let state = self.state.borrow();
        state.check_alive()?;
        let fake = state
            .connectors
            .iter()
            .find(|c| c.handle == connector)
            .ok_or_else(|| errno(libc::ENOENT))?;
        Ok(ConnectorSnapshot {
            handle: connector,
            interface: fake.interface,
            interface_id: fake.interface_id,
            connected: fake.connected,
            modes: if fake.connected { fake.modes.clone() } else { Vec::new() },
            physical_size: fake.connected.then_some((600, 340)),
            possible_crtcs: fake.possible_crtcs.clone(),
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertySnapshot>> {
        let state = self.state.borrow();
        state.check_alive()?;
        let props = state.props(object).ok_or_else(|| errno(libc::ENOENT))?;
        Ok(props
            .iter()
            .map(|p| PropertySnapshot {
                handle: p.handle,
                name: p.name.clone(),
                value: p.value,
                kind: p.kind.clone(),
                immutable: p.immutable,
            })
            .collect())
    }

    fn blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        let state = self.state.borrow();
        state.check_alive()?;
        state.blobs.get(&blob).cloned().ok_or_else(|| errno(libc::ENOENT))
    }

    fn create_blob(&self, data: &mut [u8]) -> io::Result<u64> {
        let mut state = self.state.borrow_mut();
        state.check_alive()?;
        let id = u64::from(state.alloc_raw());
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        let mut state = self.state.borrow_mut();
        state.check_alive()?;
        let id = u64::from(state.alloc_raw());
        state.mode_blobs.insert(id, *mode);
        Ok(id)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let removed =
            state.blobs.remove(&blob).is_some() || state.mode_blobs.remove(&blob).is_some();
        if removed {
            Ok(())
        } else {
            Err(errno(libc::ENOENT))
        }
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &[RequestEntry]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();

        let entries = request
            .iter()
            .map(|&(object, prop, value)| {
                let name = state
                    .props(object)
                    .and_then(|props| props.iter().find(|p| p.handle == prop))
                    .map_or_else(String::new, |p| p.name.clone());
                (object, name, value)
            })
            .collect();
        state.commits.push(CommitRecord { flags, entries });

        let test_only = flags.contains(AtomicCommitFlags::TEST_ONLY);
        if !test_only {
            state.real_commit_attempts += 1;
        }

        state.check_alive()?;
        let (next, flips) = Self::validate(&state, flags, request)?;

        if test_only {
            return Ok(());
        }

        if state.busy > 0 {
            state.busy -= 1;
            return Err(errno(libc::EBUSY));
        }
        if let Some(code) = state.fail_next.take() {
            return Err(errno(code));
        }

        state.crtcs = next.crtcs;
        state.planes = next.planes;
        state.connectors = next.connectors;
        for crtc in flips {
            if !state.pending_flips.contains(&crtc) {
                state.pending_flips.push(crtc);
            }
        }
        Ok(())
    }

    fn create_dumb_framebuffer(
        &self,
        size: (u32, u32),
        _format: DrmFourcc,
    ) -> io::Result<DumbAllocation> {
        let mut state = self.state.borrow_mut();
        state.check_alive()?;
        let framebuffer = state.alloc();
        let pitch = size.0 * 4;
        state.framebuffers.insert(
            framebuffer,
            FakeFramebuffer {
                pitch,
                data: vec![0; (pitch * size.1) as usize],
            },
        );
        Ok(DumbAllocation { framebuffer, pitch })
    }

    fn fill_dumb_framebuffer(
        &self,
        framebuffer: framebuffer::Handle,
        fill: &mut dyn FnMut(&mut [u8], u32),
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.check_alive()?;
        let fb = state
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or_else(|| errno(libc::ENOENT))?;
        fill(&mut fb.data, fb.pitch);
        Ok(())
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .framebuffers
            .remove(&framebuffer)
            .map(drop)
            .ok_or_else(|| errno(libc::ENOENT))
    }
}
