//! Rendering for the TTY backend.
//!
//! Every lit output shows a solid colour that walks around the hue circle, one step per frame,
//! with a small square cursor bouncing across it. Frames are drawn into dumb buffers on the CPU
//! and paced by completion events: a new frame is drawn as soon as the previous one is on screen.

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use smithay::backend::drm::{DrmEventMetadata, DrmEventTime, DrmNode};
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{LoopHandle, RegistrationToken};
use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{connector, crtc};

use super::devices::DeviceManager;
use super::gpu::DrmGpu;
use super::output::CursorImage;
use crate::kms::{DrmFramebuffer, DumbSwapchain, GammaRamp, KmsError};
use crate::state::State;
use crate::utils::get_monotonic_time;

/// One on screen, one in flight, one being drawn.
const FRAME_BUFFERS: usize = 3;
const CURSOR_SIZE: u32 = 32;
const CURSOR_BORDER: u32 = 2;
/// Used when the refresh rate of an output is unknown.
const FALLBACK_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

/// What the test pattern looks like.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PatternOptions {
    /// Show the bouncing cursor.
    pub cursor: bool,
    /// Load a power-curve gamma ramp with this exponent into every output.
    pub gamma: Option<f64>,
}

/// Result of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderResult {
    /// The frame was queued for the next vblank.
    Submitted,
    /// Nothing was queued.
    Skipped,
}

#[derive(Debug, Default)]
pub enum RedrawState {
    /// Nothing to draw.
    #[default]
    Idle,
    /// A redraw is queued.
    Queued,
    /// A frame went out and we are waiting for its completion event.
    WaitingForVBlank { redraw_needed: bool },
    /// Nothing went out; a timer fires around the time the vblank would have come.
    WaitingForEstimatedVBlank(RegistrationToken),
    /// A redraw is queued on top of the above.
    WaitingForEstimatedVBlankAndQueued(RegistrationToken),
}

struct PatternSurface {
    name: String,
    swapchain: Option<DumbSwapchain>,
    redraw_state: RedrawState,
    /// Frames that made it on screen.
    frame: u64,
    /// Frames in a row that did not go out because the device was busy.
    busy_frames: u32,
    last_sequence: Option<u32>,
}

/// Owns the per-output render state.
pub struct RenderManager {
    options: PatternOptions,
    surfaces: HashMap<(DrmNode, connector::Handle), PatternSurface>,
}

impl RenderManager {
    pub fn new(options: PatternOptions) -> Self {
        Self {
            options,
            surfaces: HashMap::new(),
        }
    }

    /// Starts drawing on a new output.
    pub fn add_output(&mut self, gpu: &mut DrmGpu, node: DrmNode, connector: connector::Handle) {
        let Some(output) = gpu.output(connector) else {
            error!("missing output for {connector:?}");
            return;
        };
        let name = output.name().connector.clone();

        if self.options.cursor {
            let pixels = cursor_pixels();
            let image = CursorImage {
                size: (CURSOR_SIZE, CURSOR_SIZE),
                hotspot: (0, 0),
                pixels: &pixels,
            };
            if !gpu.update_cursor(connector, Some(image)) {
                debug!("{name}: drawing the cursor in software");
            }
        }

        if let Some(gamma) = self.options.gamma {
            let res = gpu
                .gamma_ramp_size(connector)
                .and_then(|size| power_ramp(size, gamma))
                .and_then(|ramp| gpu.set_gamma_ramp(connector, Some(ramp)));
            if let Err(err) = res {
                warn!("{name}: error setting gamma: {err}");
            }
        }

        self.surfaces.insert(
            (node, connector),
            PatternSurface {
                name,
                swapchain: None,
                redraw_state: RedrawState::Idle,
                frame: 0,
                busy_frames: 0,
                last_sequence: None,
            },
        );
    }

    /// Forgets the outputs of `node` that no longer exist.
    pub fn prune(
        &mut self,
        devices: &DeviceManager,
        node: DrmNode,
        event_loop: &LoopHandle<'static, State>,
    ) {
        let gpu = devices.get(&node).map(|device| &device.gpu);
        self.surfaces.retain(|&(n, connector), surface| {
            if n != node || gpu.is_some_and(|gpu| gpu.output(connector).is_some()) {
                return true;
            }
            debug!("{}: dropping render state", surface.name);
            cancel_timer(event_loop, &surface.redraw_state);
            false
        });
    }

    /// Drops everything drawn for `node`, releasing its buffers.
    pub fn remove_device(&mut self, node: DrmNode, event_loop: &LoopHandle<'static, State>) {
        self.surfaces.retain(|&(n, _), surface| {
            if n != node {
                return true;
            }
            cancel_timer(event_loop, &surface.redraw_state);
            false
        });
    }

    pub fn queue_redraw(
        &mut self,
        node: DrmNode,
        connector: connector::Handle,
        event_loop: &LoopHandle<'static, State>,
    ) {
        let Some(surface) = self.surfaces.get_mut(&(node, connector)) else {
            return;
        };

        surface.redraw_state = match mem::take(&mut surface.redraw_state) {
            RedrawState::Idle => {
                event_loop.insert_idle(move |state| state.tty.redraw(node, connector));
                RedrawState::Queued
            }
            RedrawState::WaitingForEstimatedVBlank(token) => {
                event_loop.insert_idle(move |state| state.tty.redraw(node, connector));
                RedrawState::WaitingForEstimatedVBlankAndQueued(token)
            }
            RedrawState::WaitingForVBlank { .. } => RedrawState::WaitingForVBlank {
                redraw_needed: true,
            },
            state @ (RedrawState::Queued | RedrawState::WaitingForEstimatedVBlankAndQueued(_)) => {
                state
            }
        };
    }

    /// Restarts every output after the session was resumed.
    ///
    /// Completion events for frames in flight at pause time never arrive, so every surface
    /// starts over from idle.
    pub fn on_resume(&mut self, event_loop: &LoopHandle<'static, State>) {
        for surface in self.surfaces.values_mut() {
            cancel_timer(event_loop, &surface.redraw_state);
            surface.redraw_state = RedrawState::Idle;
            surface.busy_frames = 0;
            surface.last_sequence = None;
        }
        self.queue_redraw_all(event_loop);
    }

    pub fn queue_redraw_all(&mut self, event_loop: &LoopHandle<'static, State>) {
        let keys = self.surfaces.keys().copied().collect::<Vec<_>>();
        for (node, connector) in keys {
            self.queue_redraw(node, connector, event_loop);
        }
    }

    /// Draws and presents the next frame of a queued output.
    pub fn redraw(
        &mut self,
        devices: &mut DeviceManager,
        node: DrmNode,
        connector: connector::Handle,
        event_loop: &LoopHandle<'static, State>,
        max_present_retries: u32,
    ) -> RenderResult {
        let span = tracy_client::span!("RenderManager::redraw");

        let Some(surface) = self.surfaces.get_mut(&(node, connector)) else {
            return RenderResult::Skipped;
        };
        span.emit_text(&surface.name);

        if !matches!(
            surface.redraw_state,
            RedrawState::Queued | RedrawState::WaitingForEstimatedVBlankAndQueued(_)
        ) {
            return RenderResult::Skipped;
        }

        let Some(device) = devices.get_mut(&node) else {
            error!("missing output device");
            return RenderResult::Skipped;
        };

        // Hits every time a redraw is queued while we are on a different VT; the session resume
        // queues a redraw of everything.
        if !device.is_active() {
            cancel_timer(event_loop, &surface.redraw_state);
            surface.redraw_state = RedrawState::Idle;
            return RenderResult::Skipped;
        }

        let gpu = &mut device.gpu;
        let Some(output) = gpu.output(connector) else {
            error!("{}: missing output", surface.name);
            return RenderResult::Skipped;
        };
        let crtc = output.crtc();
        let refresh_interval = output.refresh_interval();
        let mode = output.pipeline().current().mode;
        let software_cursor = self.options.cursor && output.uses_software_cursor();

        let Some(mode) = mode.filter(|_| output.wants_frames()) else {
            trace!("{}: output is off, stopping", surface.name);
            cancel_timer(event_loop, &surface.redraw_state);
            surface.redraw_state = RedrawState::Idle;
            return RenderResult::Skipped;
        };
        let (w, h) = mode.size();
        let size = (u32::from(w), u32::from(h));

        let res = draw_frame(gpu, surface, connector, size, software_cursor, self.options.cursor)
            .and_then(|fb| gpu.present(crtc, fb));

        match res {
            Ok(()) => {
                surface.busy_frames = 0;
                let new_state = RedrawState::WaitingForVBlank {
                    redraw_needed: false,
                };
                if let RedrawState::WaitingForEstimatedVBlankAndQueued(token) =
                    mem::replace(&mut surface.redraw_state, new_state)
                {
                    event_loop.remove(token);
                }
                return RenderResult::Submitted;
            }
            Err(KmsError::Busy { attempts }) => {
                surface.busy_frames += 1;
                if surface.busy_frames > max_present_retries {
                    warn!(
                        "{}: device stayed busy for {} frames, stopping",
                        surface.name, surface.busy_frames
                    );
                    surface.busy_frames = 0;
                    cancel_timer(event_loop, &surface.redraw_state);
                    surface.redraw_state = RedrawState::Idle;
                    return RenderResult::Skipped;
                }
                debug!("{}: device busy after {attempts} attempt(s), retrying", surface.name);
            }
            Err(KmsError::Inactive) => {
                trace!("{}: output is off, stopping", surface.name);
                cancel_timer(event_loop, &surface.redraw_state);
                surface.redraw_state = RedrawState::Idle;
                return RenderResult::Skipped;
            }
            Err(err) => {
                // Can fail if we switched to a different VT.
                warn!("{}: error presenting frame: {err}", surface.name);
            }
        }

        queue_estimated_vblank_timer(surface, node, connector, event_loop, refresh_interval);
        RenderResult::Skipped
    }

    pub fn on_estimated_vblank_timer(
        &mut self,
        node: DrmNode,
        connector: connector::Handle,
        event_loop: &LoopHandle<'static, State>,
    ) {
        let Some(surface) = self.surfaces.get_mut(&(node, connector)) else {
            return;
        };

        match mem::replace(&mut surface.redraw_state, RedrawState::Idle) {
            RedrawState::WaitingForEstimatedVBlank(_) => (),
            // The timer fired just in front of a redraw.
            RedrawState::WaitingForEstimatedVBlankAndQueued(_) => {
                surface.redraw_state = RedrawState::Queued;
                return;
            }
            state => {
                error!(
                    "{}: unexpected redraw state at the estimated vblank: {state:?}",
                    surface.name
                );
                surface.redraw_state = state;
                return;
            }
        }

        self.queue_redraw(node, connector, event_loop);
    }

    /// Handles a completion event for `crtc` on `node`.
    pub fn on_vblank(
        &mut self,
        devices: &mut DeviceManager,
        node: DrmNode,
        crtc: crtc::Handle,
        meta: Option<DrmEventMetadata>,
        event_loop: &LoopHandle<'static, State>,
    ) {
        let span = tracy_client::span!("RenderManager::on_vblank");

        let now = get_monotonic_time();

        let Some(device) = devices.get_mut(&node) else {
            error!("missing device in vblank callback for {crtc:?}");
            return;
        };

        let Some(connector) = device.gpu.on_page_flip(crtc) else {
            return;
        };

        let Some(surface) = self.surfaces.get_mut(&(node, connector)) else {
            error!("missing render state in vblank callback for {crtc:?}");
            return;
        };
        span.emit_text(&surface.name);

        if let Some(meta) = meta {
            let presentation_time = match meta.time {
                DrmEventTime::Monotonic(time) => time,
                // Not supported.
                DrmEventTime::Realtime(_) => Duration::ZERO,
            };

            if presentation_time.is_zero() {
                trace!("vblank on {}, presentation time unknown", surface.name);
            } else if presentation_time > now {
                let diff = presentation_time - now;
                trace!("vblank on {}, presentation is {diff:?} later", surface.name);
            } else {
                let diff = now - presentation_time;
                trace!("vblank on {}, presentation was {diff:?} ago", surface.name);
            }

            if let Some(last) = surface.last_sequence {
                let delta = meta.sequence.wrapping_sub(last);
                if delta > 1 {
                    trace!("{}: missed {} vblanks", surface.name, delta - 1);
                }
            }
            surface.last_sequence = Some(meta.sequence);
        }

        surface.frame = surface.frame.wrapping_add(1);

        match mem::replace(&mut surface.redraw_state, RedrawState::Idle) {
            RedrawState::WaitingForVBlank { redraw_needed } => {
                if redraw_needed {
                    trace!("{}: redraw was requested during the flip", surface.name);
                }
            }
            state => {
                // Shows up after modesets that were not driven by a frame of ours.
                debug!(
                    "{}: unexpected redraw state at vblank (should be WaitingForVBlank): {state:?}",
                    surface.name
                );
                cancel_timer(event_loop, &state);
            }
        }

        // The pattern animates, so there is always a next frame.
        self.queue_redraw(node, connector, event_loop);
    }
}

fn cancel_timer(event_loop: &LoopHandle<'static, State>, state: &RedrawState) {
    if let RedrawState::WaitingForEstimatedVBlank(token)
    | RedrawState::WaitingForEstimatedVBlankAndQueued(token) = state
    {
        event_loop.remove(*token);
    }
}

/// Keeps the animation going at roughly the refresh rate when a frame did not go out.
fn queue_estimated_vblank_timer(
    surface: &mut PatternSurface,
    node: DrmNode,
    connector: connector::Handle,
    event_loop: &LoopHandle<'static, State>,
    refresh_interval: Option<Duration>,
) {
    match mem::take(&mut surface.redraw_state) {
        RedrawState::WaitingForEstimatedVBlank(token)
        | RedrawState::WaitingForEstimatedVBlankAndQueued(token) => {
            surface.redraw_state = RedrawState::WaitingForEstimatedVBlank(token);
            return;
        }
        _ => (),
    }

    let duration = refresh_interval.unwrap_or(FALLBACK_REFRESH_INTERVAL);
    trace!("{}: queueing estimated vblank timer in {duration:?}", surface.name);

    let token = event_loop
        .insert_source(Timer::from_duration(duration), move |_, _, state| {
            state.tty.on_estimated_vblank_timer(node, connector);
            TimeoutAction::Drop
        })
        .unwrap();
    surface.redraw_state = RedrawState::WaitingForEstimatedVBlank(token);
}

/// Fills the next free buffer of the surface with the current frame.
fn draw_frame(
    gpu: &mut DrmGpu,
    surface: &mut PatternSurface,
    connector: connector::Handle,
    size: (u32, u32),
    software_cursor: bool,
    cursor: bool,
) -> Result<Rc<DrmFramebuffer>, KmsError> {
    let _span = tracy_client::span!("draw_frame");

    if surface.swapchain.as_ref().map(DumbSwapchain::size) != Some(size) {
        debug!("{}: allocating {}x{} buffers", surface.name, size.0, size.1);
        surface.swapchain = None;
        let device = gpu.objects().device();
        surface.swapchain = Some(DumbSwapchain::new(
            device,
            size,
            DrmFourcc::Xrgb8888,
            FRAME_BUFFERS,
        )?);
    }
    let Some(swapchain) = surface.swapchain.as_mut() else {
        return Err(KmsError::Removed);
    };
    let fb = swapchain.acquire().ok_or(KmsError::Busy { attempts: 0 })?;

    let color = pattern_color(surface.frame);
    let cursor_at = cursor.then(|| cursor_position(surface.frame, size));
    fb.fill(&mut |data, pitch| {
        fill_solid(data, pitch as usize, size, color);
        if let Some(position) = cursor_at.filter(|_| software_cursor) {
            draw_cursor(data, pitch as usize, size, position);
        }
    })?;

    if let Some(position) = cursor_at.filter(|_| !software_cursor) {
        gpu.move_cursor(connector, position);
    }

    Ok(fb)
}

/// The colour of `frame`, one hue degree per frame at full saturation.
pub fn pattern_color(frame: u64) -> [u8; 3] {
    let hue = (frame % 360) as u32;
    let sector = hue / 60;
    let rising = ((hue % 60) * 255 / 60) as u8;
    let falling = 255 - rising;

    match sector {
        0 => [255, rising, 0],
        1 => [falling, 255, 0],
        2 => [0, 255, rising],
        3 => [0, falling, 255],
        4 => [rising, 0, 255],
        _ => [255, 0, falling],
    }
}

/// Top-left corner of the cursor at `frame`, bouncing off the edges of an output of `size`.
pub fn cursor_position(frame: u64, size: (u32, u32)) -> (i32, i32) {
    fn bounce(frame: u64, speed: u64, span: u32) -> i32 {
        let span = u64::from(span.saturating_sub(CURSOR_SIZE));
        if span == 0 {
            return 0;
        }
        let travel = frame.wrapping_mul(speed) % (span * 2);
        let pos = if travel <= span { travel } else { span * 2 - travel };
        pos as i32
    }

    (bounce(frame, 4, size.0), bounce(frame, 3, size.1))
}

fn fill_solid(data: &mut [u8], pitch: usize, size: (u32, u32), [r, g, b]: [u8; 3]) {
    let row_len = size.0 as usize * 4;
    for row in data.chunks_mut(pitch).take(size.1 as usize) {
        for pixel in row[..row_len.min(row.len())].chunks_exact_mut(4) {
            pixel.copy_from_slice(&[b, g, r, 0xff]);
        }
    }
}

fn draw_cursor(data: &mut [u8], pitch: usize, size: (u32, u32), (x, y): (i32, i32)) {
    let pixels = cursor_pixels();
    let stride = CURSOR_SIZE as usize * 4;
    let (x, y) = (x.max(0) as usize, y.max(0) as usize);
    let width = (CURSOR_SIZE as usize).min((size.0 as usize).saturating_sub(x));
    let height = (CURSOR_SIZE as usize).min((size.1 as usize).saturating_sub(y));

    for row in 0..height {
        let dst = (y + row) * pitch + x * 4;
        let Some(dst) = data.get_mut(dst..dst + width * 4) else {
            break;
        };
        dst.copy_from_slice(&pixels[row * stride..row * stride + width * 4]);
    }
}

/// A white square with a black border, ARGB8888.
fn cursor_pixels() -> Vec<u8> {
    let size = CURSOR_SIZE;
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let border = x < CURSOR_BORDER
                || y < CURSOR_BORDER
                || x >= size - CURSOR_BORDER
                || y >= size - CURSOR_BORDER;
            let value = if border { 0 } else { 0xff };
            pixels.extend_from_slice(&[value, value, value, 0xff]);
        }
    }
    pixels
}

/// A ramp of `size` entries following `x^(1/gamma)` on every channel.
pub fn power_ramp(size: usize, gamma: f64) -> Result<GammaRamp, KmsError> {
    if size < 2 {
        return Err(KmsError::Unsupported("CRTC has no gamma ramp"));
    }
    if !(gamma.is_finite() && gamma > 0.) {
        return Err(KmsError::Malformed(format!("invalid gamma {gamma}")));
    }

    let last = (size - 1) as f64;
    let channel = (0..size)
        .map(|i| ((i as f64 / last).powf(1. / gamma) * f64::from(u16::MAX)).round() as u16)
        .collect::<Vec<_>>();
    GammaRamp::from_channels(&channel, &channel, &channel)
}
