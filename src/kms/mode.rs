//! Mode timing math and mode selection.

use std::iter::zip;
use std::time::Duration;

use anyhow::ensure;
use drm_ffi::drm_mode_modeinfo;
use scanout_config::{HSyncPolarity, Modeline, VSyncPolarity};
use smithay::reexports::drm::control::{Mode, ModeFlags, ModeTypeFlags};

/// Time between two vblanks of `mode`.
pub fn refresh_interval(mode: Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    let refresh_interval = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(refresh_interval)
}

/// Refresh rate of `mode` in mHz.
pub fn mode_refresh_mhz(mode: &Mode) -> i32 {
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return 0;
    }
    (mode.clock() as u64 * 1_000_000 / htotal / vtotal) as i32
}

/// Whether two modes drive the monitor identically, ignoring name and type flags.
pub fn same_timing(a: &Mode, b: &Mode) -> bool {
    a.clock() == b.clock()
        && a.size() == b.size()
        && a.hsync() == b.hsync()
        && a.vsync() == b.vsync()
        && a.hskew() == b.hskew()
        && a.vscan() == b.vscan()
        && a.flags() == b.flags()
}

pub fn calculate_drm_mode_from_modeline(modeline: &Modeline) -> anyhow::Result<Mode> {
    ensure!(
        modeline.hdisplay < modeline.hsync_start,
        "hdisplay {} must be < hsync_start {}",
        modeline.hdisplay,
        modeline.hsync_start
    );
    ensure!(
        modeline.hsync_start < modeline.hsync_end,
        "hsync_start {} must be < hsync_end {}",
        modeline.hsync_start,
        modeline.hsync_end
    );
    ensure!(
        modeline.hsync_end < modeline.htotal,
        "hsync_end {} must be < htotal {}",
        modeline.hsync_end,
        modeline.htotal
    );
    ensure!(
        modeline.vdisplay < modeline.vsync_start,
        "vdisplay {} must be < vsync_start {}",
        modeline.vdisplay,
        modeline.vsync_start
    );
    ensure!(
        modeline.vsync_start < modeline.vsync_end,
        "vsync_start {} must be < vsync_end {}",
        modeline.vsync_start,
        modeline.vsync_end
    );
    ensure!(
        modeline.vsync_end < modeline.vtotal,
        "vsync_end {} must be < vtotal {}",
        modeline.vsync_end,
        modeline.vtotal
    );

    let pixel_clock_kilo_hertz = modeline.clock * 1000.0;
    // CVT 1.2, section 3.
    let vrefresh_hertz = (pixel_clock_kilo_hertz * 1000.0)
        / (modeline.htotal as u64 * modeline.vtotal as u64) as f64;
    ensure!(
        vrefresh_hertz.is_finite(),
        "calculated refresh rate is not finite"
    );

    let flags = match modeline.hsync_polarity {
        HSyncPolarity::PHSync => ModeFlags::PHSYNC,
        HSyncPolarity::NHSync => ModeFlags::NHSYNC,
    } | match modeline.vsync_polarity {
        VSyncPolarity::PVSync => ModeFlags::PVSYNC,
        VSyncPolarity::NVSync => ModeFlags::NVSYNC,
    };

    let name = format!(
        "{}x{}@{:.2}",
        modeline.hdisplay, modeline.vdisplay, vrefresh_hertz
    );

    Ok(Mode::from(drm_mode_modeinfo {
        clock: pixel_clock_kilo_hertz.round() as u32,
        hdisplay: modeline.hdisplay,
        hsync_start: modeline.hsync_start,
        hsync_end: modeline.hsync_end,
        htotal: modeline.htotal,
        vdisplay: modeline.vdisplay,
        vsync_start: modeline.vsync_start,
        vsync_end: modeline.vsync_end,
        vtotal: modeline.vtotal,
        vrefresh: vrefresh_hertz.round() as u32,
        flags: flags.bits(),
        type_: drm_ffi::DRM_MODE_TYPE_USERDEF,
        name: mode_name(&name),
        hskew: 0,
        vscan: 0,
    }))
}

/// CVT timings without reduced blanking, matching the `cvt` utility.
pub fn calculate_mode_cvt(width: u16, height: u16, refresh: f64) -> Mode {
    let options = libdisplay_info::cvt::Options {
        red_blank_ver: libdisplay_info::cvt::ReducedBlankingVersion::None,
        h_pixels: width as i32,
        v_lines: height as i32,
        ip_freq_rqd: refresh,

        video_opt: false,
        vblank: 0f64,
        additional_hblank: 0,
        early_vsync_rqd: false,
        int_rqd: false,
        margins_rqd: false,
    };
    let timing = libdisplay_info::cvt::Timing::compute(options);

    let hsync_start = width + timing.h_front_porch as u16;
    let vsync_start = (timing.v_lines_rnd + timing.v_front_porch) as u16;
    let hsync_end = hsync_start + timing.h_sync as u16;
    let vsync_end = vsync_start + timing.v_sync as u16;

    let htotal = hsync_end + timing.h_back_porch as u16;
    let vtotal = vsync_end + timing.v_back_porch as u16;

    let name = format!("{width}x{height}@{:.2}", timing.act_frame_rate);

    Mode::from(drm_mode_modeinfo {
        clock: f64::round(timing.act_pixel_freq * 1000f64) as u32,
        hdisplay: width,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay: height,
        vsync_start,
        vsync_end,
        vtotal,
        vrefresh: f64::round(timing.act_frame_rate) as u32,
        flags: drm_ffi::DRM_MODE_FLAG_NHSYNC | drm_ffi::DRM_MODE_FLAG_PVSYNC,
        type_: drm_ffi::DRM_MODE_TYPE_USERDEF,
        name: mode_name(&name),
        hskew: 0,
        vscan: 0,
    })
}

/// Truncates to 31 bytes plus the terminating NUL.
pub(super) fn mode_name(name: &str) -> [core::ffi::c_char; 32] {
    let mut out: [core::ffi::c_char; 32] = [0; 32];
    for (a, b) in zip(&mut out[..31], name.as_bytes()) {
        // u8 on aarch64, i8 on x86_64.
        *a = *b as _;
    }
    out
}

/// Picks a mode for a connector.
///
/// Returns the mode and whether the configured mode was unavailable and a fallback was used.
pub fn pick_mode(modes: &[Mode], target: Option<scanout_config::Mode>) -> Option<(Mode, bool)> {
    let mut mode = None;
    let mut fallback = false;

    if let Some(target) = target {
        let target_mode = target.mode;

        if target.custom {
            if let Some(refresh) = target_mode.refresh {
                let custom = calculate_mode_cvt(target_mode.width, target_mode.height, refresh);
                return Some((custom, false));
            }
            warn!("ignoring custom mode without refresh rate");
        }

        let refresh = target_mode.refresh.map(|r| (r * 1000.).round() as i32);
        for m in modes {
            if m.size() != (target_mode.width, target_mode.height) {
                continue;
            }

            // Interlaced modes don't appear to work.
            if m.flags().contains(ModeFlags::INTERLACE) {
                continue;
            }

            if let Some(refresh) = refresh {
                // Allow for rounding in the user's value.
                if (mode_refresh_mhz(m) - refresh).abs() <= 1 {
                    mode = Some(m);
                }
            } else if let Some(curr) = mode {
                if mode_refresh_mhz(curr) < mode_refresh_mhz(m) {
                    mode = Some(m);
                }
            } else {
                mode = Some(m);
            }
        }

        if mode.is_none() {
            fallback = true;
        }
    }

    if mode.is_none() {
        for m in modes {
            if !m.mode_type().contains(ModeTypeFlags::PREFERRED) {
                continue;
            }

            if let Some(curr) = mode {
                if mode_refresh_mhz(curr) < mode_refresh_mhz(m) {
                    mode = Some(m);
                }
            } else {
                mode = Some(m);
            }
        }
    }

    if mode.is_none() {
        mode = modes.first();
    }

    mode.map(|m| (*m, fallback))
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;
    use scanout_config::{ConfiguredMode, HSyncPolarity, Modeline, VSyncPolarity};

    use super::*;
    use crate::kms::fake::test_mode;

    #[test]
    fn drm_mode_from_modeline() {
        let modeline = Modeline {
            clock: 452.5,
            hdisplay: 1920,
            vdisplay: 1080,
            hsync_start: 2088,
            hsync_end: 2296,
            htotal: 2672,
            vsync_start: 1083,
            vsync_end: 1088,
            vtotal: 1177,
            hsync_polarity: HSyncPolarity::NHSync,
            vsync_polarity: VSyncPolarity::PVSync,
        };
        assert_debug_snapshot!(calculate_drm_mode_from_modeline(&modeline).unwrap(), @r#"
        Mode {
            name: "1920x1080@143.88",
            clock: 452500,
            size: (
                1920,
                1080,
            ),
            hsync: (
                2088,
                2296,
                2672,
            ),
            vsync: (
                1083,
                1088,
                1177,
            ),
            hskew: 0,
            vscan: 0,
            vrefresh: 144,
            mode_type: ModeTypeFlags(
                USERDEF,
            ),
        }
        "#);
    }

    #[test]
    fn modeline_rejects_bad_timings() {
        let modeline = Modeline {
            clock: 173.0,
            hdisplay: 1920,
            vdisplay: 1080,
            hsync_start: 1900,
            hsync_end: 2248,
            htotal: 2576,
            vsync_start: 1083,
            vsync_end: 1088,
            vtotal: 1120,
            hsync_polarity: HSyncPolarity::NHSync,
            vsync_polarity: VSyncPolarity::PVSync,
        };
        assert!(calculate_drm_mode_from_modeline(&modeline).is_err());
    }

    #[test]
    fn cvt() {
        assert_debug_snapshot!(calculate_mode_cvt(1920, 1080, 60.0), @r#"
        Mode {
            name: "1920x1080@59.96",
            clock: 173000,
            size: (
                1920,
                1080,
            ),
            hsync: (
                2048,
                2248,
                2576,
            ),
            vsync: (
                1083,
                1088,
                1120,
            ),
            hskew: 0,
            vscan: 0,
            vrefresh: 60,
            mode_type: ModeTypeFlags(
                USERDEF,
            ),
        }
        "#);
    }

    #[test]
    fn refresh_of_cvt_mode() {
        let mode = calculate_mode_cvt(1920, 1080, 60.0);
        assert_eq!(mode_refresh_mhz(&mode), 59962);
        assert_eq!(refresh_interval(mode), Duration::from_nanos(16_676_994));
    }

    #[test]
    fn pick_configured_or_preferred() {
        let modes = [
            test_mode(2560, 1440, 60, true),
            test_mode(2560, 1440, 144, false),
            test_mode(1920, 1080, 60, false),
        ];

        let target = |width, height, refresh| scanout_config::Mode {
            custom: false,
            mode: ConfiguredMode {
                width,
                height,
                refresh,
            },
        };

        // No target: preferred.
        let (mode, fallback) = pick_mode(&modes, None).unwrap();
        assert_eq!(mode.size(), (2560, 1440));
        assert_eq!(mode.vrefresh(), 60);
        assert!(!fallback);

        // Size only: highest refresh of that size.
        let (mode, _) = pick_mode(&modes, Some(target(2560, 1440, None))).unwrap();
        assert_eq!(mode.vrefresh(), 144);

        let (mode, _) = pick_mode(&modes, Some(target(1920, 1080, Some(60.)))).unwrap();
        assert_eq!(mode.size(), (1920, 1080));

        // Unknown size falls back to preferred.
        let (mode, fallback) = pick_mode(&modes, Some(target(800, 600, None))).unwrap();
        assert_eq!(mode.size(), (2560, 1440));
        assert!(fallback);

        assert!(pick_mode(&[], None).is_none());
    }

    #[test]
    fn custom_mode_uses_cvt() {
        let target = scanout_config::Mode {
            custom: true,
            mode: ConfiguredMode {
                width: 1920,
                height: 1080,
                refresh: Some(60.),
            },
        };
        let (mode, fallback) = pick_mode(&[], Some(target)).unwrap();
        assert!(same_timing(&mode, &calculate_mode_cvt(1920, 1080, 60.)));
        assert!(!fallback);
    }

    #[test]
    fn same_timing_ignores_type() {
        let a = test_mode(1920, 1080, 60, true);
        let b = test_mode(1920, 1080, 60, false);
        assert!(same_timing(&a, &b));
        assert!(!same_timing(&a, &test_mode(1920, 1080, 75, true)));
    }
}
