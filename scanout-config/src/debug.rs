use std::path::PathBuf;

const DEFAULT_COMMIT_BUSY_RETRIES: u32 = 3;
const DEFAULT_DPMS_TURN_OFF_DELAY_MS: u64 = 250;
const DEFAULT_MAX_PRESENT_RETRIES: u32 = 3;

/// Knobs for debugging and for working around driver quirks.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Debug {
    /// Only drive this DRM device.
    #[knuffel(child, unwrap(argument))]
    pub render_drm_device: Option<PathBuf>,
    #[knuffel(children(name = "ignore-drm-device"), unwrap(argument))]
    pub ignored_drm_devices: Vec<PathBuf>,
    #[knuffel(child)]
    pub disable_cursor_plane: bool,
    #[knuffel(child)]
    pub disable_monitor_names: bool,
    /// How many times a commit is resubmitted while the kernel reports the device as busy.
    #[knuffel(child, unwrap(argument), default = DEFAULT_COMMIT_BUSY_RETRIES)]
    pub commit_busy_retries: u32,
    /// Delay between a DPMS power-down request and the actual power-down.
    #[knuffel(child, unwrap(argument), default = DEFAULT_DPMS_TURN_OFF_DELAY_MS)]
    pub dpms_turn_off_delay_ms: u64,
    #[knuffel(child, unwrap(argument), default = DEFAULT_MAX_PRESENT_RETRIES)]
    pub max_present_retries: u32,
}

impl Default for Debug {
    fn default() -> Self {
        Self {
            render_drm_device: None,
            ignored_drm_devices: Vec::new(),
            disable_cursor_plane: false,
            disable_monitor_names: false,
            commit_busy_retries: DEFAULT_COMMIT_BUSY_RETRIES,
            dpms_turn_off_delay_ms: DEFAULT_DPMS_TURN_OFF_DELAY_MS,
            max_present_retries: DEFAULT_MAX_PRESENT_RETRIES,
        }
    }
}
