//! Serializable snapshot of the outputs, as printed by `scanout outputs`.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputInfo {
    /// Connector name such as `DP-1`.
    pub name: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    /// Physical size in millimeters.
    pub physical_size: Option<(u32, u32)>,
    pub modes: Vec<ModeInfo>,
    /// Index into `modes`, `None` when disabled or on a custom mode.
    pub current_mode: Option<usize>,
    pub enabled: bool,
    pub dpms: String,
    pub vrr_supported: bool,
    pub vrr_enabled: bool,
    pub software_cursor: bool,
    pub logical: Option<LogicalOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeInfo {
    pub width: u16,
    pub height: u16,
    /// Refresh rate in millihertz.
    pub refresh_rate: u32,
    pub is_preferred: bool,
}

/// Placement of an output in the global space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalOutput {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

impl OutputInfo {
    /// Human-readable multi-line description.
    pub fn format(&self) -> String {
        let mut out = String::new();

        let description = [&self.make, &self.model, &self.serial]
            .into_iter()
            .map(|part| part.as_deref().unwrap_or("Unknown"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "Output \"{description}\" ({})", self.name);

        if !self.enabled {
            let _ = writeln!(out, "  Disabled");
        } else if let Some(mode) = self.current_mode.and_then(|i| self.modes.get(i)) {
            let _ = writeln!(out, "  Current mode: {}", mode.format());
        } else {
            let _ = writeln!(out, "  Current mode: custom");
        }

        let _ = writeln!(out, "  Power: {}", self.dpms);
        let vrr = match (self.vrr_supported, self.vrr_enabled) {
            (false, _) => "not supported",
            (true, false) => "supported, disabled",
            (true, true) => "enabled",
        };
        let _ = writeln!(out, "  Variable refresh rate: {vrr}");
        if self.software_cursor {
            let _ = writeln!(out, "  Cursor: software");
        }

        if let Some((width, height)) = self.physical_size {
            let _ = writeln!(out, "  Physical size: {width}x{height} mm");
        }

        if let Some(logical) = &self.logical {
            let _ = writeln!(
                out,
                "  Logical position: {}, {}",
                logical.x, logical.y
            );
            let _ = writeln!(
                out,
                "  Logical size: {}x{}",
                logical.width, logical.height
            );
            let _ = writeln!(out, "  Scale: {}", logical.scale);
        }

        let _ = writeln!(out, "  Available modes:");
        for (i, mode) in self.modes.iter().enumerate() {
            let mut flags = Vec::new();
            if Some(i) == self.current_mode {
                flags.push("current");
            }
            if mode.is_preferred {
                flags.push("preferred");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            };
            let _ = writeln!(out, "    {}{flags}", mode.format());
        }

        out
    }
}

impl ModeInfo {
    pub fn format(&self) -> String {
        let refresh = f64::from(self.refresh_rate) / 1000.;
        format!("{}x{}@{refresh:.3}", self.width, self.height)
    }
}
