use std::cmp::Ordering;
use std::str::FromStr;

use crate::utils::FloatOrInt;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outputs(pub Vec<Output>);

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Output {
    #[knuffel(child)]
    pub off: bool,
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(child, unwrap(argument))]
    pub scale: Option<FloatOrInt<0, 10>>,
    #[knuffel(child)]
    pub position: Option<Position>,
    #[knuffel(child)]
    pub mode: Option<Mode>,
    #[knuffel(child)]
    pub modeline: Option<Modeline>,
    #[knuffel(child)]
    pub variable_refresh_rate: bool,
}

impl Output {
    pub fn is_vrr_enabled(&self) -> bool {
        self.variable_refresh_rate
    }
}

impl Default for Output {
    fn default() -> Self {
        Self {
            off: false,
            name: String::new(),
            scale: None,
            position: None,
            mode: None,
            modeline: None,
            variable_refresh_rate: false,
        }
    }
}

impl FromIterator<Output> for Outputs {
    fn from_iter<T: IntoIterator<Item = Output>>(iter: T) -> Self {
        Self(Vec::from_iter(iter))
    }
}

impl Outputs {
    pub fn find(&self, name: &OutputName) -> Option<&Output> {
        self.0.iter().find(|o| name.matches(&o.name))
    }

    pub fn find_mut(&mut self, name: &OutputName) -> Option<&mut Output> {
        self.0.iter_mut().find(|o| name.matches(&o.name))
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    #[knuffel(property)]
    pub x: i32,
    #[knuffel(property)]
    pub y: i32,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    #[knuffel(property, default)]
    pub custom: bool,
    #[knuffel(argument, str)]
    pub mode: ConfiguredMode,
}

/// A mode as the user writes it: `WIDTHxHEIGHT` with an optional `@REFRESH` in Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfiguredMode {
    pub width: u16,
    pub height: u16,
    pub refresh: Option<f64>,
}

impl FromStr for ConfiguredMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((width, rest)) = s.split_once('x') else {
            return Err("no 'x' separator found");
        };

        let (height, refresh) = match rest.split_once('@') {
            Some((height, refresh)) => {
                if refresh.is_empty() {
                    return Err("refresh rate should not be empty");
                }

                (height, Some(refresh))
            }
            None => (rest, None),
        };

        let width = width.parse().map_err(|_| "error parsing width")?;
        let height = height.parse().map_err(|_| "error parsing height")?;
        let refresh = refresh
            .map(str::parse)
            .transpose()
            .map_err(|_| "error parsing refresh rate")?;

        Ok(Self {
            width,
            height,
            refresh,
        })
    }
}

/// Raw timings, in the same order as an X11 modeline.
#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct Modeline {
    /// Pixel clock in MHz.
    #[knuffel(argument)]
    pub clock: f64,
    #[knuffel(argument)]
    pub hdisplay: u16,
    #[knuffel(argument)]
    pub hsync_start: u16,
    #[knuffel(argument)]
    pub hsync_end: u16,
    #[knuffel(argument)]
    pub htotal: u16,
    #[knuffel(argument)]
    pub vdisplay: u16,
    #[knuffel(argument)]
    pub vsync_start: u16,
    #[knuffel(argument)]
    pub vsync_end: u16,
    #[knuffel(argument)]
    pub vtotal: u16,
    #[knuffel(argument, str)]
    pub hsync_polarity: HSyncPolarity,
    #[knuffel(argument, str)]
    pub vsync_polarity: VSyncPolarity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HSyncPolarity {
    PHSync,
    NHSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VSyncPolarity {
    PVSync,
    NVSync,
}

impl FromStr for HSyncPolarity {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+hsync" => Ok(Self::PHSync),
            "-hsync" => Ok(Self::NHSync),
            _ => Err(r#"invalid horizontal sync polarity, can be "+hsync" or "-hsync"#),
        }
    }
}

impl FromStr for VSyncPolarity {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+vsync" => Ok(Self::PVSync),
            "-vsync" => Ok(Self::NVSync),
            _ => Err(r#"invalid vertical sync polarity, can be "+vsync" or "-vsync"#),
        }
    }
}

/// Connector name plus whatever the EDID told us about the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputName {
    pub connector: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

impl OutputName {
    pub fn from_connector(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            make: None,
            model: None,
            serial: None,
        }
    }

    pub fn format_make_model_serial(&self) -> String {
        let make = self.make.as_deref().unwrap_or("Unknown");
        let model = self.model.as_deref().unwrap_or("Unknown");
        let serial = self.serial.as_deref().unwrap_or("Unknown");
        format!("{make} {model} {serial}")
    }

    pub fn format_make_model_serial_or_connector(&self) -> String {
        if self.make.is_none() && self.model.is_none() && self.serial.is_none() {
            self.connector.to_string()
        } else {
            self.format_make_model_serial()
        }
    }

    pub fn format_description(&self) -> String {
        format!(
            "{} - {} - {}",
            self.make.as_deref().unwrap_or("Unknown"),
            self.model.as_deref().unwrap_or("Unknown"),
            self.connector,
        )
    }

    /// Whether a config `output "..."` name refers to this output.
    ///
    /// Matches the connector name, or the full "make model serial" triple.
    pub fn matches(&self, target: &str) -> bool {
        if target.eq_ignore_ascii_case(&self.connector) {
            return true;
        }

        // Without EDID data there is nothing else to match against.
        if self.make.is_none() && self.model.is_none() {
            return false;
        }

        target.eq_ignore_ascii_case(&self.format_make_model_serial())
    }

    /// Stable ordering for listings: built-in panels first, then by name.
    pub fn compare(&self, other: &Self) -> Ordering {
        let self_internal = is_internal_panel(&self.connector);
        let other_internal = is_internal_panel(&other.connector);
        other_internal
            .cmp(&self_internal)
            .then_with(|| self.make.cmp(&other.make))
            .then_with(|| self.model.cmp(&other.model))
            .then_with(|| self.serial.cmp(&other.serial))
            .then_with(|| self.connector.cmp(&other.connector))
    }
}

fn is_internal_panel(connector: &str) -> bool {
    matches!(connector.get(..4), Some("eDP-" | "LVDS" | "DSI-"))
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    fn named(connector: &str, make: &str, model: &str, serial: Option<&str>) -> OutputName {
        OutputName {
            connector: connector.to_owned(),
            make: Some(make.to_owned()),
            model: Some(model.to_owned()),
            serial: serial.map(str::to_owned),
        }
    }

    #[test]
    fn parse_configured_mode() {
        assert_debug_snapshot!("1920x1080".parse::<ConfiguredMode>(), @r"
        Ok(
            ConfiguredMode {
                width: 1920,
                height: 1080,
                refresh: None,
            },
        )
        ");
        assert_debug_snapshot!("2560x1440@143.912".parse::<ConfiguredMode>(), @r"
        Ok(
            ConfiguredMode {
                width: 2560,
                height: 1440,
                refresh: Some(
                    143.912,
                ),
            },
        )
        ");
        assert!("1920".parse::<ConfiguredMode>().is_err());
        assert!("axb".parse::<ConfiguredMode>().is_err());
        assert!("1920x1080@".parse::<ConfiguredMode>().is_err());
    }

    #[test]
    fn match_by_connector_or_edid() {
        let name = named("DP-1", "Dell Inc.", "U2720Q", Some("ABC123"));
        assert!(name.matches("DP-1"));
        assert!(name.matches("dp-1"));
        assert!(name.matches("Dell Inc. U2720Q ABC123"));
        assert!(!name.matches("Dell Inc. U2720Q"));
        assert!(!name.matches("DP-2"));

        let unnamed = OutputName::from_connector("HDMI-A-1");
        assert!(unnamed.matches("HDMI-A-1"));
        assert!(!unnamed.matches("Unknown Unknown Unknown"));
    }

    #[test]
    fn missing_serial_formats_as_unknown() {
        let name = named("DP-1", "Dell Inc.", "U2720Q", None);
        assert_eq!(name.format_make_model_serial(), "Dell Inc. U2720Q Unknown");
        assert!(name.matches("Dell Inc. U2720Q Unknown"));
        assert_eq!(name.format_description(), "Dell Inc. - U2720Q - DP-1");
    }

    #[test]
    fn internal_panels_sort_first() {
        let mut names = [
            named("HDMI-A-1", "Acme", "B", None),
            named("eDP-1", "Zzz", "Panel", None),
            named("DP-1", "Acme", "A", None),
        ];
        names.sort_by(|a, b| a.compare(b));
        let connectors: Vec<_> = names.iter().map(|n| n.connector.as_str()).collect();
        assert_eq!(connectors, ["eDP-1", "DP-1", "HDMI-A-1"]);
    }
}
