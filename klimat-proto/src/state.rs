use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Filter counters at or below this many hours ask for a replacement (two weeks)
pub const FILTER_WARNING_HOURS: i64 = 336;

/// Humidity target the device treats as "max"
pub const MAX_HUMIDITY_TARGET: u8 = 70;

/// Declares an enum over the string codes the firmware uses for a setting.
/// Codes the firmware sends that we don't know about are kept in `Other`.
macro_rules! device_code {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal, [$($alias:literal),+]),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            Other(String),
        }

        impl $name {
            /// Code as it appears on the wire
            pub fn code(&self) -> &str {
                match self {
                    $($name::$variant => $code,)+
                    $name::Other(code) => code.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(code: String) -> Self {
                match code.as_str() {
                    $($code => $name::$variant,)+
                    _ => $name::Other(code),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.code().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($($alias)|+ => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

device_code! {
    /// Speed at which the fan runs (`om`)
    FanSpeed {
        Silent = "s", ["silent", "s"],
        Speed1 = "1", ["1"],
        Speed2 = "2", ["2"],
        Speed3 = "3", ["3"],
        Turbo = "t", ["turbo", "t"],
    }
}

impl FanSpeed {
    /// Rotation speed in percent
    pub fn rotation_speed(&self) -> u8 {
        match self {
            FanSpeed::Silent => 5,
            FanSpeed::Speed1 => 20,
            FanSpeed::Speed2 => 40,
            FanSpeed::Speed3 => 80,
            FanSpeed::Turbo => 100,
            FanSpeed::Other(_) => 0,
        }
    }
}

device_code! {
    /// Whether the device is powered on (`pwr`)
    Power {
        Off = "0", ["off", "no", "0"],
        On = "1", ["on", "yes", "1"],
    }
}

impl Default for Power {
    fn default() -> Self {
        Power::Off
    }
}

device_code! {
    /// Operating mode (`mode`)
    Mode {
        Auto = "P", ["auto"],
        Allergen = "A", ["allergen"],
        Sleep = "S", ["sleep"],
        Manual = "M", ["manual"],
        Bacteria = "B", ["bacteria"],
        Night = "N", ["night"],
    }
}

device_code! {
    /// Purification only, or purification and humidification (`func`)
    Function {
        Purification = "P", ["purification"],
        PurificationHumidification = "PH", ["humidification"],
    }
}

impl Function {
    /// 2 while humidifying, 0 otherwise
    pub fn humidifier_state(&self) -> u8 {
        match self {
            Function::PurificationHumidification => 2,
            _ => 0,
        }
    }
}

device_code! {
    /// Which value the display shows (`ddp`)
    DisplayMode {
        Iaq = "0", ["iaq"],
        Pm25 = "1", ["pm25"],
        Humidity = "3", ["humidity"],
    }
}

/// Brightness of the display ring (`aqil`), in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Brightness(pub u8);

impl Brightness {
    pub const OFF: Brightness = Brightness(0);
    pub const QUARTER: Brightness = Brightness(25);
    pub const HALF: Brightness = Brightness(50);
    pub const THREE_QUARTERS: Brightness = Brightness(75);
    pub const FULL: Brightness = Brightness(100);
}

impl FromStr for Brightness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "100" => Ok(Brightness::FULL),
            "off" | "0" => Ok(Brightness::OFF),
            "25" => Ok(Brightness::QUARTER),
            "50" => Ok(Brightness::HALF),
            "75" => Ok(Brightness::THREE_QUARTERS),
            other => Err(format!("unknown brightness: {}", other)),
        }
    }
}

impl fmt::Display for Brightness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Indoor air quality index (`iaql`) as reported, 1..12
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AirQuality(pub i64);

impl AirQuality {
    /// Folds the device index onto a 1 (excellent) to 5 (poor) scale
    pub fn level(self) -> u8 {
        match self.0 {
            1 => 1,
            2 | 3 => 2,
            4..=6 => 3,
            7..=9 => 4,
            _ => 5,
        }
    }

    pub fn normalized(self) -> String {
        self.level().to_string()
    }
}

/// Error code reported in `err`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i64);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);
    pub const WATER_TANK_OPEN: ErrorCode = ErrorCode(32768);
    pub const CLEAN_FILTER: ErrorCode = ErrorCode(49155);
    pub const NO_WATER: ErrorCode = ErrorCode(49408);

    pub fn is_error(self) -> bool {
        self != ErrorCode::NONE
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::CLEAN_FILTER => {
                write!(f, "Error: {}, one of the filters/wick needs cleaning", self.0)
            }
            ErrorCode::NO_WATER => write!(f, "Error: {}, refill water tank", self.0),
            ErrorCode::WATER_TANK_OPEN => write!(f, "Error: {}, water tank is open", self.0),
            _ => write!(f, "Error: {}, unknown", self.0),
        }
    }
}

/// Static device description from `/sys/dev/info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Info {
    pub device_id: String,
    pub model_id: String,
    pub name: String,
    pub option: String,
    pub product_id: String,
    #[serde(rename = "swversion")]
    pub sw_version: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

/// Everything a status push reports. Replaced wholesale on every push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportedStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "modelid")]
    pub model_id: String,
    #[serde(rename = "swversion")]
    pub firmware_version: String,
    #[serde(rename = "DeviceVersion")]
    pub device_version: String,
    pub ota: String,
    /// Hours the device has been powered on
    #[serde(rename = "Runtime")]
    pub runtime: i64,
    #[serde(rename = "WifiVersion")]
    pub wifi_version: String,
    #[serde(rename = "ProductId")]
    pub product_id: String,
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    #[serde(rename = "StatusType")]
    pub status_type: String,
    #[serde(rename = "ConnectType")]
    pub connect_type: String,

    #[serde(rename = "om")]
    pub fan_speed: Option<FanSpeed>,
    #[serde(rename = "pwr")]
    pub power: Power,
    #[serde(rename = "cl")]
    pub child_lock: bool,
    #[serde(rename = "aqil")]
    pub brightness: Brightness,
    /// Backlight of the buttons
    #[serde(rename = "uil")]
    pub button_backlight: String,
    /// Hours set on the timer
    #[serde(rename = "dt")]
    pub timer: i64,
    /// Minutes left on the timer
    #[serde(rename = "dtrs")]
    pub timer_remaining: i64,
    pub mode: Option<Mode>,
    #[serde(rename = "func")]
    pub function: Option<Function>,

    #[serde(rename = "rhset")]
    pub humidity_target: i64,
    #[serde(rename = "rh")]
    pub humidity: i64,
    #[serde(rename = "temp")]
    pub temperature: i64,
    #[serde(rename = "pm25")]
    pub pm25: i64,
    #[serde(rename = "iaql")]
    pub air_quality: AirQuality,
    /// Threshold for air quality notifications in the app
    #[serde(rename = "aqit")]
    pub air_quality_threshold: i64,
    #[serde(rename = "ddp")]
    pub display_mode: Option<DisplayMode>,
    pub rddp: String,
    pub err: ErrorCode,
    #[serde(rename = "wl")]
    pub water_level: i64,

    /// Code shown when the HEPA filter needs replacing
    #[serde(rename = "fltt1")]
    pub hepa_filter_code: String,
    /// Code shown when the carbon filter needs replacing
    #[serde(rename = "fltt2")]
    pub carbon_filter_code: String,
    /// Hours until the pre-filter and wick need cleaning
    #[serde(rename = "fltsts0")]
    pub prefilter_clean_in: i64,
    #[serde(rename = "fltsts1")]
    pub hepa_replace_in: i64,
    #[serde(rename = "fltsts2")]
    pub carbon_replace_in: i64,
    #[serde(rename = "wicksts")]
    pub wick_replace_in: i64,
}

impl ReportedStatus {
    pub fn is_on(&self) -> bool {
        self.power == Power::On
    }

    /// True when any filter or the wick is due for cleaning or replacement
    pub fn needs_filter_attention(&self) -> bool {
        self.carbon_replace_in <= FILTER_WARNING_HOURS
            || self.hepa_replace_in <= FILTER_WARNING_HOURS
            || self.wick_replace_in <= FILTER_WARNING_HOURS
            || self.prefilter_clean_in <= 0
            || self.err == ErrorCode::CLEAN_FILTER
    }
}

/// The fields a client may change. Only fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Desired {
    #[serde(rename = "pwr", skip_serializing_if = "Option::is_none")]
    pub power: Option<Power>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(rename = "func", skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
    #[serde(rename = "om", skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<FanSpeed>,
    #[serde(rename = "aqil", skip_serializing_if = "Option::is_none")]
    pub brightness: Option<Brightness>,
    #[serde(rename = "ddp", skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<DisplayMode>,
    #[serde(rename = "cl", skip_serializing_if = "Option::is_none")]
    pub child_lock: Option<bool>,
    #[serde(rename = "rhset", skip_serializing_if = "Option::is_none")]
    pub humidity_target: Option<u8>,
}

impl Desired {
    pub fn is_empty(&self) -> bool {
        *self == Desired::default()
    }
}

/// `{"state": {...}}` wrapper used in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub state: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    pub desired: Desired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedState {
    pub reported: ReportedStatus,
}

impl Envelope<DesiredState> {
    pub fn desired(desired: Desired) -> Self {
        Self {
            state: DesiredState { desired },
        }
    }
}

/// Reply to a control post
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlAck {
    #[serde(default)]
    pub status: Option<String>,
}

impl ControlAck {
    pub const SUCCESS: &'static str = "success";

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(Self::SUCCESS)
    }
}
