pub mod frame;
pub use frame::{Command, Frame, FrameError, FramingFault};
pub mod link;
pub use link::{LinkError, Timing};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};

/// Temperatures closer than this are treated as equal.
pub const TEMPERATURE_EPSILON: f32 = 0.1;

// Target temperature byte: 0.5 °C steps starting at '@' = 18 °C
const TEMP_BASE_CODE: u8 = b'@';
const TEMP_BASE: f32 = 18.0;

pub const MIN_TARGET_TEMPERATURE: f32 = 18.0;
pub const MAX_TARGET_TEMPERATURE: f32 = 32.0;

/// Room temperatures outside this open interval are sensor noise.
const PLAUSIBLE_ROOM_TEMPERATURE: (f32, f32) = (0.0, 50.0);

// The complete state believed to be on the unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcState {
    pub power: bool,

    pub mode: Mode,

    // Setpoint in Celsius. Ignored by the unit in Fan and Dry modes.
    pub target_temperature: f32,

    // Room temperature as reported by the unit, read-only
    pub current_temperature: f32,

    pub fan_speed: FanSpeed,
}

impl Default for AcState {
    fn default() -> Self {
        Self {
            power: false,
            mode: Mode::Auto,
            target_temperature: 22.0,
            current_temperature: 21.0,
            fan_speed: FanSpeed::Auto,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Cool,
    Heat,
    Dry,
    Fan,
}

impl Mode {
    const CODE_AUTO: u8 = b'0';
    const CODE_DRY: u8 = b'2';
    const CODE_COOL: u8 = b'3';
    const CODE_HEAT: u8 = b'4';
    const CODE_FAN: u8 = b'6';

    pub fn code(self) -> u8 {
        match self {
            Mode::Auto => Mode::CODE_AUTO,
            Mode::Cool => Mode::CODE_COOL,
            Mode::Heat => Mode::CODE_HEAT,
            Mode::Dry => Mode::CODE_DRY,
            Mode::Fan => Mode::CODE_FAN,
        }
    }

    /// Unrecognized codes read as Auto, the unit also reports '1' and '7' for it.
    pub fn from_code(code: u8) -> Self {
        match code {
            Mode::CODE_COOL => Mode::Cool,
            Mode::CODE_HEAT => Mode::Heat,
            Mode::CODE_DRY => Mode::Dry,
            Mode::CODE_FAN => Mode::Fan,
            _ => Mode::Auto,
        }
    }

    /// Whether the unit honours the setpoint in this mode
    pub fn uses_setpoint(self) -> bool {
        !matches!(self, Mode::Fan | Mode::Dry)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum FanSpeed {
    Auto,
    Quiet,
    Speed1,
    Speed2,
    Speed3,
    Speed4,
    Speed5,
}

impl FanSpeed {
    pub fn code(self) -> u8 {
        match self {
            FanSpeed::Auto => b'A',
            FanSpeed::Quiet => b'B',
            // Manual speeds count up from '3'
            FanSpeed::Speed1 => b'3',
            FanSpeed::Speed2 => b'4',
            FanSpeed::Speed3 => b'5',
            FanSpeed::Speed4 => b'6',
            FanSpeed::Speed5 => b'7',
        }
    }
}

pub fn decode_target_temperature(code: u8) -> f32 {
    TEMP_BASE + 0.5 * (code as i16 - TEMP_BASE_CODE as i16) as f32
}

/// Encodes a setpoint, clamped to the range the unit accepts.
pub fn encode_target_temperature(celsius: f32) -> u8 {
    let clamped = if celsius.is_nan() {
        MIN_TARGET_TEMPERATURE
    } else {
        celsius.clamp(MIN_TARGET_TEMPERATURE, MAX_TARGET_TEMPERATURE)
    };
    let steps = ((clamped - TEMP_BASE) * 2.0).round() as u8;
    TEMP_BASE_CODE + steps
}

/// Sensor readings are ASCII tenths of a degree with the digits reversed and
/// the sign last, "532+" is 23.5 °C.
pub fn decode_sensor_temperature(payload: &[u8]) -> Option<f32> {
    let &[d0, d1, d2, sign] = payload.get(..4)? else {
        return None;
    };

    let digit = |b: u8| b.is_ascii_digit().then(|| (b - b'0') as i32);
    let tenths = digit(d0)? + digit(d1)? * 10 + digit(d2)? * 100;
    let tenths = match sign {
        b'-' => -tenths,
        _ => tenths,
    };

    Some(tenths as f32 / 10.0)
}

pub fn is_plausible_room_temperature(celsius: f32) -> bool {
    celsius > PLAUSIBLE_ROOM_TEMPERATURE.0 && celsius < PLAUSIBLE_ROOM_TEMPERATURE.1
}

/// Fields carried by a status reply. The fourth byte (fan) must be present
/// but is not reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub power: bool,
    pub mode: Mode,
    pub target_temperature: f32,
}

impl TryFrom<&[u8]> for StatusReport {
    type Error = ();

    fn try_from(payload: &[u8]) -> Result<Self, ()> {
        match *payload {
            [power, mode, temperature, _, ..] => Ok(StatusReport {
                power: power == b'1',
                mode: Mode::from_code(mode),
                target_temperature: decode_target_temperature(temperature),
            }),
            _ => Err(()),
        }
    }
}

/// Builds the control payload for the complete state: power, mode, setpoint, fan.
pub fn control_payload(state: &AcState) -> [u8; 4] {
    let temperature = if state.mode.uses_setpoint() {
        encode_target_temperature(state.target_temperature)
    } else {
        TEMP_BASE_CODE
    };

    [
        if state.power { b'1' } else { b'0' },
        state.mode.code(),
        temperature,
        state.fan_speed.code(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_target_temperature() {
        assert_eq!(decode_target_temperature(b'@'), 18.0);
        assert_eq!(decode_target_temperature(b'L'), 24.0);
        assert_eq!(decode_target_temperature(b'M'), 24.5);
        assert_eq!(decode_target_temperature(b'<'), 16.0);

        assert_eq!(encode_target_temperature(24.0), b'L');
        assert_eq!(encode_target_temperature(24.4), b'M');
        assert_eq!(encode_target_temperature(10.0), b'@');
        assert_eq!(encode_target_temperature(40.0), b'\\');
        assert_eq!(encode_target_temperature(f32::NAN), b'@');

        for code in b'@'..=b'\\' {
            assert_eq!(encode_target_temperature(decode_target_temperature(code)), code);
        }
    }

    #[test]
    fn test_sensor_temperature() {
        assert_eq!(decode_sensor_temperature(b"532+"), Some(23.5));
        assert_eq!(decode_sensor_temperature(b"050-"), Some(-5.0));
        assert_eq!(decode_sensor_temperature(b"027+"), Some(72.0));
        assert_eq!(decode_sensor_temperature(b"53"), None);
        assert_eq!(decode_sensor_temperature(b"5x2+"), None);
        assert_eq!(decode_sensor_temperature(b"000+"), Some(0.0));
    }

    #[test]
    fn test_plausible_room_temperature() {
        assert!(is_plausible_room_temperature(21.3));
        assert!(!is_plausible_room_temperature(0.0));
        assert!(!is_plausible_room_temperature(50.0));
        assert!(!is_plausible_room_temperature(72.0));
    }

    #[test]
    fn test_mode_codes() {
        for mode in Mode::iter() {
            assert_eq!(Mode::from_code(mode.code()), mode);
        }
        assert_eq!(Mode::from_code(b'1'), Mode::Auto);
        assert_eq!(Mode::from_code(b'7'), Mode::Auto);
        assert_eq!("Cool".parse::<Mode>().unwrap(), Mode::Cool);
    }

    #[test]
    fn test_fan_codes() {
        let codes: HashSet<u8> = FanSpeed::iter().map(FanSpeed::code).collect();
        assert_eq!(codes.len(), FanSpeed::iter().count());
        assert_eq!(FanSpeed::Quiet.code(), b'B');
        assert_eq!(FanSpeed::Speed5.code(), b'7');
        assert_eq!("speed3".parse::<FanSpeed>().unwrap(), FanSpeed::Speed3);
    }

    #[test]
    fn test_status_report() {
        let report = StatusReport::try_from(&[0x31, 0x33, b'L', b'A'][..]).unwrap();
        assert_eq!(
            report,
            StatusReport {
                power: true,
                mode: Mode::Cool,
                target_temperature: 24.0
            }
        );
        assert!(StatusReport::try_from(&b"10"[..]).is_err());
        assert!(StatusReport::try_from(&b"13L"[..]).is_err());
        assert!(StatusReport::try_from(&b"13LA00"[..]).is_ok());
    }

    #[test]
    fn test_control_payload() {
        let state = AcState {
            power: true,
            mode: Mode::Cool,
            target_temperature: 24.0,
            fan_speed: FanSpeed::Auto,
            ..Default::default()
        };
        assert_eq!(&control_payload(&state), b"13LA");

        let state = AcState {
            power: false,
            mode: Mode::Heat,
            target_temperature: 21.5,
            fan_speed: FanSpeed::Speed2,
            ..Default::default()
        };
        assert_eq!(&control_payload(&state), b"04G4");
    }

    #[test]
    fn test_control_payload_placeholder() {
        for mode in [Mode::Fan, Mode::Dry] {
            let state = AcState {
                power: true,
                mode,
                target_temperature: 27.0,
                ..Default::default()
            };
            assert_eq!(control_payload(&state)[2], b'@');
        }
    }
}
