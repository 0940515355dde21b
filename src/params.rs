//! Serial line parameters.
//!
//! Typed configuration for the byte-stream channel. Raw numeric and textual
//! forms (config file, CLI flags) convert through the fallible `TryFrom` /
//! `FromStr` impls so an invalid combination is rejected before any host call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

/// Line parameters applied to the channel during the configuring phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParameters {
    /// Baud rate (bits per second). Must be greater than zero.
    pub baud_rate: u32,

    /// Number of data bits per character.
    pub data_bits: DataBits,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Parity checking mode.
    pub parity: Parity,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

impl SerialParameters {
    /// Reject invalid combinations before they reach the hardware.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.baud_rate == 0 {
            return Err(SessionError::ConfigurationFailed(
                "baud rate must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SerialParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = SessionError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(SessionError::ConfigurationFailed(format!(
                "data bits must be 5, 6, 7 or 8, got {other}"
            ))),
        }
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        write!(f, "{bits}")
    }
}

/// Number of stop bits.
///
/// `OnePointFive` is part of the wire-level vocabulary but not every host
/// backend can express it; such backends reject it at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl FromStr for StopBits {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(SessionError::ConfigurationFailed(format!(
                "stop bits must be \"1\", \"1.5\" or \"2\", got \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        write!(f, "{s}")
    }
}

/// Parity checking mode.
///
/// `Mark` and `Space` exist on some UARTs; backends that cannot express them
/// reject the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl FromStr for Parity {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "odd" => Ok(Parity::Odd),
            "even" => Ok(Parity::Even),
            "mark" => Ok(Parity::Mark),
            "space" => Ok(Parity::Space),
            other => Err(SessionError::ConfigurationFailed(format!(
                "parity must be none, odd, even, mark or space, got \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::None => "N",
            Parity::Odd => "O",
            Parity::Even => "E",
            Parity::Mark => "M",
            Parity::Space => "S",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let params = SerialParameters::default();
        assert_eq!(params.baud_rate, 115_200);
        assert_eq!(params.data_bits, DataBits::Eight);
        assert_eq!(params.stop_bits, StopBits::One);
        assert_eq!(params.parity, Parity::None);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_zero_baud_rejected() {
        let params = SerialParameters {
            baud_rate: 0,
            ..SerialParameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(SessionError::ConfigurationFailed(_))
        ));
    }

    #[test]
    fn test_data_bits_try_from() {
        assert_eq!(DataBits::try_from(5).unwrap(), DataBits::Five);
        assert_eq!(DataBits::try_from(8).unwrap(), DataBits::Eight);
        assert!(DataBits::try_from(9).is_err());
    }

    #[test]
    fn test_stop_bits_parse() {
        assert_eq!("1".parse::<StopBits>().unwrap(), StopBits::One);
        assert_eq!("1.5".parse::<StopBits>().unwrap(), StopBits::OnePointFive);
        assert_eq!("2".parse::<StopBits>().unwrap(), StopBits::Two);
        assert!("3".parse::<StopBits>().is_err());
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("none".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("Even".parse::<Parity>().unwrap(), Parity::Even);
        assert!("strong".parse::<Parity>().is_err());
    }

    #[test]
    fn test_display() {
        let params = SerialParameters::default();
        assert_eq!(params.to_string(), "115200/8N1");
    }
}
