//! Supported instruments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Instruments with a known event-to-Q geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Instrument {
    Snap,
    Arcs,
    Sequoia,
    Topaz,
}

impl Instrument {
    pub const ALL: [Instrument; 4] = [
        Instrument::Snap,
        Instrument::Arcs,
        Instrument::Sequoia,
        Instrument::Topaz,
    ];

    /// Beamline name as used in file names and messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Snap => "SNAP",
            Instrument::Arcs => "ARCS",
            Instrument::Sequoia => "SEQ",
            Instrument::Topaz => "TOPAZ",
        }
    }

    /// Default half-width (1/Angstrom) of the live Q histogram.
    #[must_use]
    pub fn default_max_q(&self) -> f64 {
        match self {
            Instrument::Snap => 10.0,
            Instrument::Arcs | Instrument::Sequoia => 20.0,
            Instrument::Topaz => 25.0,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Instrument {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SNAP" => Ok(Instrument::Snap),
            "ARCS" => Ok(Instrument::Arcs),
            "SEQ" | "SEQUOIA" => Ok(Instrument::Sequoia),
            "TOPAZ" => Ok(Instrument::Topaz),
            _ => Err(Error::UnknownInstrument(s.to_string())),
        }
    }
}

impl TryFrom<String> for Instrument {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Instrument> for String {
    fn from(value: Instrument) -> Self {
        value.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("topaz".parse::<Instrument>().unwrap(), Instrument::Topaz);
        assert_eq!("SEQUOIA".parse::<Instrument>().unwrap(), Instrument::Sequoia);
        for instrument in Instrument::ALL {
            assert_eq!(instrument.name().parse::<Instrument>().unwrap(), instrument);
        }
    }

    #[test]
    fn test_unknown_name() {
        let err = "WAND".parse::<Instrument>().unwrap_err();
        assert!(matches!(err, Error::UnknownInstrument(name) if name == "WAND"));
    }
}
