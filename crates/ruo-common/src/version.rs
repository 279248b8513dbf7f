// version.rs — client version parsing and protocol capability ladder
//
// Capabilities accumulate with client version: every threshold implies all
// earlier bits, so the set for a version is the highest threshold at or
// below it. Old-style versions carry a trailing revision letter
// ("5.0.2b"); new-style carry a fourth number ("7.0.45.65").

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

impl ClientVersion {
    pub const fn new(major: u32, minor: u32, revision: u32, patch: u32) -> ClientVersion {
        ClientVersion {
            major,
            minor,
            revision,
            patch,
        }
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.patch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientVersionParseError;

impl FromStr for ClientVersion {
    type Err = ClientVersionParseError;

    /// Accepts "7.0.45.65" and the old letter form "5.0.2b"
    /// (letter 'a' is patch 1).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (numeric, letter_patch) = match s.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => {
                (&s[..s.len() - 1], (c.to_ascii_lowercase() as u32) - ('a' as u32) + 1)
            }
            _ => (s, 0),
        };

        let mut parts = numeric.split('.');
        let mut next = |required: bool| -> Result<u32, ClientVersionParseError> {
            match parts.next() {
                Some(p) => p.parse::<u32>().map_err(|_| ClientVersionParseError),
                None if required => Err(ClientVersionParseError),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(true)?;
        let revision = next(true)?;
        let mut patch = next(false)?;

        if letter_patch > 0 {
            patch = letter_patch;
        }

        Ok(ClientVersion::new(major, minor, revision, patch))
    }
}

bitflags! {
    /// Wire-protocol capability bits derived from the client version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolChanges: u32 {
        const NEW_SPELLBOOK = 1 << 0;
        const DAMAGE_PACKET = 1 << 1;
        const UNPACK = 1 << 2;
        const BUFF_ICON = 1 << 3;
        const NEW_HAVEN = 1 << 4;
        const CONTAINER_GRID_LINES = 1 << 5;
        const EXTENDED_SUPPORTED_FEATURES = 1 << 6;
        const STYGIAN_ABYSS = 1 << 7;
        const HIGH_SEAS = 1 << 8;
        const NEW_CHARACTER_LIST = 1 << 9;
        const NEW_CHARACTER_CREATION = 1 << 10;
        const EXTENDED_STATUS = 1 << 11;
        const NEW_MOBILE_INCOMING = 1 << 12;
        const NEW_SECURE_TRADING = 1 << 13;

        const VERSION_400A = Self::NEW_SPELLBOOK.bits();
        const VERSION_407A = Self::VERSION_400A.bits() | Self::DAMAGE_PACKET.bits();
        const VERSION_500A = Self::VERSION_407A.bits() | Self::UNPACK.bits();
        const VERSION_502B = Self::VERSION_500A.bits() | Self::BUFF_ICON.bits();
        const VERSION_6000 = Self::VERSION_502B.bits() | Self::NEW_HAVEN.bits();
        const VERSION_6017 = Self::VERSION_6000.bits() | Self::CONTAINER_GRID_LINES.bits();
        const VERSION_60142 = Self::VERSION_6017.bits() | Self::EXTENDED_SUPPORTED_FEATURES.bits();
        const VERSION_7000 = Self::VERSION_60142.bits() | Self::STYGIAN_ABYSS.bits();
        const VERSION_7090 = Self::VERSION_7000.bits() | Self::HIGH_SEAS.bits();
        const VERSION_70130 = Self::VERSION_7090.bits() | Self::NEW_CHARACTER_LIST.bits();
        const VERSION_70160 = Self::VERSION_70130.bits() | Self::NEW_CHARACTER_CREATION.bits();
        const VERSION_70300 = Self::VERSION_70160.bits() | Self::EXTENDED_STATUS.bits();
        const VERSION_70331 = Self::VERSION_70300.bits() | Self::NEW_MOBILE_INCOMING.bits();
        const VERSION_704565 = Self::VERSION_70331.bits() | Self::NEW_SECURE_TRADING.bits();
    }
}

/// Threshold ladder, newest first.
const THRESHOLDS: [(ClientVersion, ProtocolChanges); 14] = [
    (ClientVersion::new(7, 0, 45, 65), ProtocolChanges::VERSION_704565),
    (ClientVersion::new(7, 0, 33, 1), ProtocolChanges::VERSION_70331),
    (ClientVersion::new(7, 0, 30, 0), ProtocolChanges::VERSION_70300),
    (ClientVersion::new(7, 0, 16, 0), ProtocolChanges::VERSION_70160),
    (ClientVersion::new(7, 0, 13, 0), ProtocolChanges::VERSION_70130),
    (ClientVersion::new(7, 0, 9, 0), ProtocolChanges::VERSION_7090),
    (ClientVersion::new(7, 0, 0, 0), ProtocolChanges::VERSION_7000),
    (ClientVersion::new(6, 0, 14, 2), ProtocolChanges::VERSION_60142),
    (ClientVersion::new(6, 0, 1, 7), ProtocolChanges::VERSION_6017),
    (ClientVersion::new(6, 0, 0, 0), ProtocolChanges::VERSION_6000),
    (ClientVersion::new(5, 0, 2, 2), ProtocolChanges::VERSION_502B),
    (ClientVersion::new(5, 0, 0, 1), ProtocolChanges::VERSION_500A),
    (ClientVersion::new(4, 0, 7, 1), ProtocolChanges::VERSION_407A),
    (ClientVersion::new(4, 0, 0, 1), ProtocolChanges::VERSION_400A),
];

impl From<ClientVersion> for ProtocolChanges {
    fn from(version: ClientVersion) -> ProtocolChanges {
        for (threshold, changes) in THRESHOLDS {
            if version >= threshold {
                return changes;
            }
        }

        ProtocolChanges::empty()
    }
}

bitflags! {
    /// Facet/feature capability mask the client reports at login.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientFlags: u32 {
        const FELUCCA = 0x0001;
        const TRAMMEL = 0x0002;
        const ILSHENAR = 0x0004;
        const MALAS = 0x0008;
        const TOKUNO = 0x0010;
        const TER_MUR = 0x0020;
        const UO3D = 0x0040;
        const UOTD = 0x0100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_style() {
        let v: ClientVersion = "7.0.45.65".parse().unwrap();
        assert_eq!(v, ClientVersion::new(7, 0, 45, 65));
    }

    #[test]
    fn test_parse_letter_style() {
        let v: ClientVersion = "5.0.2b".parse().unwrap();
        assert_eq!(v, ClientVersion::new(5, 0, 2, 2));

        let v: ClientVersion = "4.0.0a".parse().unwrap();
        assert_eq!(v, ClientVersion::new(4, 0, 0, 1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("7.x.1".parse::<ClientVersion>().is_err());
        assert!("".parse::<ClientVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        let old: ClientVersion = "6.0.14.2".parse().unwrap();
        let new: ClientVersion = "7.0.0.0".parse().unwrap();
        assert!(new > old);
    }

    #[test]
    fn test_thresholds_are_monotone() {
        let mut previous = ProtocolChanges::empty();

        for (_, changes) in THRESHOLDS.iter().rev() {
            assert!(changes.contains(previous));
            previous = *changes;
        }
    }

    #[test]
    fn test_capability_lookup() {
        let v = ClientVersion::new(7, 0, 45, 65);
        assert_eq!(ProtocolChanges::from(v), ProtocolChanges::VERSION_704565);

        let v = ClientVersion::new(7, 0, 20, 0);
        let changes = ProtocolChanges::from(v);
        assert!(changes.contains(ProtocolChanges::NEW_CHARACTER_CREATION));
        assert!(!changes.contains(ProtocolChanges::EXTENDED_STATUS));

        let v = ClientVersion::new(3, 0, 0, 0);
        assert_eq!(ProtocolChanges::from(v), ProtocolChanges::empty());
    }

    #[test]
    fn test_grid_lines_gate() {
        let v = ClientVersion::new(6, 0, 1, 7);
        assert!(ProtocolChanges::from(v).contains(ProtocolChanges::CONTAINER_GRID_LINES));

        let v = ClientVersion::new(6, 0, 1, 6);
        assert!(!ProtocolChanges::from(v).contains(ProtocolChanges::CONTAINER_GRID_LINES));
    }
}
