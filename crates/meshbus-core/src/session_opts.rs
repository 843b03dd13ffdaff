//! Session options and their negotiation.
//!
//! Traffic type, proximity and transport are all bit-sets. A host binds a
//! port with the options it is willing to serve; a joiner asks for the options
//! it wants. The effective options are the per-field intersection, and any
//! empty intersection makes the join fail. `multipoint` is granted only when
//! both sides ask for it.

use core::fmt;
use core::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

macro_rules! bitset {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($(#[$cmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name($value);)*
            pub const NONE: $name = $name(0);

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

bitset! {
    /// Kind of traffic a session carries.
    Traffic(u8) {
        MESSAGES = 0x01;
        RAW_UNRELIABLE = 0x02;
        RAW_RELIABLE = 0x04;
    }
}

bitset! {
    Proximity(u8) {
        PHYSICAL = 0x01;
        NETWORK = 0x02;
        ANY = 0xFF;
    }
}

bitset! {
    /// Transports a session may travel over.
    TransportMask(u16) {
        LOCAL = 0x0001;
        TCP = 0x0004;
        UDP = 0x0100;
        ANY = 0xFFFF;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOpts {
    pub traffic: Traffic,
    pub proximity: Proximity,
    pub transports: TransportMask,
    pub multipoint: bool,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: Traffic::MESSAGES,
            proximity: Proximity::ANY,
            transports: TransportMask::ANY,
            multipoint: false,
        }
    }
}

/// Why two option sets could not be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incompatible {
    Traffic,
    Proximity,
    Transports,
}

impl fmt::Display for Incompatible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incompatible::Traffic => f.write_str("no common traffic type"),
            Incompatible::Proximity => f.write_str("no common proximity"),
            Incompatible::Transports => f.write_str("no common transport"),
        }
    }
}

impl SessionOpts {
    pub fn multipoint(mut self) -> Self {
        self.multipoint = true;
        self
    }

    pub fn with_transports(mut self, transports: TransportMask) -> Self {
        self.transports = transports;
        self
    }

    /// Reconcile the host's bound options with a joiner's request.
    pub fn negotiate(host: &SessionOpts, joiner: &SessionOpts) -> Result<SessionOpts, Incompatible> {
        let traffic = host.traffic & joiner.traffic;
        if traffic.is_empty() {
            return Err(Incompatible::Traffic);
        }
        let proximity = host.proximity & joiner.proximity;
        if proximity.is_empty() {
            return Err(Incompatible::Proximity);
        }
        let transports = host.transports & joiner.transports;
        if transports.is_empty() {
            return Err(Incompatible::Transports);
        }
        Ok(SessionOpts {
            traffic,
            proximity,
            transports,
            multipoint: host.multipoint && joiner.multipoint,
        })
    }

    pub fn is_compatible(&self, other: &SessionOpts) -> bool {
        Self::negotiate(self, other).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_negotiate_to_themselves() {
        let opts = SessionOpts::default();
        assert_eq!(SessionOpts::negotiate(&opts, &opts), Ok(opts));
    }

    #[test]
    fn transports_intersect() {
        let host = SessionOpts::default().with_transports(TransportMask::TCP | TransportMask::LOCAL);
        let joiner = SessionOpts::default().with_transports(TransportMask::TCP | TransportMask::UDP);
        let agreed = SessionOpts::negotiate(&host, &joiner).unwrap();
        assert_eq!(agreed.transports, TransportMask::TCP);
    }

    #[test]
    fn disjoint_transports_reject() {
        let host = SessionOpts::default().with_transports(TransportMask::LOCAL);
        let joiner = SessionOpts::default().with_transports(TransportMask::UDP);
        assert_eq!(
            SessionOpts::negotiate(&host, &joiner),
            Err(Incompatible::Transports)
        );
    }

    #[test]
    fn traffic_and_proximity_mismatch_reject() {
        let host = SessionOpts {
            traffic: Traffic::RAW_RELIABLE,
            ..SessionOpts::default()
        };
        assert_eq!(
            SessionOpts::negotiate(&host, &SessionOpts::default()),
            Err(Incompatible::Traffic)
        );

        let host = SessionOpts {
            proximity: Proximity::PHYSICAL,
            ..SessionOpts::default()
        };
        let joiner = SessionOpts {
            proximity: Proximity::NETWORK,
            ..SessionOpts::default()
        };
        assert_eq!(
            SessionOpts::negotiate(&host, &joiner),
            Err(Incompatible::Proximity)
        );
    }

    #[test]
    fn multipoint_requires_both_sides() {
        let mp = SessionOpts::default().multipoint();
        let p2p = SessionOpts::default();
        assert!(!SessionOpts::negotiate(&mp, &p2p).unwrap().multipoint);
        assert!(!SessionOpts::negotiate(&p2p, &mp).unwrap().multipoint);
        assert!(SessionOpts::negotiate(&mp, &mp).unwrap().multipoint);
    }

    #[test]
    fn bitset_helpers() {
        assert!(TransportMask::ANY.contains(TransportMask::UDP));
        assert!(!TransportMask::TCP.intersects(TransportMask::UDP));
        assert_eq!(format!("{:?}", Traffic::RAW_RELIABLE), "Traffic(0x4)");
    }
}
