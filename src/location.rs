//! Global ids and process-location masks.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Processes hosting the server-side counterpart of a remote object.
    ///
    /// The empty mask marks a prototype: it is never pushed anywhere.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Location: u32 {
        const DATA_SERVER = 0x01;
        const DATA_SERVER_ROOT = 0x02;
        const RENDER_SERVER = 0x04;
        const RENDER_SERVER_ROOT = 0x08;
        const CLIENT = 0x10;
        const SERVERS = Self::DATA_SERVER.bits() | Self::RENDER_SERVER.bits();
        const CLIENT_AND_SERVERS = Self::SERVERS.bits() | Self::CLIENT.bits();
    }
}

impl Location {
    /// Location bits that require a round trip to a server process.
    #[must_use]
    pub fn server_part(self) -> Self {
        self.difference(Self::CLIENT)
    }

    /// Parse the `processes="client|dataserver|renderserver"` definition attribute.
    ///
    /// Unknown tokens are ignored; an empty or absent value yields the default.
    #[must_use]
    pub fn from_processes_attribute(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::CLIENT_AND_SERVERS;
        };
        let mut location = Self::empty();
        for token in value.split('|').map(str::trim) {
            match token {
                "client" => location |= Self::CLIENT,
                "dataserver" => location |= Self::DATA_SERVER,
                "dataserver_root" => location |= Self::DATA_SERVER_ROOT,
                "renderserver" => location |= Self::RENDER_SERVER,
                "renderserver_root" => location |= Self::RENDER_SERVER_ROOT,
                _ => {}
            }
        }
        if location.is_empty() { Self::CLIENT_AND_SERVERS } else { location }
    }
}

/// Session-unique identifier joining a client object to its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GlobalId(u32);

impl GlobalId {
    /// Not yet assigned.
    pub const UNSET: Self = Self(0);
    /// Session proxy manager.
    pub const PROXY_MANAGER: Self = Self(1);
    /// Proxy definition manager.
    pub const DEFINITION_MANAGER: Self = Self(2);
    /// Collaboration manager.
    pub const COLLABORATION_MANAGER: Self = Self(3);
    /// Ids up to and including this value are never handed out dynamically.
    pub const RESERVED_MAX: u32 = 100;

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
