//! Parsing for flick:// connection descriptors.
//!
//! A descriptor is the single line a device shares so another can reach
//! it: `flick://host:port|deviceName`. Discovery beacons carry the same
//! shape, so both the manual-connect path and the beacon listener parse
//! through here.

use std::fmt;

use crate::protocol::SCHEME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub host: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor is missing the |deviceName suffix")]
    MissingName,
    #[error("descriptor is missing a host")]
    MissingHost,
    #[error("descriptor has a missing or invalid port")]
    BadPort,
}

impl PeerDescriptor {
    /// Parse a descriptor string. The scheme prefix is optional so that
    /// hand-typed `host:port|name` input works too.
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let s = s.trim();
        let rest = match s.find("://") {
            Some(i) => &s[i + 3..],
            None => s,
        };
        let (addr, name) = rest.split_once('|').ok_or(DescriptorError::MissingName)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(DescriptorError::MissingName);
        }
        // rsplit so IPv6-ish hosts with embedded colons keep their tail port.
        let (host, port) = addr.rsplit_once(':').ok_or(DescriptorError::BadPort)?;
        let host = host.trim();
        if host.is_empty() {
            return Err(DescriptorError::MissingHost);
        }
        let port: u16 = port.trim().parse().map_err(|_| DescriptorError::BadPort)?;
        Ok(Self {
            host: host.to_string(),
            port,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}:{}|{}", self.host, self.port, self.name)
    }
}
