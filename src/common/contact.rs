//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::common::Id;
use crate::Error;

/// Transport specific contact information.
///
/// Transports only need `hostname` and `port`, anything else that plugins attach
/// (keys, capabilities..) travels in `extra` and is kept as is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub hostname: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Address {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Address {
            hostname: hostname.into(),
            port,
            protocol: None,
            extra: Map::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Attach an extra field to this address.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
/// Contact entry in Kademlia routing table.
///
/// Cheap to clone, immutable once created.
pub struct Contact(Arc<ContactInner>);

#[derive(PartialEq, Eq)]
struct ContactInner {
    id: Id,
    address: Address,
}

impl Contact {
    /// Creates a new Contact from an id and an address.
    pub fn new(id: Id, address: Address) -> Contact {
        Contact(Arc::new(ContactInner { id, address }))
    }

    /// Creates a contact with a random id and a localhost address.
    pub fn random() -> Contact {
        Contact::new(Id::random(), Address::new("127.0.0.1", 0))
    }

    /// Creates a contact with a unique port number, for tests.
    #[cfg(test)]
    pub fn unique(i: usize) -> Contact {
        Contact::new(Id::random(), Address::new("127.0.0.1", i as u16))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn address(&self) -> &Address {
        &self.0.address
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.0.id)
            .field("address", &self.0.address.to_string())
            .finish()
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.0.id, self.0.address)
    }
}

/// Parses the `idHex@hostname:port` form produced by [Display].
impl FromStr for Contact {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidContact(s.to_string()))?;
        let (hostname, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidContact(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidContact(s.to_string()))?;

        Ok(Contact::new(id.parse()?, Address::new(hostname, port)))
    }
}

// On the wire a contact is the pair `[idHex, address]`.

impl Serialize for Contact {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.0.id, &self.0.address).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Contact {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (id, address) = <(Id, Address)>::deserialize(deserializer)?;

        Ok(Contact::new(id, address))
    }
}
