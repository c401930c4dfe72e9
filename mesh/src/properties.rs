//! Node property store
//!
//! Typed per-node attributes (IP address, ports, ...) owned by the publishing
//! node. Each key is declared once with its visibility, mutability and value
//! kind; cluster-visible values are carried in the node's [`NodeInfo`] and read
//! by peers to open connections.

use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::PropertyError;

/// Name of a node property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey(pub &'static str);

impl PropertyKey {
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

pub const IP_ADDRESS: PropertyKey = PropertyKey("ip_addr");
pub const IP_SERVER_PORT: PropertyKey = PropertyKey("ip_server_port");
pub const IP_SLAVE_PORT: PropertyKey = PropertyKey("ip_slave_port");

/// Value kind a property is declared with. Plays the role of the key's codec:
/// values of any other kind are rejected on `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    IpAddr,
    Port,
    Integer,
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyValue {
    IpAddr(IpAddr),
    Port(u16),
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::IpAddr(_) => PropertyKind::IpAddr,
            PropertyValue::Port(_) => PropertyKind::Port,
            PropertyValue::Integer(_) => PropertyKind::Integer,
            PropertyValue::Text(_) => PropertyKind::Text,
            PropertyValue::Bytes(_) => PropertyKind::Bytes,
        }
    }
}

/// Published view of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: i16,
    /// Unique name assigned by the ephemeral sequential registration
    pub name: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl NodeInfo {
    pub fn new(node_id: i16, name: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: PropertyKey, value: PropertyValue) -> Self {
        self.properties.insert(key.name().to_string(), value);
        self
    }

    pub fn property(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.properties.get(key.name())
    }

    pub fn ip_address(&self) -> Option<IpAddr> {
        match self.property(IP_ADDRESS) {
            Some(PropertyValue::IpAddr(ip)) => Some(*ip),
            _ => None,
        }
    }

    pub fn port(&self, key: PropertyKey) -> Option<u16> {
        match self.property(key) {
            Some(PropertyValue::Port(port)) => Some(*port),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PropertyDecl {
    visible: bool,
    mutable: bool,
    kind: PropertyKind,
}

#[derive(Debug)]
struct PropertyEntry {
    decl: PropertyDecl,
    value: Option<PropertyValue>,
}

/// Properties owned by the local node.
#[derive(Debug, Default)]
pub struct NodeProperties {
    entries: RwLock<HashMap<PropertyKey, PropertyEntry>>,
}

impl NodeProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a property. Declaring the same key again with the same shape is
    /// a no-op, since several components share keys such as [`IP_ADDRESS`].
    pub fn add_node_property(
        &self,
        key: PropertyKey,
        visible: bool,
        mutable: bool,
        kind: PropertyKind,
    ) -> Result<(), PropertyError> {
        let decl = PropertyDecl {
            visible,
            mutable,
            kind,
        };
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(existing) if existing.decl == decl => Ok(()),
            Some(_) => Err(PropertyError::Redeclared(key.name())),
            None => {
                entries.insert(key, PropertyEntry { decl, value: None });
                Ok(())
            }
        }
    }

    /// Set a declared property. Returns whether the cluster-visible view changed.
    pub fn set_node_property(
        &self,
        key: PropertyKey,
        value: PropertyValue,
    ) -> Result<bool, PropertyError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or(PropertyError::Undeclared(key.name()))?;

        if value.kind() != entry.decl.kind {
            return Err(PropertyError::KindMismatch {
                key: key.name(),
                expected: entry.decl.kind,
            });
        }
        if !entry.decl.mutable {
            if let Some(current) = &entry.value {
                if *current == value {
                    return Ok(false);
                }
                return Err(PropertyError::Immutable(key.name()));
            }
        }

        let changed = entry.value.as_ref() != Some(&value);
        entry.value = Some(value);
        Ok(changed && entry.decl.visible)
    }

    pub fn get_node_property(&self, key: PropertyKey) -> Option<PropertyValue> {
        self.entries
            .read()
            .get(&key)
            .and_then(|entry| entry.value.clone())
    }

    /// Cluster-visible properties that currently hold a value.
    pub fn visible(&self) -> BTreeMap<String, PropertyValue> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.decl.visible)
            .filter_map(|(key, entry)| {
                entry
                    .value
                    .clone()
                    .map(|value| (key.name().to_string(), value))
            })
            .collect()
    }
}
