//! Node addresses and tree paths
//!
//! A [`NodeAddress`] renders as `name@host:port`; a [`NodePath`] joins the
//! addresses from the cluster root down to one member with `/`, so
//! `root@10.0.0.1:7000/worker@10.0.0.2:7000` names `worker` under `root`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AddressError;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

const GENERATED_NAME_LEN: usize = 8;

fn generated_name() -> String {
    let mut name = Uuid::new_v4().simple().to_string();
    name.truncate(GENERATED_NAME_LEN);
    name
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Address with a generated random name.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_name(generated_name(), host, port)
    }

    pub fn with_name(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same node on `port + offset`. Fails past port 65535 rather than
    /// wrapping to port 0, which would bind a random port.
    pub fn with_port_offset(&self, offset: u16) -> Result<Self, AddressError> {
        let port = self
            .port
            .checked_add(offset)
            .ok_or_else(|| AddressError::InvalidPort(format!("{}+{}", self, offset)))?;
        Ok(Self {
            name: self.name.clone(),
            host: self.host.clone(),
            port,
        })
    }

    /// Point-to-point receiver endpoint; publishers bind `port`, receivers
    /// bind `port + 1`.
    pub fn receiver_address(&self) -> Result<Self, AddressError> {
        self.with_port_offset(1)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    /// Parses `name@host:port`, or `host:port` with a generated name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(PATH_SEPARATOR) {
            return Err(AddressError::MalformedSegment(s.to_string()));
        }
        let (name, endpoint) = match s.split_once('@') {
            Some((name, endpoint)) if !name.is_empty() => (Some(name), endpoint),
            Some(_) => return Err(AddressError::MalformedSegment(s.to_string())),
            None => (None, s),
        };
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MalformedSegment(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::MalformedSegment(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(match name {
            Some(name) => Self::with_name(name, host, port),
            None => Self::new(host, port),
        })
    }
}

/// Slash-joined chain of addresses, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(String);

impl NodePath {
    pub fn root(address: &NodeAddress) -> Self {
        Self(address.to_string())
    }

    pub fn from_addresses<'a>(addresses: impl IntoIterator<Item = &'a NodeAddress>) -> Self {
        let joined = addresses
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    /// Path of `address` as a direct child of this path.
    pub fn child(&self, address: &NodeAddress) -> Self {
        Self(format!("{}{}{}", self.0, PATH_SEPARATOR, address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Number of segments; the root path has depth 1.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Parent chain, or `None` for a root path (the root has no leader).
    pub fn leader_path(&self) -> Option<NodePath> {
        let trimmed = self.0.trim_matches(PATH_SEPARATOR);
        trimmed
            .rsplit_once(PATH_SEPARATOR)
            .map(|(leader, _)| NodePath(leader.to_string()))
    }

    /// Address in the last segment.
    pub fn node_info(&self) -> Result<NodeAddress, AddressError> {
        self.segments()
            .last()
            .ok_or(AddressError::EmptyPath)?
            .parse()
    }

    /// Every address along the path, root first.
    pub fn addresses(&self) -> Result<Vec<NodeAddress>, AddressError> {
        if self.is_empty() {
            return Err(AddressError::EmptyPath);
        }
        self.segments().map(|s| s.parse::<NodeAddress>()).collect()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodePath {
    type Err = AddressError;

    /// Validates every segment; a generated name is never invented here, so
    /// each segment must carry `name@`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches(PATH_SEPARATOR);
        if trimmed.is_empty() {
            return Err(AddressError::EmptyPath);
        }
        for segment in trimmed.split(PATH_SEPARATOR) {
            if !segment.contains('@') {
                return Err(AddressError::MalformedSegment(segment.to_string()));
            }
            segment.parse::<NodeAddress>()?;
        }
        Ok(NodePath(trimmed.to_string()))
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str, port: u16) -> NodeAddress {
        NodeAddress::with_name(name, "127.0.0.1", port)
    }

    #[test]
    fn test_address_display_and_parse() {
        let a = addr("root", 8000);
        assert_eq!(a.to_string(), "root@127.0.0.1:8000");
        assert_eq!(a.endpoint(), "127.0.0.1:8000");
        assert_eq!("root@127.0.0.1:8000".parse::<NodeAddress>().unwrap(), a);
    }

    #[test]
    fn test_address_without_name_gets_generated_one() {
        let a: NodeAddress = "10.0.0.9:7000".parse().unwrap();
        assert_eq!(a.host, "10.0.0.9");
        assert_eq!(a.port, 7000);
        assert_eq!(a.name.len(), 8);

        let b = NodeAddress::new("10.0.0.9", 7000);
        assert_ne!(a.name, b.name);
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_parse_errors() {
        assert!(matches!(
            "x@host".parse::<NodeAddress>(),
            Err(AddressError::MalformedSegment(_))
        ));
        assert!(matches!(
            "x@host:notaport".parse::<NodeAddress>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            "@host:1".parse::<NodeAddress>(),
            Err(AddressError::MalformedSegment(_))
        ));
        assert!(matches!(
            "a@h:1/b@h:2".parse::<NodeAddress>(),
            Err(AddressError::MalformedSegment(_))
        ));
    }

    #[test]
    fn test_receiver_address_is_next_port() {
        let a = addr("n", 9000);
        let r = a.receiver_address().unwrap();
        assert_eq!(r.port, 9001);
        assert_eq!(r.name, "n");
    }

    #[test]
    fn test_receiver_address_on_last_port_fails() {
        let a = addr("edge", u16::MAX);
        assert_eq!(
            a.receiver_address(),
            Err(AddressError::InvalidPort("edge@127.0.0.1:65535+1".to_string()))
        );
    }

    #[test]
    fn test_path_leader_and_node_info() {
        let root = NodePath::root(&addr("root", 8000));
        let mid = root.child(&addr("mid", 7000));
        let leaf = mid.child(&addr("leaf", 8080));

        assert_eq!(
            leaf.as_str(),
            "root@127.0.0.1:8000/mid@127.0.0.1:7000/leaf@127.0.0.1:8080"
        );
        assert_eq!(leaf.depth(), 3);
        assert_eq!(leaf.leader_path(), Some(mid.clone()));
        assert_eq!(mid.leader_path(), Some(root.clone()));
        assert_eq!(root.leader_path(), None);
        assert_eq!(leaf.node_info().unwrap(), addr("leaf", 8080));
        assert_eq!(
            leaf.addresses().unwrap(),
            vec![addr("root", 8000), addr("mid", 7000), addr("leaf", 8080)]
        );
    }

    #[test]
    fn test_path_parse() {
        let path: NodePath = "/a@h:1/b@h:2/".parse().unwrap();
        assert_eq!(path.as_str(), "a@h:1/b@h:2");
        assert_eq!(
            NodePath::from_addresses(&[addr("a", 1), addr("b", 2)]).depth(),
            2
        );

        assert_eq!("".parse::<NodePath>(), Err(AddressError::EmptyPath));
        assert!(matches!(
            "a@h:1/h:2".parse::<NodePath>(),
            Err(AddressError::MalformedSegment(_))
        ));
        assert_eq!(
            NodePath::default().node_info(),
            Err(AddressError::EmptyPath)
        );
    }
}
