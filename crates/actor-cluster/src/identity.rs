//! # Actor Identity
//!
//! Immutable value types naming everything the runtime addresses:
//!
//! - [`Node`] is a reachable endpoint (`protocol://system@host:port`). It is *not* unique across
//!   process restarts: a process that comes back on the same host and port has the same `Node`.
//! - [`UniqueNode`] pairs a `Node` with a random 64-bit `nid` minted once per process. It is the
//!   key for all per-node state (associations, membership, receptionist partitions).
//! - [`ActorPath`] is the hierarchical name of an actor (`/user/parent/child`).
//! - [`ActorId`] is node + path + incarnation. Two actors with the same path on the same node but
//!   different incarnations are different actors, so a reference to a stopped or restarted actor
//!   can never reach its successor.
//!
//! Every type renders to a canonical string (`Display`) and parses back (`FromStr`), which is what
//! logs and cross-process exchange use.

use crate::error::FrameworkError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Protocol name used in canonical node strings.
pub const DEFAULT_PROTOCOL: &str = "sact";

fn parse_error(kind: &'static str, input: &str, reason: impl Into<String>) -> FrameworkError {
    FrameworkError::Parse {
        kind,
        input: input.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// Node
// =============================================================================

/// A reachable endpoint: protocol, actor system name, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub protocol: String,
    pub system_name: String,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(system_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            system_name: system_name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// `host:port`, the form transports connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}",
            self.protocol, self.system_name, self.host, self.port
        )
    }
}

/// Splits `proto://user@host:port` into its four parts.
fn split_endpoint<'a>(
    kind: &'static str,
    input: &'a str,
) -> Result<(&'a str, &'a str, &'a str, u16), FrameworkError> {
    let (protocol, rest) = input
        .split_once("://")
        .ok_or_else(|| parse_error(kind, input, "missing `://`"))?;
    let (user, authority) = rest
        .split_once('@')
        .ok_or_else(|| parse_error(kind, input, "missing `@`"))?;
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| parse_error(kind, input, "missing port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| parse_error(kind, input, e.to_string()))?;
    if protocol.is_empty() || user.is_empty() || host.is_empty() {
        return Err(parse_error(kind, input, "empty component"));
    }
    Ok((protocol, user, host, port))
}

impl FromStr for Node {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, system_name, host, port) = split_endpoint("node", s)?;
        Ok(Node::new(system_name, host, port).with_protocol(protocol))
    }
}

// =============================================================================
// UniqueNode
// =============================================================================

/// A [`Node`] plus the random id of the process currently bound to it.
///
/// Created once at actor system startup. A restarted process gets a fresh `nid` and therefore
/// is a different member as far as associations and membership are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueNode {
    pub node: Node,
    pub nid: u64,
}

impl UniqueNode {
    pub fn new(node: Node, nid: u64) -> Self {
        Self { node, nid }
    }

    /// Mints a fresh identity for `node`. The nid is never zero.
    pub fn generate(node: Node) -> Self {
        let nid = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 {
                break candidate;
            }
        };
        Self { node, nid }
    }

    /// Deterministic tie-break between two handshakes racing for the same pair of nodes:
    /// the lower nid wins (node ordering breaks the practically impossible nid tie).
    pub fn wins_tie_break_against(&self, other: &UniqueNode) -> bool {
        match self.nid.cmp(&other.nid) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.node < other.node,
        }
    }
}

impl fmt::Display for UniqueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}@{}:{}",
            self.node.protocol, self.node.system_name, self.nid, self.node.host, self.node.port
        )
    }
}

impl FromStr for UniqueNode {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, user, host, port) = split_endpoint("unique node", s)?;
        let (system_name, nid) = user
            .rsplit_once(':')
            .ok_or_else(|| parse_error("unique node", s, "missing nid"))?;
        let nid = nid
            .parse::<u64>()
            .map_err(|e| parse_error("unique node", s, e.to_string()))?;
        if system_name.is_empty() {
            return Err(parse_error("unique node", s, "empty system name"));
        }
        Ok(UniqueNode::new(
            Node::new(system_name, host, port).with_protocol(protocol),
            nid,
        ))
    }
}

// =============================================================================
// ActorPath
// =============================================================================

/// Hierarchical actor name, root to leaf. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ActorPath {
    segments: Vec<String>,
}

impl ActorPath {
    /// The root path `/`. Never the path of a live actor.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new<I, S>(segments: I) -> Result<Self, FrameworkError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            Self::validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// `/user`, parent of every actor spawned through the system.
    pub fn user() -> Self {
        Self {
            segments: vec!["user".to_string()],
        }
    }

    /// `/system`, parent of runtime-owned actors.
    pub fn system() -> Self {
        Self {
            segments: vec!["system".to_string()],
        }
    }

    /// `/system/deadLetters`, the sender of messages sent from outside any actor.
    pub fn dead_letters() -> Self {
        Self {
            segments: vec!["system".to_string(), "deadLetters".to_string()],
        }
    }

    /// `/temp`, where ask promises live.
    pub fn temp() -> Self {
        Self {
            segments: vec!["temp".to_string()],
        }
    }

    pub fn validate_segment(segment: &str) -> Result<(), FrameworkError> {
        let reason = if segment.is_empty() {
            "segment must not be empty"
        } else if segment.contains('/') {
            "segment must not contain `/`"
        } else if segment.contains('#') {
            "segment must not contain `#`"
        } else if segment.chars().any(char::is_whitespace) {
            "segment must not contain whitespace"
        } else {
            return Ok(());
        };
        Err(FrameworkError::InvalidPathSegment {
            segment: segment.to_string(),
            reason,
        })
    }

    pub fn child(&self, name: &str) -> Result<ActorPath, FrameworkError> {
        Self::validate_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<ActorPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Last segment, empty for the root.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn starts_with(&self, prefix: &ActorPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl TryFrom<Vec<String>> for ActorPath {
    type Error = FrameworkError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        ActorPath::new(segments)
    }
}

impl From<ActorPath> for Vec<String> {
    fn from(path: ActorPath) -> Self {
        path.segments
    }
}

impl fmt::Display for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ActorPath {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| parse_error("actor path", s, "must start with `/`"))?;
        if rest.is_empty() {
            return Ok(ActorPath::root());
        }
        ActorPath::new(rest.split('/'))
    }
}

// =============================================================================
// ActorId
// =============================================================================

/// Unique identity of one actor instance: owning node, path and incarnation.
///
/// `metadata` is a side channel (routing hints and the like) and does not take part in
/// equality, ordering or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorId {
    node: UniqueNode,
    path: ActorPath,
    incarnation: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Vec<u8>>,
}

impl ActorId {
    pub fn new(node: UniqueNode, path: ActorPath, incarnation: u32) -> Self {
        Self {
            node,
            path,
            incarnation,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn node(&self) -> &UniqueNode {
        &self.node
    }

    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    pub fn metadata(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn is_on(&self, node: &UniqueNode) -> bool {
        &self.node == node
    }

    /// Same node and path, any incarnation.
    pub fn same_path_as(&self, other: &ActorId) -> bool {
        self.node == other.node && self.path == other.path
    }
}

impl PartialEq for ActorId {
    fn eq(&self, other: &Self) -> bool {
        self.incarnation == other.incarnation && self.path == other.path && self.node == other.node
    }
}

impl Eq for ActorId {}

impl Hash for ActorId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.path.hash(state);
        self.incarnation.hash(state);
    }
}

impl PartialOrd for ActorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActorId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node
            .cmp(&other.node)
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.incarnation.cmp(&other.incarnation))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}", self.node, self.path, self.incarnation)
    }
}

impl FromStr for ActorId {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scheme_end = s
            .find("://")
            .ok_or_else(|| parse_error("actor id", s, "missing `://`"))?
            + 3;
        let path_start = s[scheme_end..]
            .find('/')
            .map(|i| i + scheme_end)
            .ok_or_else(|| parse_error("actor id", s, "missing path"))?;
        let (node, rest) = s.split_at(path_start);
        let (path, incarnation) = rest
            .rsplit_once('#')
            .ok_or_else(|| parse_error("actor id", s, "missing `#incarnation`"))?;
        let incarnation = incarnation
            .parse::<u32>()
            .map_err(|e| parse_error("actor id", s, e.to_string()))?;
        Ok(ActorId::new(node.parse()?, path.parse()?, incarnation))
    }
}
