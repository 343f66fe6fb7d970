//! Core addressing types shared by every subsystem
//!
//! This module provides the foundational vocabulary of the engine: logical
//! block addresses, cluster addresses, SCO (Storage Container Object) names,
//! cluster locations inside SCOs, content hashes, transaction-log ids and
//! ownership generations. Everything below the front-end addresses data in
//! these terms.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default logical block size in bytes
pub const DEFAULT_LBA_SIZE: u32 = 512;

/// Default number of LBAs per cluster
pub const DEFAULT_CLUSTER_MULTIPLIER: u32 = 8;

/// Default number of clusters per SCO
pub const DEFAULT_SCO_MULTIPLIER: u32 = 1024;

/// Default number of SCOs covered by one transaction log
pub const DEFAULT_TLOG_MULTIPLIER: u32 = 20;

/// Logical block address as seen by front-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// Convert to the cluster address containing this LBA
    pub fn to_cluster_address(self, cluster_multiplier: u32) -> ClusterAddress {
        ClusterAddress(self.0 / cluster_multiplier as u64)
    }

    /// Whether this LBA sits on a cluster boundary
    pub fn is_cluster_aligned(self, cluster_multiplier: u32) -> bool {
        self.0 % cluster_multiplier as u64 == 0
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lba:{}", self.0)
    }
}

/// Cluster-aligned logical address inside a volume
///
/// All addressing beneath the front-end is in cluster units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterAddress(pub u64);

impl ClusterAddress {
    /// The first LBA covered by this cluster address
    pub fn to_lba(self, cluster_multiplier: u32) -> Lba {
        Lba(self.0 * cluster_multiplier as u64)
    }

    /// The next cluster address
    pub fn next(self) -> ClusterAddress {
        ClusterAddress(self.0 + 1)
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ca:{:#x}", self.0)
    }
}

/// Monotonically assigned SCO number
///
/// Number 0 is reserved for the distinguished zero location; real SCOs
/// start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SCONumber(pub u32);

impl SCONumber {
    /// First valid SCO number
    pub const FIRST: SCONumber = SCONumber(1);

    /// The successor of this SCO number
    pub fn next(self) -> SCONumber {
        SCONumber(self.0 + 1)
    }
}

/// Clone generation byte
///
/// Descendants of a snapshot re-use SCO number space; the generation byte
/// keeps their backend object names from colliding with the parent's.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CloneGeneration(pub u8);

impl CloneGeneration {
    /// Generation of a volume created from scratch
    pub const BASE: CloneGeneration = CloneGeneration(0);

    /// The generation a clone of this generation receives
    pub fn child(self) -> CloneGeneration {
        CloneGeneration(self.0 + 1)
    }
}

/// Fully qualified SCO name: number plus clone generation
///
/// Rendered in backend object names as `<generation:02x>_<number:08x>_00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SCOName {
    /// The SCO number within its generation
    pub number: SCONumber,
    /// The clone generation the SCO belongs to
    pub generation: CloneGeneration,
}

impl SCOName {
    /// Create an SCO name
    pub fn new(number: SCONumber, generation: CloneGeneration) -> Self {
        Self { number, generation }
    }

    /// The backend object name for this SCO
    pub fn object_name(&self) -> String {
        format!("{:02x}_{:08x}_00", self.generation.0, self.number.0)
    }

    /// Parse a backend object name back into an SCO name
    pub fn parse_object_name(name: &str) -> Option<SCOName> {
        let mut parts = name.split('_');
        let generation = u8::from_str_radix(parts.next()?, 16).ok()?;
        let number = u32::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next()? != "00" || parts.next().is_some() {
            return None;
        }
        Some(SCOName::new(SCONumber(number), CloneGeneration(generation)))
    }
}

impl fmt::Display for SCOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_name())
    }
}

/// Physical placement of a cluster inside some SCO
///
/// The all-zero value is the distinguished "zero location" marking a
/// cluster that has never been written; reads at a zero location return
/// zero-filled data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocation {
    /// The SCO holding the cluster
    pub sco: SCOName,
    /// Cluster index inside the SCO
    pub offset: u32,
}

impl ClusterLocation {
    /// The distinguished location of an unwritten cluster
    pub const ZERO: ClusterLocation = ClusterLocation {
        sco: SCOName {
            number: SCONumber(0),
            generation: CloneGeneration(0),
        },
        offset: 0,
    };

    /// Create a location inside an SCO
    pub fn new(sco: SCOName, offset: u32) -> Self {
        Self { sco, offset }
    }

    /// Whether this is the zero location
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for ClusterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "loc:zero")
        } else {
            write!(f, "loc:{}+{}", self.sco, self.offset)
        }
    }
}

/// 256-bit content hash of a cluster
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterHash(pub [u8; 32]);

impl ClusterHash {
    /// Hash of an all-zero cluster placeholder, used with the zero location
    pub const NULL: ClusterHash = ClusterHash([0u8; 32]);

    /// Compute the hash of a cluster payload
    pub fn of(data: &[u8]) -> Self {
        ClusterHash(*blake3::hash(data).as_bytes())
    }

    /// Verify a payload against this hash
    pub fn matches(&self, data: &[u8]) -> bool {
        ClusterHash::of(data) == *self
    }
}

impl fmt::Debug for ClusterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterHash({})", &hex::encode(self.0)[..12])
    }
}

impl fmt::Display for ClusterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A cluster location paired with the content hash of the data it holds
///
/// This is the value type of the metadata store and the payload of
/// transaction-log location records. The hash is the authority used to
/// detect corruption on read-back and the key for content-based caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocationAndHash {
    /// Where the cluster lives
    pub location: ClusterLocation,
    /// Hash of the cluster contents
    pub hash: ClusterHash,
}

impl ClusterLocationAndHash {
    /// Create a location-and-hash pair
    pub fn new(location: ClusterLocation, hash: ClusterHash) -> Self {
        Self { location, hash }
    }

    /// The pair describing an unwritten cluster
    pub fn zeroed() -> Self {
        Self {
            location: ClusterLocation::ZERO,
            hash: ClusterHash::NULL,
        }
    }

    /// Whether this pair describes an unwritten cluster
    pub fn is_zero(&self) -> bool {
        self.location.is_zero()
    }
}

/// Monotonically increasing ownership generation of a volume
///
/// A fresh tag is allocated on every successful (re)acquisition of
/// ownership. Every backend object write that identifies a volume is
/// stamped with the writer's current tag; a conditional put against a
/// newer tag fails and fences the stale owner.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OwnerTag(pub u64);

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{}", self.0)
    }
}

/// Unique id of a transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TLogId(pub Uuid);

impl TLogId {
    /// Allocate a fresh TLog id
    pub fn new() -> Self {
        TLogId(Uuid::new_v4())
    }

    /// The deterministic file/object name for this TLog
    pub fn object_name(&self) -> String {
        format!("tlog_{}", self.0)
    }

    /// Parse an object name back into a TLog id
    pub fn parse_object_name(name: &str) -> Option<TLogId> {
        let id = name.strip_prefix("tlog_")?;
        Uuid::parse_str(id).ok().map(TLogId)
    }
}

impl Default for TLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_name())
    }
}

/// Volume identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Create a volume id
    pub fn new(id: impl Into<String>) -> Self {
        VolumeId(id.into())
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend namespace a volume's objects live in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Namespace {
    /// Create a namespace
    pub fn new(ns: impl Into<String>) -> Self {
        Namespace(ns.into())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot name, unique within a volume
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotName(pub String);

impl SnapshotName {
    /// Create a snapshot name
    pub fn new(name: impl Into<String>) -> Self {
        SnapshotName(name.into())
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-cache namespace handle
///
/// Handle 0 is the shared content-based namespace; location-based volumes
/// are assigned private non-zero handles.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CacheHandle(pub u64);

impl CacheHandle {
    /// The shared content-based namespace
    pub const CONTENT: CacheHandle = CacheHandle(0);

    /// Whether this is the shared content-based handle
    pub fn is_content(&self) -> bool {
        self.0 == 0
    }
}
