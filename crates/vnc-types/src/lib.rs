#![forbid(unsafe_code)]
//! Identifier newtypes and small enums shared across the vnode cache crates.
//!
//! Nothing here owns state; these are the unit-carrying wrappers that keep
//! vnode identities, physical pool slots and logical block numbers from being
//! mixed up at API boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of one vnode incarnation.
///
/// A physical pool slot is reused many times; every reuse receives a fresh
/// `VnodeId`, so a stale id never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VnodeId(pub u64);

/// Identity of a mounted filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MountId(pub u64);

/// Index of a physical slot in the object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Logical block number within one vnode's buffer object.
///
/// Signed: filesystems use negative numbers for indirect/metadata blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub i64);

impl LogicalBlock {
    pub const MIN: Self = Self(i64::MIN);
    pub const MAX: Self = Self(i64::MAX);

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: i64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

/// Inclusive range of logical blocks.
///
/// Invariant: `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    start: LogicalBlock,
    end: LogicalBlock,
}

impl BlockRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start: LogicalBlock, end: LogicalBlock) -> Result<Self, TypeError> {
        if start > end {
            return Err(TypeError::EmptyRange {
                start: start.0,
                end: end.0,
            });
        }
        Ok(Self { start, end })
    }

    /// Every block from `start` to the end of the block space (truncate).
    #[must_use]
    pub fn starting_at(start: LogicalBlock) -> Self {
        Self {
            start,
            end: LogicalBlock::MAX,
        }
    }

    /// Every block a buffer object can hold.
    #[must_use]
    pub fn all() -> Self {
        Self {
            start: LogicalBlock::MIN,
            end: LogicalBlock::MAX,
        }
    }

    #[must_use]
    pub fn start(self) -> LogicalBlock {
        self.start
    }

    #[must_use]
    pub fn end(self) -> LogicalBlock {
        self.end
    }

    #[must_use]
    pub fn contains(self, block: LogicalBlock) -> bool {
        self.start <= block && block <= self.end
    }
}

/// File-object type carried by a vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnodeType {
    /// Freshly allocated, not yet attached by a filesystem.
    None,
    Regular,
    Directory,
    Block,
    Char,
    Link,
    Socket,
    Fifo,
    /// Reclaimed; the filesystem association is gone.
    Bad,
    /// List placeholder, never a real file object.
    Marker,
}

impl VnodeType {
    /// Whether the reclamation engine may consider this type at all.
    ///
    /// Half-built (`None`), already dead (`Bad`) and placeholder (`Marker`)
    /// entries are never recycle candidates.
    #[must_use]
    pub fn is_reclaimable(self) -> bool {
        !matches!(self, Self::None | Self::Bad | Self::Marker)
    }

    /// Which syncer delay applies to dirty buffers owned by this type.
    #[must_use]
    pub fn sync_class(self) -> SyncDelayClass {
        match self {
            Self::Directory => SyncDelayClass::Directory,
            Self::Block | Self::Char => SyncDelayClass::Metadata,
            Self::None
            | Self::Regular
            | Self::Link
            | Self::Socket
            | Self::Fifo
            | Self::Bad
            | Self::Marker => SyncDelayClass::File,
        }
    }
}

impl fmt::Display for VnodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Regular => "regular",
            Self::Directory => "directory",
            Self::Block => "block",
            Self::Char => "char",
            Self::Link => "link",
            Self::Socket => "socket",
            Self::Fifo => "fifo",
            Self::Bad => "bad",
            Self::Marker => "marker",
        };
        f.write_str(name)
    }
}

impl FromStr for VnodeType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "regular" | "reg" => Ok(Self::Regular),
            "directory" | "dir" => Ok(Self::Directory),
            "block" | "blk" => Ok(Self::Block),
            "char" | "chr" => Ok(Self::Char),
            "link" | "lnk" => Ok(Self::Link),
            "socket" | "sock" => Ok(Self::Socket),
            "fifo" => Ok(Self::Fifo),
            "bad" => Ok(Self::Bad),
            "marker" => Ok(Self::Marker),
            other => Err(TypeError::UnknownVnodeType(other.to_owned())),
        }
    }
}

/// Lifecycle state of a vnode.
///
/// Monotonic except for `Dead -> Uninitialized`, which only the object pool
/// performs when it hands a recycled slot out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnodeState {
    Uninitialized,
    Constructed,
    Destroying,
    Dead,
}

impl VnodeState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Uninitialized -> Destroying` is allowed: a vnode whose filesystem
    /// attach failed is doomed without ever being constructed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Constructed | Self::Destroying)
                | (Self::Constructed, Self::Destroying)
                | (Self::Destroying, Self::Dead)
                | (Self::Dead, Self::Uninitialized)
        )
    }
}

impl fmt::Display for VnodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Constructed => "constructed",
            Self::Destroying => "destroying",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Syncer delay class, selecting one of the file/directory/metadata delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDelayClass {
    File,
    Directory,
    Metadata,
}

/// Vnode events propagated to stacked (upper) filesystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpperEvent {
    /// The vnode was attached to its filesystem.
    Exists,
    /// The last use reference went away.
    Idle,
    /// The vnode is being reclaimed.
    Reclaim,
    /// Reclamation finished; the vnode is dead.
    Destroyed,
    /// The underlying file was unlinked.
    Unlink,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown vnode type: {0}")]
    UnknownVnodeType(String),
    #[error("empty block range: start {start} > end {end}")]
    EmptyRange { start: i64, end: i64 },
}

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_rejects_inverted_bounds() {
        assert!(BlockRange::new(LogicalBlock(5), LogicalBlock(4)).is_err());
        let one = BlockRange::new(LogicalBlock(4), LogicalBlock(4)).expect("single block");
        assert!(one.contains(LogicalBlock(4)));
        assert!(!one.contains(LogicalBlock(5)));
    }

    #[test]
    fn block_range_covers_negative_blocks() {
        let all = BlockRange::all();
        assert!(all.contains(LogicalBlock(-3)));
        assert!(all.contains(LogicalBlock::MAX));

        let tail = BlockRange::starting_at(LogicalBlock(0));
        assert!(!tail.contains(LogicalBlock(-1)));
        assert!(tail.contains(LogicalBlock(1 << 40)));
    }

    #[test]
    fn reclaimable_types() {
        assert!(VnodeType::Regular.is_reclaimable());
        assert!(VnodeType::Directory.is_reclaimable());
        assert!(!VnodeType::Marker.is_reclaimable());
        assert!(!VnodeType::Bad.is_reclaimable());
        assert!(!VnodeType::None.is_reclaimable());
    }

    #[test]
    fn sync_class_by_type() {
        assert_eq!(VnodeType::Regular.sync_class(), SyncDelayClass::File);
        assert_eq!(VnodeType::Directory.sync_class(), SyncDelayClass::Directory);
        assert_eq!(VnodeType::Char.sync_class(), SyncDelayClass::Metadata);
        assert_eq!(VnodeType::Block.sync_class(), SyncDelayClass::Metadata);
    }

    #[test]
    fn lifecycle_edges() {
        use VnodeState::*;
        assert!(Uninitialized.can_transition_to(Constructed));
        assert!(Constructed.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Dead));
        assert!(Dead.can_transition_to(Uninitialized));

        assert!(!Constructed.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Constructed));
        assert!(!Destroying.can_transition_to(Constructed));
        assert!(!Constructed.can_transition_to(Uninitialized));
    }

    #[test]
    fn vnode_type_parses_short_and_long_names() {
        assert_eq!("dir".parse::<VnodeType>(), Ok(VnodeType::Directory));
        assert_eq!("regular".parse::<VnodeType>(), Ok(VnodeType::Regular));
        assert!(matches!(
            "tape".parse::<VnodeType>(),
            Err(TypeError::UnknownVnodeType(_))
        ));
        for ty in [VnodeType::Fifo, VnodeType::Socket, VnodeType::Link] {
            assert_eq!(ty.to_string().parse::<VnodeType>(), Ok(ty));
        }
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&VnodeState::Destroying).expect("serialize");
        assert_eq!(json, "\"destroying\"");
        let ty: VnodeType = serde_json::from_str("\"directory\"").expect("deserialize");
        assert_eq!(ty, VnodeType::Directory);
    }
}
