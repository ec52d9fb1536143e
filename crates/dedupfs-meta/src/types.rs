use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates the id from a raw u64 value
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Returns the raw u64 value
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Inode number, unique within one subvolume
    InodeId
);
id_type!(
    /// Row id of a Hash and of the Block/CompressionType/HashSizes rows sharing it
    HashId
);
id_type!(
    /// Row id of an interned name
    NameId
);
id_type!(
    /// Row id of a tree (directory entry) node
    TreeId
);
id_type!(
    /// Subvolume (snapshot root) id
    SubvolumeId
);

impl InodeId {
    /// The root directory inode of every subvolume
    pub const ROOT: InodeId = InodeId(1);
}

/// Seconds + nanoseconds since the Unix epoch
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Builds a timestamp from milliseconds since the epoch
    pub fn from_millis(ms: u64) -> Self {
        Self {
            secs: ms / 1000,
            nanos: ((ms % 1000) * 1_000_000) as u32,
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Physical arrangement of the hash/block tables.
///
/// `Split` keeps the hash tables independently pageable, so orphan detection
/// subtracts the set of referenced hash ids. `Clustered` co-locates them with
/// the per-subvolume tables and maintains an explicit reference count per hash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// Hash tables paged independently
    #[default]
    Split,
    /// Hash tables co-located; HashCount/HashOwner maintained on every index change
    Clustered,
}

/// Hash row: the content digest of a stored block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRow {
    /// Digest bytes
    pub digest: Vec<u8>,
}

/// HashSizes row
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HashSizes {
    /// Uncompressed length of the block
    pub real_size: u64,
    /// Stored length after compression
    pub compressed_size: u64,
}

/// InodeHashBlock row: which hash backs one block of one inode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Referenced hash
    pub hash_id: HashId,
    /// Bytes of the block that belong to the file
    pub real_size: u64,
}

/// A block ready to be stored as a new or updated hash quad
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    /// Content digest of the uncompressed data
    pub digest: Vec<u8>,
    /// Persisted codec id
    pub codec: u8,
    /// Stored (possibly compressed) bytes
    pub data: Vec<u8>,
    /// Uncompressed length
    pub real_size: u64,
}

/// POSIX file type bits
pub const S_IFMT: u32 = 0o170000;
/// Directory type bits
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits
pub const S_IFREG: u32 = 0o100000;
/// Symlink type bits
pub const S_IFLNK: u32 = 0o120000;

/// Inode row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Inode number
    pub id: InodeId,
    /// Hard link count
    pub nlinks: u32,
    /// File type and permission bits
    pub mode: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Device number for special files
    pub rdev: u64,
    /// File size in bytes
    pub size: u64,
    /// Last access time
    pub atime: Timestamp,
    /// Last modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
}

impl Inode {
    /// Creates an inode with the given type/permission bits and one link
    pub fn new(id: InodeId, mode: u32, uid: u32, gid: u32, now: Timestamp) -> Self {
        Self {
            id,
            nlinks: if mode & S_IFMT == S_IFDIR { 2 } else { 1 },
            mode,
            uid,
            gid,
            rdev: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// True for directories
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// True for regular files
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Number of blocks needed to hold `size` bytes
    pub fn block_count(&self, block_size: usize) -> u64 {
        self.size.div_ceil(block_size as u64)
    }
}

/// Tree row: one directory entry of one subvolume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Row id
    pub id: TreeId,
    /// Owning subvolume
    pub subvol_id: SubvolumeId,
    /// Parent tree node; `None` for the subvolume root
    pub parent_id: Option<TreeId>,
    /// Interned entry name
    pub name_id: NameId,
    /// Inode this entry points at
    pub inode_id: InodeId,
}

/// Space accounting of one subvolume, recomputed by the garbage collector
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubvolumeUsage {
    /// Sum of file sizes
    pub apparent_size: u64,
    /// Sum of `real_size` over every indexed block
    pub stored_size: u64,
    /// Sum of `real_size` over distinct referenced hashes
    pub unique_size: u64,
    /// Bytes saved by dedup (`stored_size - unique_size`)
    pub dedup_size: u64,
    /// Sum of compressed sizes over distinct referenced hashes
    pub compressed_size: u64,
    /// File bytes with no indexed block (`apparent_size - stored_size`)
    pub sparse_size: u64,
    /// Number of indexed blocks
    pub block_count: u64,
    /// When these numbers were computed
    pub refreshed_at: Timestamp,
}

/// Subvolume row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subvolume {
    /// Subvolume id
    pub id: SubvolumeId,
    /// Human-readable name
    pub name: String,
    /// Digest of the name, used as its lookup key
    pub name_digest: Vec<u8>,
    /// Snapshots are read-only
    pub read_only: bool,
    /// Creation time
    pub created_at: Timestamp,
    /// Last modification time
    pub updated_at: Timestamp,
    /// Cached usage statistics
    pub usage: Option<SubvolumeUsage>,
}
