//! Directory tree operations of one subvolume.
//!
//! Just enough of the namespace to create, find and remove files, directories
//! and symlinks, and to attach extended attributes. Path resolution belongs to
//! the filesystem dispatch layer; everything here is one component at a time.

use dedupfs_reduce::DigestAlgorithm;
use tracing::{debug, info};

use crate::error::{MetaError, MetaResult};
use crate::tables::Tables;
use crate::types::{
    Inode, InodeId, Subvolume, SubvolumeId, Timestamp, TreeEntry, TreeId, S_IFDIR, S_IFLNK, S_IFREG,
};

/// Result of removing a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlinked {
    /// Inode the entry pointed at
    pub inode: InodeId,
    /// True when that was its last link and the inode row is gone
    pub removed: bool,
}

/// Namespace helpers bound to one subvolume
#[derive(Clone)]
pub struct Namespace {
    tables: Tables,
    subvol: SubvolumeId,
}

impl Namespace {
    /// Create a subvolume with an empty root directory
    pub fn create_subvolume(
        tables: &Tables,
        name: &str,
        digest: DigestAlgorithm,
        now: Timestamp,
    ) -> MetaResult<Subvolume> {
        let row = tables.create_subvolume(name, digest.digest(name.as_bytes()).0, now)?;
        let root = Inode::new(InodeId::ROOT, S_IFDIR | 0o755, 0, 0, now);
        tables.put_inode(row.id, &root)?;
        let empty = tables.intern_name(b"")?;
        tables.insert_tree(row.id, None, empty, root.id)?;
        info!(subvolume = %row.id, name, "created subvolume");
        Ok(row)
    }

    /// Find a subvolume by name
    pub fn find_subvolume(tables: &Tables, name: &str, digest: DigestAlgorithm) -> MetaResult<Option<Subvolume>> {
        tables.find_subvolume(digest.digest(name.as_bytes()).as_bytes())
    }

    /// Helpers for subvolume `subvol`
    pub fn new(tables: Tables, subvol: SubvolumeId) -> Self {
        Self { tables, subvol }
    }

    /// Subvolume these helpers operate on
    pub fn subvolume(&self) -> SubvolumeId {
        self.subvol
    }

    /// Root directory entry
    pub fn root(&self) -> MetaResult<TreeEntry> {
        let empty = self
            .tables
            .find_name(b"")?
            .ok_or_else(|| MetaError::not_found("root name"))?;
        self.tables
            .lookup_tree(self.subvol, None, empty)?
            .ok_or_else(|| MetaError::not_found(format!("root of subvolume {}", self.subvol)))
    }

    /// Inode row
    pub fn inode(&self, id: InodeId) -> MetaResult<Inode> {
        self.tables
            .get_inode(self.subvol, id)?
            .ok_or_else(|| MetaError::not_found(format!("inode {}", id)))
    }

    /// Replace an inode row
    pub fn put_inode(&self, inode: &Inode) -> MetaResult<()> {
        self.tables.put_inode(self.subvol, inode)
    }

    fn directory(&self, parent: TreeId) -> MetaResult<TreeEntry> {
        let entry = self
            .tables
            .get_tree(self.subvol, parent)?
            .ok_or_else(|| MetaError::not_found(format!("directory entry {}", parent)))?;
        if !self.inode(entry.inode_id)?.is_dir() {
            return Err(MetaError::not_found(format!("directory {}", entry.inode_id)));
        }
        Ok(entry)
    }

    /// Find `name` in directory `parent`
    pub fn lookup(&self, parent: TreeId, name: &[u8]) -> MetaResult<Option<TreeEntry>> {
        match self.tables.find_name(name)? {
            Some(name_id) => self.tables.lookup_tree(self.subvol, Some(parent), name_id),
            None => Ok(None),
        }
    }

    fn create(&self, parent: TreeId, name: &[u8], mode: u32, uid: u32, gid: u32, now: Timestamp) -> MetaResult<(TreeEntry, Inode)> {
        self.directory(parent)?;
        let name_id = self.tables.intern_name(name)?;
        if self
            .tables
            .lookup_tree(self.subvol, Some(parent), name_id)?
            .is_some()
        {
            return Err(MetaError::Exists {
                what: format!("{:?} in directory entry {}", String::from_utf8_lossy(name), parent),
            });
        }
        let id = self.tables.allocate_inode_id(self.subvol)?;
        let inode = Inode::new(id, mode, uid, gid, now);
        self.tables.put_inode(self.subvol, &inode)?;
        let entry = self.tables.insert_tree(self.subvol, Some(parent), name_id, id)?;
        debug!(subvolume = %self.subvol, inode = %id, mode, "created entry");
        Ok((entry, inode))
    }

    /// Create an empty regular file
    pub fn create_file(&self, parent: TreeId, name: &[u8], perm: u32, uid: u32, gid: u32, now: Timestamp) -> MetaResult<(TreeEntry, Inode)> {
        self.create(parent, name, S_IFREG | (perm & 0o7777), uid, gid, now)
    }

    /// Create an empty directory
    pub fn mkdir(&self, parent: TreeId, name: &[u8], perm: u32, uid: u32, gid: u32, now: Timestamp) -> MetaResult<(TreeEntry, Inode)> {
        self.create(parent, name, S_IFDIR | (perm & 0o7777), uid, gid, now)
    }

    /// Create a symlink pointing at `target`
    pub fn symlink(&self, parent: TreeId, name: &[u8], target: &[u8], uid: u32, gid: u32, now: Timestamp) -> MetaResult<(TreeEntry, Inode)> {
        let (entry, mut inode) = self.create(parent, name, S_IFLNK | 0o777, uid, gid, now)?;
        self.tables.put_link(self.subvol, inode.id, target)?;
        inode.size = target.len() as u64;
        self.tables.put_inode(self.subvol, &inode)?;
        Ok((entry, inode))
    }

    /// Symlink target
    pub fn readlink(&self, inode: InodeId) -> MetaResult<Vec<u8>> {
        self.tables
            .get_link(self.subvol, inode)?
            .ok_or_else(|| MetaError::not_found(format!("link target of inode {}", inode)))
    }

    /// Add another name for an existing non-directory inode
    pub fn link(&self, inode: InodeId, parent: TreeId, name: &[u8], now: Timestamp) -> MetaResult<TreeEntry> {
        self.directory(parent)?;
        let mut row = self.inode(inode)?;
        if row.is_dir() {
            return Err(MetaError::Exists {
                what: format!("hard link to directory {}", inode),
            });
        }
        let name_id = self.tables.intern_name(name)?;
        let entry = self.tables.insert_tree(self.subvol, Some(parent), name_id, inode)?;
        row.nlinks += 1;
        row.ctime = now;
        self.tables.put_inode(self.subvol, &row)?;
        Ok(entry)
    }

    /// Remove `name` from `parent`. The inode row goes with its last link;
    /// its blocks, attributes and link target are left to the garbage collector.
    pub fn unlink(&self, parent: TreeId, name: &[u8], now: Timestamp) -> MetaResult<Unlinked> {
        let entry = self
            .lookup(parent, name)?
            .ok_or_else(|| MetaError::not_found(format!("{:?}", String::from_utf8_lossy(name))))?;
        let mut inode = self.inode(entry.inode_id)?;
        if inode.is_dir() && self.tables.has_children(self.subvol, entry.id)? {
            return Err(MetaError::NotEmpty {
                what: format!("directory {}", inode.id),
            });
        }
        self.tables.remove_tree(&entry)?;
        let floor = if inode.is_dir() { 2 } else { 1 };
        let removed = inode.nlinks <= floor;
        if removed {
            self.tables.remove_inodes(self.subvol, &[inode.id])?;
        } else {
            inode.nlinks -= 1;
            inode.ctime = now;
            self.tables.put_inode(self.subvol, &inode)?;
        }
        debug!(subvolume = %self.subvol, inode = %inode.id, removed, "unlinked");
        Ok(Unlinked {
            inode: inode.id,
            removed,
        })
    }

    /// Set an extended attribute on an existing inode
    pub fn set_xattr(&self, inode: InodeId, name: &[u8], value: &[u8]) -> MetaResult<()> {
        self.inode(inode)?;
        self.tables.set_xattr(self.subvol, inode, name, value)
    }

    /// Extended attribute value
    pub fn get_xattr(&self, inode: InodeId, name: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        self.tables.get_xattr(self.subvol, inode, name)
    }
}
