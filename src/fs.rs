use crate::alloc::FreeMap;
use crate::dir::{Directory, EntryKind, ListEntry, DIR_FILE_SIZE, NAME_MAX_LEN};
use crate::error::{FsError, Result};
use crate::io::{SectorDevice, SectorNumber};
use crate::node::FileHeader;
use log::debug;
use std::collections::HashMap;

/// Device geometry, fixed at build time.
pub const SECTOR_SIZE: usize = 128;
pub const NUM_SECTORS: usize = 1024;

/// Well-known locations, so the two bootstrap files can be found on mount.
pub const FREE_MAP_SECTOR: SectorNumber = 0;
pub const ROOT_DIR_SECTOR: SectorNumber = 1;

/// Byte length of the free map's file content: one bit per sector.
const FREE_MAP_FILE_SIZE: u32 = (NUM_SECTORS / 8) as u32;

/// Absolute paths may have at most this many components.
pub const PATH_MAX_DEPTH: usize = 25;

/// Opaque descriptor bound to an open file for the handle's lifetime.
pub type Fd = u32;

struct OpenFile {
    header: FileHeader,
    header_sector: SectorNumber,
}

/// The result of walking a path down to its final component: the directory
/// that would contain the leaf, and the leaf name itself (empty for `/`).
struct Resolved {
    dir: Directory,
    dir_header: FileHeader,
    leaf: String,
}

/// The filesystem proper. Ties the free map, the pointer-tree headers, and
/// the directory tables together over one sector device, and keeps the two
/// bootstrap files standing for the lifetime of the value.
///
/// # Layout
/// =====================================================================
/// | free map header | root dir header | claimed on demand ............ |
/// =====================================================================
///
/// Every mutating operation takes `&mut self` and runs to completion or
/// fails synchronously; the single-accessor assumption is enforced by the
/// borrow checker rather than a lock.
pub struct SectorFs<D: SectorDevice> {
    dev: D,
    freemap: FreeMap,
    map_header: FileHeader,
    root_header: FileHeader,
    handles: HashMap<Fd, OpenFile>,
    next_fd: Fd,
}

impl<D: SectorDevice> SectorFs<D> {
    /// Initializes the filesystem onto owned sector storage.
    ///
    /// The two well-known sectors are claimed first, then the bootstrap
    /// files' pointer trees. Headers reach the backing store before any
    /// content is written through them, because content I/O locates its
    /// sectors by header lookup.
    pub fn format(mut dev: D) -> Result<Self> {
        debug!(
            "formatting device: {} sectors of {} bytes",
            NUM_SECTORS, SECTOR_SIZE
        );
        let mut freemap = FreeMap::new();
        freemap.mark(FREE_MAP_SECTOR);
        freemap.mark(ROOT_DIR_SECTOR);

        let mut map_header = FileHeader::new();
        map_header.allocate(&mut freemap, FREE_MAP_FILE_SIZE)?;
        let mut root_header = FileHeader::new();
        root_header.allocate(&mut freemap, DIR_FILE_SIZE)?;

        map_header.write_back(&mut dev, FREE_MAP_SECTOR)?;
        root_header.write_back(&mut dev, ROOT_DIR_SECTOR)?;

        Directory::new().write_back(&mut dev, &root_header)?;

        let mut fs = SectorFs {
            dev,
            freemap,
            map_header,
            root_header,
            handles: HashMap::new(),
            next_fd: 1,
        };
        fs.flush_free_map()?;
        fs.dev.sync_disk()?;
        Ok(fs)
    }

    /// Opens an already-formatted device by fetching the two bootstrap
    /// files from their well-known sectors.
    pub fn mount(mut dev: D) -> Result<Self> {
        let map_header = FileHeader::fetch_from(&mut dev, FREE_MAP_SECTOR)?;
        let root_header = FileHeader::fetch_from(&mut dev, ROOT_DIR_SECTOR)?;
        let content = map_header.read_content(&mut dev)?;
        let freemap = FreeMap::parse(&content);
        debug!(
            "mounted device: {} of {} sectors free",
            freemap.num_clear(),
            NUM_SECTORS
        );
        Ok(SectorFs {
            dev,
            freemap,
            map_header,
            root_header,
            handles: HashMap::new(),
            next_fd: 1,
        })
    }

    /// Creates a file of fixed size `byte_len` at an absolute path. The
    /// size is final; files do not grow after creation.
    pub fn create(&mut self, path: &str, byte_len: u32) -> Result<()> {
        debug!("create file {} ({} bytes)", path, byte_len);
        self.create_object(path, byte_len, EntryKind::File)
    }

    /// Creates an empty directory at an absolute path.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        debug!("create directory {}", path);
        self.create_object(path, DIR_FILE_SIZE, EntryKind::Dir)
    }

    /// Opens the object at `path` and binds a fresh descriptor to it. Every
    /// open gets its own descriptor; two opens of the same path coexist,
    /// each with an independently fetched header over the same on-disk
    /// state. Headers never change after creation, so the copies cannot
    /// drift apart.
    pub fn open(&mut self, path: &str) -> Result<Fd> {
        let r = self.resolve_parent(path)?;
        if r.leaf.is_empty() {
            return Err(FsError::InvalidPath(
                "cannot bind a descriptor to the root directory".to_string(),
            ));
        }
        let index = r.dir.find(&r.leaf).ok_or(FsError::NotFound)?;
        let sector = r.dir.sector_at(index);
        let header = FileHeader::fetch_from(&mut self.dev, sector)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.handles.insert(
            fd,
            OpenFile {
                header,
                header_sector: sector,
            },
        );
        debug!("open {} -> fd {}", path, fd);
        Ok(fd)
    }

    /// Releases a descriptor.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let file = self.handles.remove(&fd).ok_or(FsError::BadHandle)?;
        debug!("close fd {} (header at sector {})", fd, file.header_sector);
        Ok(())
    }

    /// Translates a byte offset within an open file to the sector holding
    /// it. Byte-granular transfers are layered above this crate; they turn
    /// offsets into sectors here and move the bytes themselves.
    pub fn sector_for(&self, fd: Fd, offset: u32) -> Result<SectorNumber> {
        let file = self.handles.get(&fd).ok_or(FsError::BadHandle)?;
        file.header.byte_to_sector(offset)
    }

    /// Logical length in bytes of an open file.
    pub fn file_len(&self, fd: Fd) -> Result<u32> {
        let file = self.handles.get(&fd).ok_or(FsError::BadHandle)?;
        Ok(file.header.len())
    }

    /// Removes the object at `path`. A directory loses all of its
    /// descendants first, depth-first; removing the root is refused.
    /// Descriptors already bound to the removed object are not tracked and
    /// simply go stale.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        debug!("remove {}", path);
        let mut r = self.resolve_parent(path)?;
        if r.leaf.is_empty() {
            return Err(FsError::NotAllowed);
        }
        let index = r.dir.find(&r.leaf).ok_or(FsError::NotFound)?;
        let sector = r.dir.sector_at(index);
        let mut header = FileHeader::fetch_from(&mut self.dev, sector)?;

        if r.dir.kind_at(index) == EntryKind::Dir {
            let mut sub = Directory::fetch_from(&mut self.dev, &header)?;
            if let Err(e) = sub.remove_recursive(&mut self.dev, &mut self.freemap) {
                // Siblings already freed stay freed; persist the cleared
                // entries and the map so nothing on disk points at them,
                // then surface the partial failure.
                if let Err(werr) = sub.write_back(&mut self.dev, &header) {
                    debug!("could not persist partially cleared directory: {}", werr);
                }
                if let Err(werr) = self.flush_free_map() {
                    debug!("could not flush free map after partial removal: {}", werr);
                }
                return Err(e);
            }
        }

        header.deallocate(&mut self.freemap);
        self.freemap.clear(sector);
        r.dir.remove(&r.leaf)?;
        r.dir.write_back(&mut self.dev, &r.dir_header)?;
        self.flush_free_map()?;
        Ok(())
    }

    /// Entries of the directory at `path`, in slot order.
    pub fn list(&mut self, path: &str) -> Result<Vec<(String, EntryKind)>> {
        let dir = self.resolve_dir(path)?;
        Ok(dir.entries().collect())
    }

    /// Depth-first listing of the directory at `path` and everything
    /// beneath it.
    pub fn list_recursive(&mut self, path: &str) -> Result<Vec<ListEntry>> {
        let dir = self.resolve_dir(path)?;
        dir.list_recursive(&mut self.dev)
    }

    /// Free sectors remaining on the device.
    pub fn free_sectors(&self) -> u32 {
        self.freemap.num_clear()
    }

    /// Direct access to the underlying device, for the byte-transfer layer
    /// sitting above this crate.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Walks an absolute path from the root to the directory containing
    /// its final component. Intermediate components must name directories;
    /// empty components are skipped, so `//a` and `/a` resolve alike.
    fn resolve_parent(&mut self, path: &str) -> Result<Resolved> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath(
                "path must start with '/'".to_string(),
            ));
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() > PATH_MAX_DEPTH {
            return Err(FsError::InvalidPath(format!(
                "path exceeds {} components",
                PATH_MAX_DEPTH
            )));
        }
        for component in components.iter() {
            if component.len() > NAME_MAX_LEN {
                return Err(FsError::InvalidPath(format!(
                    "component '{}' longer than {} bytes",
                    component, NAME_MAX_LEN
                )));
            }
        }

        let mut dir_header = self.root_header.clone();
        let mut dir = Directory::fetch_from(&mut self.dev, &dir_header)?;
        for component in components
            .iter()
            .take(components.len().saturating_sub(1))
        {
            let index = dir.find(component).ok_or(FsError::NotFound)?;
            if dir.kind_at(index) != EntryKind::Dir {
                return Err(FsError::InvalidPath(format!(
                    "'{}' is not a directory",
                    component
                )));
            }
            dir_header = FileHeader::fetch_from(&mut self.dev, dir.sector_at(index))?;
            dir = Directory::fetch_from(&mut self.dev, &dir_header)?;
        }

        Ok(Resolved {
            dir,
            dir_header,
            leaf: components.last().copied().unwrap_or("").to_string(),
        })
    }

    /// Resolves a path that must name a directory, the root included.
    fn resolve_dir(&mut self, path: &str) -> Result<Directory> {
        let r = self.resolve_parent(path)?;
        if r.leaf.is_empty() {
            return Ok(r.dir);
        }
        let index = r.dir.find(&r.leaf).ok_or(FsError::NotFound)?;
        if r.dir.kind_at(index) != EntryKind::Dir {
            return Err(FsError::InvalidPath(format!(
                "'{}' is not a directory",
                r.leaf
            )));
        }
        let header = FileHeader::fetch_from(&mut self.dev, r.dir.sector_at(index))?;
        Directory::fetch_from(&mut self.dev, &header)
    }

    /// Shared tail of create and create_directory: claim a header sector,
    /// build the pointer tree, enter the name, then persist. Any failure
    /// hands back every claimed sector, so the caller sees the operation
    /// commit fully or not at all.
    fn create_object(&mut self, path: &str, byte_len: u32, kind: EntryKind) -> Result<()> {
        let mut r = self.resolve_parent(path)?;
        if r.leaf.is_empty() {
            return Err(FsError::InvalidPath(
                "cannot create the root directory".to_string(),
            ));
        }
        if r.dir.find(&r.leaf).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let header_sector = self.freemap.find_and_set().ok_or(FsError::NoSpace)?;
        let mut header = FileHeader::new();
        if let Err(e) = header.allocate(&mut self.freemap, byte_len) {
            self.freemap.clear(header_sector);
            return Err(e);
        }
        if let Err(e) = r.dir.add(&r.leaf, header_sector, kind) {
            header.deallocate(&mut self.freemap);
            self.freemap.clear(header_sector);
            return Err(e);
        }
        if let Err(e) = self.persist_created(&header, header_sector, kind, &r) {
            header.deallocate(&mut self.freemap);
            self.freemap.clear(header_sector);
            return Err(e);
        }
        Ok(())
    }

    /// Persists a successful create: the new header, an empty table for new
    /// directories, the parent table, and finally the free map. Nothing
    /// here mutates in-memory allocator state, so the caller can unwind on
    /// error.
    fn persist_created(
        &mut self,
        header: &FileHeader,
        header_sector: SectorNumber,
        kind: EntryKind,
        parent: &Resolved,
    ) -> Result<()> {
        header.write_back(&mut self.dev, header_sector)?;
        if kind == EntryKind::Dir {
            Directory::new().write_back(&mut self.dev, header)?;
        }
        parent.dir.write_back(&mut self.dev, &parent.dir_header)?;
        self.flush_free_map()
    }

    /// Overwrites the free map's file content wholesale.
    fn flush_free_map(&mut self) -> Result<()> {
        use zerocopy::AsBytes;
        self.map_header
            .write_content(&mut self.dev, self.freemap.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileSectorEmulator, FileSectorEmulatorBuilder};

    fn create_test_fs() -> SectorFs<FileSectorEmulator> {
        let dev = tempfile::tempfile().unwrap();
        let dev = FileSectorEmulatorBuilder::from(dev)
            .with_sector_count(NUM_SECTORS)
            .build()
            .expect("could not initialize disk emulator");
        SectorFs::format(dev).expect("could not format device")
    }

    #[test]
    fn format_reserves_bootstrap_sectors() {
        let fs = create_test_fs();
        // Two well-known headers, the one-sector free map file (leaf +
        // data), and the eight-sector root table (8 leaves + 8 data).
        assert_eq!(fs.free_sectors(), NUM_SECTORS as u32 - 20);
    }

    #[test]
    fn paths_must_be_absolute() {
        let mut fs = create_test_fs();
        assert!(matches!(
            fs.create("foo", 100),
            Err(FsError::InvalidPath(_))
        ));
        assert!(matches!(fs.open("foo"), Err(FsError::InvalidPath(_))));
        assert!(matches!(fs.list("foo"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn overlong_component_is_rejected() {
        let mut fs = create_test_fs();
        assert!(matches!(
            fs.create("/waytoolongname", 100),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn overdeep_path_is_rejected() {
        let mut fs = create_test_fs();
        let path = "/a".repeat(PATH_MAX_DEPTH + 1);
        assert!(matches!(
            fs.create(&path, 100),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn create_open_close_roundtrip() {
        let mut fs = create_test_fs();
        fs.create("/f1", 5000).unwrap();

        let fd = fs.open("/f1").unwrap();
        assert_eq!(fs.file_len(fd).unwrap(), 5000);
        fs.close(fd).unwrap();
        assert!(matches!(fs.file_len(fd), Err(FsError::BadHandle)));
    }

    #[test]
    fn unknown_descriptor_is_rejected() {
        let mut fs = create_test_fs();
        assert!(matches!(fs.close(42), Err(FsError::BadHandle)));
        assert!(matches!(fs.sector_for(42, 0), Err(FsError::BadHandle)));
    }

    #[test]
    fn cannot_remove_the_root() {
        let mut fs = create_test_fs();
        assert!(matches!(fs.remove("/"), Err(FsError::NotAllowed)));
    }

    #[test]
    fn intermediate_file_component_is_rejected() {
        let mut fs = create_test_fs();
        fs.create("/f1", 100).unwrap();
        assert!(matches!(
            fs.open("/f1/inner"),
            Err(FsError::InvalidPath(_))
        ));
        assert!(matches!(
            fs.create("/f1/inner", 10),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn listing_an_empty_root() {
        let mut fs = create_test_fs();
        assert!(fs.list("/").unwrap().is_empty());
        assert!(fs.list_recursive("/").unwrap().is_empty());
    }

    #[test]
    fn listing_a_file_is_rejected() {
        let mut fs = create_test_fs();
        fs.create("/f1", 100).unwrap();
        assert!(matches!(fs.list("/f1"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn creation_failure_leaves_free_count_unchanged() {
        let mut fs = create_test_fs();
        let before = fs.free_sectors();
        // Within the level ceiling but beyond what the device holds.
        assert!(matches!(
            fs.create("/huge", 200_000),
            Err(FsError::NoSpace)
        ));
        assert_eq!(fs.free_sectors(), before);
    }
}
