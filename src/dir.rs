use crate::alloc::FreeMap;
use crate::error::{FsError, Result};
use crate::io::{SectorDevice, SectorNumber};
use crate::node::FileHeader;
use log::debug;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

/// A directory holds a fixed number of entries; once every slot is taken no
/// more names can be added under it.
pub const NUM_DIR_ENTRIES: usize = 64;
/// Names are at most this many bytes; stored NUL-padded in a fixed field.
pub const NAME_MAX_LEN: usize = 9;
const NAME_FIELD: usize = NAME_MAX_LEN + 1;

const FILE_TAG: u8 = 1;
const DIR_TAG: u8 = 2;

/// Fixed byte length of a directory's file content.
pub const DIR_FILE_SIZE: u32 = (NUM_DIR_ENTRIES * mem::size_of::<DirEntry>()) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::File => FILE_TAG,
            EntryKind::Dir => DIR_TAG,
        }
    }

    fn from_tag(tag: u8) -> EntryKind {
        match tag {
            FILE_TAG => EntryKind::File,
            DIR_TAG => EntryKind::Dir,
            _ => panic!("unknown directory entry tag {}", tag),
        }
    }
}

/// One slot of the table: where to find the named object's header, and
/// whether it is a file or a nested directory.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct DirEntry {
    sector: u32,
    in_use: u8,
    kind: u8,
    name: [u8; NAME_FIELD],
}

const EMPTY_ENTRY: DirEntry = DirEntry {
    sector: 0,
    in_use: 0,
    kind: 0,
    name: [0; NAME_FIELD],
};

fn name_field_len(name: &[u8; NAME_FIELD]) -> usize {
    name.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD)
}

/// A table of name to header-sector pairs, stored on disk as the content of
/// an ordinary file. Removal leaves holes; a later add reuses the first
/// free slot, so the table never needs compaction.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone)]
pub struct Directory {
    table: [DirEntry; NUM_DIR_ENTRIES],
}

/// One row of a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub depth: usize,
}

impl Directory {
    /// A completely empty directory, as written at creation time.
    pub fn new() -> Self {
        Self {
            table: [EMPTY_ENTRY; NUM_DIR_ENTRIES],
        }
    }

    /// Reads the table from the file described by `header`.
    pub fn fetch_from<D: SectorDevice>(dev: &mut D, header: &FileHeader) -> Result<Directory> {
        let bytes = header.read_content(dev)?;
        assert_eq!(
            bytes.len(),
            DIR_FILE_SIZE as usize,
            "directory file content must be exactly {} bytes",
            DIR_FILE_SIZE
        );
        Ok(Directory::read_from(&bytes[..]).unwrap())
    }

    /// Writes the table back as the content of the file described by
    /// `header`.
    pub fn write_back<D: SectorDevice>(&self, dev: &mut D, header: &FileHeader) -> Result<()> {
        header.write_content(dev, self.as_bytes())
    }

    /// Index of the in-use entry carrying `name`, compared exactly against
    /// the NUL-trimmed stored name.
    pub fn find(&self, name: &str) -> Option<usize> {
        let query = name.as_bytes();
        if query.is_empty() || query.len() > NAME_MAX_LEN {
            return None;
        }
        self.table.iter().position(|e| {
            e.in_use != 0 && &e.name[..name_field_len(&e.name)] == query
        })
    }

    pub fn sector_at(&self, index: usize) -> SectorNumber {
        debug_assert!(self.table[index].in_use != 0);
        self.table[index].sector
    }

    pub fn kind_at(&self, index: usize) -> EntryKind {
        debug_assert!(self.table[index].in_use != 0);
        EntryKind::from_tag(self.table[index].kind)
    }

    /// Adds a name to the table. Fails with `AlreadyExists` if the name is
    /// present, or `NoSpace` when every slot is taken; the table does not
    /// grow.
    pub fn add(&mut self, name: &str, sector: SectorNumber, kind: EntryKind) -> Result<()> {
        debug_assert!(!name.is_empty() && name.len() <= NAME_MAX_LEN);
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = self
            .table
            .iter_mut()
            .find(|e| e.in_use == 0)
            .ok_or(FsError::NoSpace)?;
        slot.sector = sector;
        slot.in_use = 1;
        slot.kind = kind.tag();
        slot.name = [0; NAME_FIELD];
        slot.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    /// Frees the named slot without compaction; the slot is reusable by a
    /// later add.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let index = self.find(name).ok_or(FsError::NotFound)?;
        self.table[index].in_use = 0;
        Ok(())
    }

    /// Tears down everything beneath this directory: files lose their
    /// pointer trees and header sectors, nested directories are emptied
    /// recursively first. Entries are cleared as they are processed.
    ///
    /// Each entry's tree is fetched into memory in full before any of its
    /// sectors are released, so a fetch failure surfaces with that entry
    /// intact. Siblings already torn down stay torn down; their cleared
    /// entries are persisted before the error is surfaced, so no surviving
    /// entry references a freed sector.
    pub fn remove_recursive<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        freemap: &mut FreeMap,
    ) -> Result<()> {
        for i in 0..NUM_DIR_ENTRIES {
            if self.table[i].in_use == 0 {
                continue;
            }
            let sector = self.table[i].sector;
            let mut header = FileHeader::fetch_from(dev, sector)?;
            if self.table[i].kind == DIR_TAG {
                let mut sub = Directory::fetch_from(dev, &header)?;
                if let Err(e) = sub.remove_recursive(dev, freemap) {
                    if let Err(werr) = sub.write_back(dev, &header) {
                        debug!("could not persist partially cleared directory: {}", werr);
                    }
                    return Err(e);
                }
            }
            header.deallocate(freemap);
            freemap.clear(sector);
            self.table[i].in_use = 0;
        }
        Ok(())
    }

    /// In-use entries in slot order. Diagnostic; takes no locks and moves
    /// nothing.
    pub fn entries(&self) -> impl Iterator<Item = (String, EntryKind)> + '_ {
        self.table.iter().filter(|e| e.in_use != 0).map(|e| {
            (
                String::from_utf8_lossy(&e.name[..name_field_len(&e.name)]).into_owned(),
                EntryKind::from_tag(e.kind),
            )
        })
    }

    /// Depth-first walk across nested directories, producing a restartable
    /// snapshot of `(name, kind, depth)` rows.
    pub fn list_recursive<D: SectorDevice>(&self, dev: &mut D) -> Result<Vec<ListEntry>> {
        let mut out = Vec::new();
        self.walk(dev, 0, &mut out)?;
        Ok(out)
    }

    fn walk<D: SectorDevice>(
        &self,
        dev: &mut D,
        depth: usize,
        out: &mut Vec<ListEntry>,
    ) -> Result<()> {
        for entry in self.table.iter().filter(|e| e.in_use != 0) {
            let kind = EntryKind::from_tag(entry.kind);
            out.push(ListEntry {
                name: String::from_utf8_lossy(&entry.name[..name_field_len(&entry.name)])
                    .into_owned(),
                kind,
                depth,
            });
            if kind == EntryKind::Dir {
                let header = FileHeader::fetch_from(dev, entry.sector)?;
                let sub = Directory::fetch_from(dev, &header)?;
                sub.walk(dev, depth + 1, out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NUM_SECTORS;
    use crate::io::{FileSectorEmulator, FileSectorEmulatorBuilder};

    fn create_test_device() -> FileSectorEmulator {
        let dev = tempfile::tempfile().unwrap();
        FileSectorEmulatorBuilder::from(dev)
            .with_sector_count(NUM_SECTORS)
            .build()
            .expect("could not initialize disk emulator")
    }

    #[test]
    fn add_then_find_returns_entry() {
        let mut dir = Directory::new();
        dir.add("f1", 17, EntryKind::File).unwrap();
        dir.add("d1", 23, EntryKind::Dir).unwrap();

        let i = dir.find("f1").unwrap();
        assert_eq!(dir.sector_at(i), 17);
        assert_eq!(dir.kind_at(i), EntryKind::File);

        let j = dir.find("d1").unwrap();
        assert_eq!(dir.sector_at(j), 23);
        assert_eq!(dir.kind_at(j), EntryKind::Dir);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut dir = Directory::new();
        dir.add("f1", 17, EntryKind::File).unwrap();

        let result = dir.add("f1", 99, EntryKind::File);
        assert!(matches!(result, Err(FsError::AlreadyExists)));
        // The original mapping is untouched.
        assert_eq!(dir.sector_at(dir.find("f1").unwrap()), 17);
        assert_eq!(dir.entries().count(), 1);
    }

    #[test]
    fn exact_match_only() {
        let mut dir = Directory::new();
        dir.add("abc", 5, EntryKind::File).unwrap();

        assert!(dir.find("ab").is_none());
        assert!(dir.find("abcd").is_none());
        assert!(dir.find("abc").is_some());
    }

    #[test]
    fn table_capacity_is_fixed() {
        let mut dir = Directory::new();
        for i in 0..NUM_DIR_ENTRIES {
            dir.add(&format!("f{}", i), i as u32, EntryKind::File)
                .unwrap();
        }
        let result = dir.add("extra", 999, EntryKind::File);
        assert!(matches!(result, Err(FsError::NoSpace)));
    }

    #[test]
    fn removed_slot_is_reusable() {
        let mut dir = Directory::new();
        for i in 0..NUM_DIR_ENTRIES {
            dir.add(&format!("f{}", i), i as u32, EntryKind::File)
                .unwrap();
        }
        dir.remove("f10").unwrap();
        assert!(dir.find("f10").is_none());

        dir.add("fresh", 500, EntryKind::File).unwrap();
        assert_eq!(dir.sector_at(dir.find("fresh").unwrap()), 500);
    }

    #[test]
    fn removing_missing_name_fails() {
        let mut dir = Directory::new();
        assert!(matches!(dir.remove("ghost"), Err(FsError::NotFound)));
    }

    #[test]
    fn table_round_trips_through_file_content() {
        let mut dev = create_test_device();
        let mut freemap = FreeMap::new();
        let mut header = FileHeader::new();
        header.allocate(&mut freemap, DIR_FILE_SIZE).unwrap();

        let mut dir = Directory::new();
        dir.add("f1", 17, EntryKind::File).unwrap();
        dir.add("sub", 23, EntryKind::Dir).unwrap();
        dir.write_back(&mut dev, &header).unwrap();

        let read_back = Directory::fetch_from(&mut dev, &header).unwrap();
        let names: Vec<_> = read_back.entries().collect();
        assert_eq!(
            names,
            vec![
                ("f1".to_string(), EntryKind::File),
                ("sub".to_string(), EntryKind::Dir)
            ]
        );
    }
}
