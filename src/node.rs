use crate::alloc::FreeMap;
use crate::error::{FsError, Result};
use crate::fs::SECTOR_SIZE;
use crate::io::{SectorDevice, SectorNumber};
use zerocopy::{AsBytes, FromBytes};

/// Fixed-width ids that fit in one sector.
const IDS_PER_SECTOR: usize = SECTOR_SIZE / 4;
/// Top-level pointers storable in a header sector alongside the byte length
/// and the populated-pointer count.
pub const NUM_HEADER_POINTERS: usize = IDS_PER_SECTOR - 2;
/// Child ids storable in an indirect node sector alongside its count.
pub const NUM_INDIRECT_POINTERS: usize = IDS_PER_SECTOR - 1;

pub const MAX_LEVEL: u8 = 4;

/// Data sectors covered by one pointer subtree of the given depth: a direct
/// leaf covers exactly one sector, and each level of indirection multiplies
/// coverage by the per-node fan-out.
fn span_sectors(depth: u8) -> u32 {
    (NUM_INDIRECT_POINTERS as u32).pow(u32::from(depth) - 1)
}

fn span_bytes(depth: u8) -> u32 {
    span_sectors(depth) * SECTOR_SIZE as u32
}

/// Data sectors addressable by a header of the given indirection level.
pub fn capacity_sectors(level: u8) -> u32 {
    NUM_HEADER_POINTERS as u32 * span_sectors(level)
}

pub fn capacity_bytes(level: u8) -> u32 {
    capacity_sectors(level) * SECTOR_SIZE as u32
}

/// Smallest indirection level whose capacity covers `byte_len`. The level is
/// a pure function of the byte length; it is recomputed on every fetch and
/// never persisted.
pub fn level_for(byte_len: u32) -> Result<u8> {
    for level in 1..=MAX_LEVEL {
        if byte_len <= capacity_bytes(level) {
            return Ok(level);
        }
    }
    Err(FsError::TooLarge)
}

fn div_round_up(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

/// Sectors a subtree of `depth` covering `data_sectors` payload sectors
/// occupies in total: its own node sector, every descendant node sector,
/// and the payload itself.
fn subtree_sectors(depth: u8, data_sectors: u32) -> u32 {
    debug_assert!(data_sectors >= 1 && data_sectors <= span_sectors(depth));
    if depth == 1 {
        // A direct leaf plus its single data sector.
        return 2;
    }
    let child_span = span_sectors(depth - 1);
    let mut total = 1;
    let mut remain = data_sectors;
    while remain > 0 {
        let take = remain.min(child_span);
        total += subtree_sectors(depth - 1, take);
        remain -= take;
    }
    total
}

/// Everything an allocation for `data_sectors` payload sectors at `level`
/// will claim, excluding the header's own sector (the caller owns that).
fn required_sectors(level: u8, data_sectors: u32) -> u32 {
    let chunk = span_sectors(level);
    let mut total = 0;
    let mut remain = data_sectors;
    while remain > 0 {
        let take = remain.min(chunk);
        total += subtree_sectors(level, take);
        remain -= take;
    }
    total
}

/// On-disk shape of a header sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RawHeader {
    byte_len: u32,
    num_pointers: u32,
    pointers: [u32; NUM_HEADER_POINTERS],
}

/// On-disk shape of an indirect node sector; the same shape at every
/// non-leaf depth. A direct leaf sector stores just its data sector id.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RawIndirect {
    num_children: u32,
    children: [u32; NUM_INDIRECT_POINTERS],
}

#[derive(Clone)]
struct IndirectNode {
    num_children: usize,
    child_sectors: [SectorNumber; NUM_INDIRECT_POINTERS],
    children: Vec<PointerNode>,
}

impl IndirectNode {
    fn new() -> Self {
        Self {
            num_children: 0,
            child_sectors: [0; NUM_INDIRECT_POINTERS],
            children: Vec::new(),
        }
    }

    /// Frees every child subtree and each child's node sector. The node's
    /// own sector belongs to whoever references it.
    fn deallocate(&mut self, freemap: &mut FreeMap) {
        for (child, &sector) in self.children.iter_mut().zip(self.child_sectors.iter()) {
            child.deallocate(freemap);
            freemap.clear(sector);
        }
        self.children.clear();
        self.num_children = 0;
    }
}

/// One node of the pointer tree. The four cases mirror the four indirection
/// depths a header can take: a direct leaf addresses exactly one data
/// sector, and each indirect flavor fans out to nodes one depth shallower.
#[derive(Clone)]
enum PointerNode {
    Direct { data_sector: SectorNumber },
    SingleIndirect(IndirectNode),
    DoubleIndirect(IndirectNode),
    TripleIndirect(IndirectNode),
}

impl PointerNode {
    fn depth(&self) -> u8 {
        match self {
            PointerNode::Direct { .. } => 1,
            PointerNode::SingleIndirect(_) => 2,
            PointerNode::DoubleIndirect(_) => 3,
            PointerNode::TripleIndirect(_) => 4,
        }
    }

    fn wrap(depth: u8, node: IndirectNode) -> PointerNode {
        match depth {
            2 => PointerNode::SingleIndirect(node),
            3 => PointerNode::DoubleIndirect(node),
            4 => PointerNode::TripleIndirect(node),
            _ => unreachable!("indirection depth is capped at four"),
        }
    }

    /// Builds a subtree covering `data_sectors` payload sectors, claiming
    /// sectors from `freemap` as it goes. If any claim fails, every sector
    /// taken by this call is released before the error is returned.
    fn allocate(freemap: &mut FreeMap, depth: u8, data_sectors: u32) -> Result<PointerNode> {
        if depth == 1 {
            debug_assert_eq!(data_sectors, 1);
            let data_sector = freemap.find_and_set().ok_or(FsError::NoSpace)?;
            return Ok(PointerNode::Direct { data_sector });
        }

        let child_span = span_sectors(depth - 1);
        let mut node = IndirectNode::new();
        let mut remain = data_sectors;
        while remain > 0 {
            let take = remain.min(child_span);
            let child_sector = match freemap.find_and_set() {
                Some(s) => s,
                None => {
                    node.deallocate(freemap);
                    return Err(FsError::NoSpace);
                }
            };
            match PointerNode::allocate(freemap, depth - 1, take) {
                Ok(child) => {
                    node.child_sectors[node.num_children] = child_sector;
                    node.children.push(child);
                    node.num_children += 1;
                }
                Err(e) => {
                    freemap.clear(child_sector);
                    node.deallocate(freemap);
                    return Err(e);
                }
            }
            remain -= take;
        }
        Ok(PointerNode::wrap(depth, node))
    }

    /// Depth-first release: children first, then each child's node sector;
    /// a leaf releases its single data sector.
    fn deallocate(&mut self, freemap: &mut FreeMap) {
        match self {
            PointerNode::Direct { data_sector } => freemap.clear(*data_sector),
            PointerNode::SingleIndirect(node)
            | PointerNode::DoubleIndirect(node)
            | PointerNode::TripleIndirect(node) => node.deallocate(freemap),
        }
    }

    fn byte_to_sector(&self, offset: u32) -> Result<SectorNumber> {
        match self {
            PointerNode::Direct { data_sector } => {
                debug_assert!((offset as usize) < SECTOR_SIZE);
                Ok(*data_sector)
            }
            PointerNode::SingleIndirect(node)
            | PointerNode::DoubleIndirect(node)
            | PointerNode::TripleIndirect(node) => {
                let child_bytes = span_bytes(self.depth() - 1);
                let index = (offset / child_bytes) as usize;
                if index >= node.num_children {
                    return Err(FsError::OutOfRange);
                }
                node.children[index].byte_to_sector(offset % child_bytes)
            }
        }
    }

    fn fetch_from<D: SectorDevice>(
        dev: &mut D,
        depth: u8,
        sector: SectorNumber,
    ) -> Result<PointerNode> {
        let mut buf = [0u8; SECTOR_SIZE];
        dev.read_sector(sector, &mut buf)?;
        if depth == 1 {
            let data_sector = SectorNumber::read_from(&buf[..4]).unwrap();
            return Ok(PointerNode::Direct { data_sector });
        }

        let raw = RawIndirect::read_from(&buf[..]).unwrap();
        let num_children = raw.num_children as usize;
        assert!(
            num_children <= NUM_INDIRECT_POINTERS,
            "indirect node child count {} exceeds the per-sector limit",
            raw.num_children
        );
        let mut node = IndirectNode::new();
        node.num_children = num_children;
        node.child_sectors = raw.children;
        for i in 0..num_children {
            node.children
                .push(PointerNode::fetch_from(dev, depth - 1, node.child_sectors[i])?);
        }
        Ok(PointerNode::wrap(depth, node))
    }

    fn write_back<D: SectorDevice>(&self, dev: &mut D, sector: SectorNumber) -> Result<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        match self {
            PointerNode::Direct { data_sector } => {
                buf[..4].copy_from_slice(data_sector.as_bytes());
            }
            PointerNode::SingleIndirect(node)
            | PointerNode::DoubleIndirect(node)
            | PointerNode::TripleIndirect(node) => {
                for i in 0..node.num_children {
                    node.children[i].write_back(dev, node.child_sectors[i])?;
                }
                let raw = RawIndirect {
                    num_children: node.num_children as u32,
                    children: node.child_sectors,
                };
                buf.copy_from_slice(raw.as_bytes());
            }
        }
        dev.write_sector(sector, &buf)?;
        Ok(())
    }
}

/// Describes where on disk to find all of the data in a file, as a pointer
/// tree whose depth is chosen from the file's byte length. The header is
/// stored in a single sector; the pointer count and every child array are
/// bounded by the per-sector id capacity, which puts a hard ceiling on the
/// representable file size.
///
/// A header is initialized in one of two ways: for a new file, by claiming
/// sectors for the pointer tree out of the free map; for a file already on
/// disk, by reading the tree back from its header sector.
#[derive(Clone)]
pub struct FileHeader {
    byte_len: u32,
    level: u8,
    num_pointers: usize,
    pointer_sectors: [SectorNumber; NUM_HEADER_POINTERS],
    table: Vec<PointerNode>,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            byte_len: 0,
            level: 1,
            num_pointers: 0,
            pointer_sectors: [0; NUM_HEADER_POINTERS],
            table: Vec::new(),
        }
    }

    /// Logical length of the file in bytes.
    pub fn len(&self) -> u32 {
        self.byte_len
    }

    /// The indirection level of the pointer tree.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Claims space for a file of `byte_len` bytes: the pointer tree plus
    /// one data sector per `SECTOR_SIZE` slice of payload. Payload is dealt
    /// out to the top-level pointers a full subtree at a time, the last
    /// pointer taking the remainder.
    ///
    /// Either the whole reservation succeeds or the free map is left
    /// exactly as it was found. The header's own sector is not claimed
    /// here; the caller owns it.
    pub fn allocate(&mut self, freemap: &mut FreeMap, byte_len: u32) -> Result<()> {
        let level = level_for(byte_len)?;
        let data_sectors = div_round_up(byte_len, SECTOR_SIZE as u32);
        if freemap.num_clear() < required_sectors(level, data_sectors) {
            return Err(FsError::NoSpace);
        }

        self.byte_len = byte_len;
        self.level = level;
        self.num_pointers = 0;
        self.table.clear();

        let chunk = span_sectors(level);
        let mut remain = data_sectors;
        while remain > 0 {
            let take = remain.min(chunk);
            let node_sector = match freemap.find_and_set() {
                Some(s) => s,
                None => {
                    self.deallocate(freemap);
                    return Err(FsError::NoSpace);
                }
            };
            match PointerNode::allocate(freemap, level, take) {
                Ok(node) => {
                    self.pointer_sectors[self.num_pointers] = node_sector;
                    self.table.push(node);
                    self.num_pointers += 1;
                }
                Err(e) => {
                    freemap.clear(node_sector);
                    self.deallocate(freemap);
                    return Err(e);
                }
            }
            remain -= take;
        }
        Ok(())
    }

    /// Releases every sector reachable from this header, depth-first. The
    /// header's own sector is the caller's to release.
    pub fn deallocate(&mut self, freemap: &mut FreeMap) {
        for (node, &sector) in self.table.iter_mut().zip(self.pointer_sectors.iter()) {
            node.deallocate(freemap);
            freemap.clear(sector);
        }
        self.table.clear();
        self.num_pointers = 0;
    }

    /// Translates a byte offset within the file to the sector holding it.
    /// Division is floor division at every level, and the remainder is
    /// always taken against the same child span used for the quotient.
    pub fn byte_to_sector(&self, offset: u32) -> Result<SectorNumber> {
        if offset >= self.byte_len {
            return Err(FsError::OutOfRange);
        }
        let child_bytes = span_bytes(self.level);
        let index = (offset / child_bytes) as usize;
        if index >= self.num_pointers {
            return Err(FsError::OutOfRange);
        }
        self.table[index].byte_to_sector(offset % child_bytes)
    }

    /// Reads a header and its whole pointer tree back from disk. The level
    /// is recomputed from the stored byte length with the same rule used at
    /// allocation time.
    pub fn fetch_from<D: SectorDevice>(dev: &mut D, sector: SectorNumber) -> Result<FileHeader> {
        let mut buf = [0u8; SECTOR_SIZE];
        dev.read_sector(sector, &mut buf)?;
        let raw = RawHeader::read_from(&buf[..]).unwrap();

        let level = level_for(raw.byte_len)?;
        let num_pointers = raw.num_pointers as usize;
        assert!(
            num_pointers <= NUM_HEADER_POINTERS,
            "header pointer count {} exceeds the per-sector limit",
            raw.num_pointers
        );

        let mut header = FileHeader::new();
        header.byte_len = raw.byte_len;
        header.level = level;
        header.num_pointers = num_pointers;
        header.pointer_sectors = raw.pointers;
        for i in 0..num_pointers {
            header.table.push(PointerNode::fetch_from(
                dev,
                level,
                header.pointer_sectors[i],
            )?);
        }
        Ok(header)
    }

    /// Persists the pointer tree, then the header sector itself.
    pub fn write_back<D: SectorDevice>(&self, dev: &mut D, sector: SectorNumber) -> Result<()> {
        for i in 0..self.num_pointers {
            self.table[i].write_back(dev, self.pointer_sectors[i])?;
        }
        let raw = RawHeader {
            byte_len: self.byte_len,
            num_pointers: self.num_pointers as u32,
            pointers: self.pointer_sectors,
        };
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(raw.as_bytes());
        dev.write_sector(sector, &buf)?;
        Ok(())
    }

    /// Reads the file's full content, one sector at a time, through the
    /// offset-to-sector lookup. Only the final slice may be short.
    pub(crate) fn read_content<D: SectorDevice>(&self, dev: &mut D) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.byte_len as usize];
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, chunk) in out.chunks_mut(SECTOR_SIZE).enumerate() {
            let sector = self.byte_to_sector((i * SECTOR_SIZE) as u32)?;
            dev.read_sector(sector, &mut buf)?;
            chunk.copy_from_slice(&buf[..chunk.len()]);
        }
        Ok(out)
    }

    /// Writes `bytes` as the file's content, one sector at a time. Content
    /// must fit the length the header was allocated for.
    pub(crate) fn write_content<D: SectorDevice>(&self, dev: &mut D, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() as u32 <= self.byte_len);
        for (i, chunk) in bytes.chunks(SECTOR_SIZE).enumerate() {
            let sector = self.byte_to_sector((i * SECTOR_SIZE) as u32)?;
            let mut buf = [0u8; SECTOR_SIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            dev.write_sector(sector, &buf)?;
        }
        Ok(())
    }
}
