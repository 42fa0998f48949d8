use std::path::Path;

/// The sector number to access, ranging from 0 (the first sector) to n - 1
/// (the last sector) where n is the number of sectors on the device. Stored
/// on disk as a fixed-width integer, so the alias is fixed-width too.
pub type SectorNumber = u32;

/// Raw block I/O consumed by the filesystem core. Implementations provide
/// sector-granular transfers only; byte-addressed access is layered on top
/// by callers using the core's offset-to-sector lookup.
pub trait SectorDevice {
    /// Opens a disk image at the specified path. This method does not
    /// validate the image contents, it is up to clients to ensure disks are
    /// appropriately initialized.
    fn open_disk<P: AsRef<Path>>(path: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Reads one sector into the provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a sector out of range, or into a buffer smaller
    /// than one sector, returns an error.
    fn read_sector(&mut self, sector: SectorNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes the provided buffer into the specified sector. Writes longer
    /// than one sector are truncated to the sector boundary.
    ///
    /// # Errors
    ///
    /// Attempting to write a sector out of range returns an error.
    fn write_sector(&mut self, sector: SectorNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk I/O from memory. This matters when the
    /// written sectors must be observable through an independent handle to
    /// the same backing store.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
