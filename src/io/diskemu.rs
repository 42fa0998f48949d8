use crate::fs::SECTOR_SIZE;
use crate::io::{SectorDevice, SectorNumber};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// Emulates sector-granular disk storage in userspace using a file as the
/// backing store. This is only meant to be used for filesystem development
/// and testing.
pub struct FileSectorEmulator {
    /// The file is a fixed-size file, some exact multiple of the sector size.
    fd: File,
    /// The total number of sectors available on the emulated device.
    sector_count: usize,
}

impl FileSectorEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl SectorDevice for FileSectorEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nsectors: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return an error if the image does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        Ok(FileSectorEmulator {
            fd: file,
            sector_count: nsectors,
        })
    }

    fn read_sector(&mut self, sector: SectorNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }

        if buf.len() < SECTOR_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read sector",
            ));
        }
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        self.fd.read_exact(&mut buf[..SECTOR_SIZE])?;
        Ok(())
    }

    fn write_sector(&mut self, sector: SectorNumber, buf: &[u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;

        // Truncate writes that exceed the sector size.
        let max = if SECTOR_SIZE < buf.len() {
            SECTOR_SIZE
        } else {
            buf.len()
        };
        self.fd.write_all(&buf[0..max])?;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileSectorEmulatorBuilder {
    fd: File,
    sector_count: usize,
    clear_medium: bool,
}

impl From<File> for FileSectorEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileSectorEmulatorBuilder {
            fd,
            sector_count: 0,
            clear_medium: true,
        }
    }
}

impl FileSectorEmulatorBuilder {
    /// Sets the number of sectors on the emulated device.
    pub fn with_sector_count(mut self, sectors: usize) -> Self {
        self.sector_count = sectors;
        self
    }

    /// Controls whether the backing file is zeroed out when building. Pass
    /// `false` to reopen an already-initialized image without wiping it.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, by
    /// default, does destructive things to prepare the file for use.
    /// Ownership of the file is transferred to the emulator, meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileSectorEmulator> {
        debug_assert!(self.sector_count > 0);
        if self.clear_medium {
            self.zero_sectors()?;
        }
        Ok(FileSectorEmulator {
            fd: self.fd,
            sector_count: self.sector_count,
        })
    }

    fn zero_sectors(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk", buffering each write to prevent excessive
        // syscalls.
        for _ in 0..self.sector_count {
            bfd.write_all(vec![0x00; SECTOR_SIZE].as_slice())?;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(4)
            .build()
            .expect("failed to allocate emulated disk");
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            4 * SECTOR_SIZE as u64
        );
    }

    #[test]
    fn can_read_and_write_sectors() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(4)
            .build()
            .expect("failed to allocate emulated disk");

        // Fill a sector with a non-zero pattern.
        let sector = vec![0x55; SECTOR_SIZE];
        disk_emu.write_sector(2, &sector).unwrap();
        disk_emu.sync_disk().unwrap();

        // An untouched sector reads back as zeros.
        let mut read_back = vec![0x00; SECTOR_SIZE];
        disk_emu.read_sector(3, read_back.as_mut_slice()).unwrap();
        assert_eq!(read_back, vec![0x00; SECTOR_SIZE]);

        // The written sector reads back the pattern.
        let mut filled = vec![0x00; SECTOR_SIZE];
        disk_emu.read_sector(2, filled.as_mut_slice()).unwrap();
        assert_eq!(filled, vec![0x55; SECTOR_SIZE]);
    }

    #[test]
    fn can_read_and_write_start_and_end_sectors() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(2)
            .build()
            .expect("failed to allocate emulated disk");

        let sector = vec![0x55; SECTOR_SIZE];
        disk_emu.write_sector(0, &sector).unwrap();
        disk_emu.write_sector(1, &sector).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_back = vec![0x00; SECTOR_SIZE];
        disk_emu.read_sector(0, read_back.as_mut_slice()).unwrap();
        assert_eq!(read_back, vec![0x55; SECTOR_SIZE]);

        let mut read_back = vec![0x00; SECTOR_SIZE];
        disk_emu.read_sector(1, read_back.as_mut_slice()).unwrap();
        assert_eq!(read_back, vec![0x55; SECTOR_SIZE]);
    }

    #[test]
    fn sector_beyond_range_is_rejected() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(1)
            .build()
            .expect("failed to allocate emulated disk");

        let sector = vec![0x55; SECTOR_SIZE];
        assert!(disk_emu.write_sector(1, &sector).is_err());

        let mut buf = vec![0x00; SECTOR_SIZE];
        assert!(disk_emu.read_sector(1, buf.as_mut_slice()).is_err());
    }

    #[test]
    fn reopening_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(2)
            .build()
            .expect("failed to allocate emulated disk");

        let sector = vec![0x55; SECTOR_SIZE];
        disk_emu.write_sector(1, &sector).unwrap();
        disk_emu.sync_disk().unwrap();
        drop(disk_emu);

        let mut reopened = FileSectorEmulatorBuilder::from(disk.reopen().unwrap())
            .with_sector_count(2)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut read_back = vec![0x00; SECTOR_SIZE];
        reopened.read_sector(1, read_back.as_mut_slice()).unwrap();
        assert_eq!(read_back, sector);
    }

    #[test]
    fn short_writes_are_padded_by_initial_zeroing() {
        let backing = tempfile::tempfile().unwrap();
        let mut disk_emu = FileSectorEmulatorBuilder::from(backing)
            .with_sector_count(1)
            .build()
            .expect("failed to allocate emulated disk");

        // Half a sector of meaningful data.
        let half = vec![0x55; SECTOR_SIZE / 2];
        disk_emu.write_sector(0, &half).unwrap();

        let mut read_back = vec![0xff; SECTOR_SIZE];
        disk_emu.read_sector(0, read_back.as_mut_slice()).unwrap();
        assert_eq!(&read_back[..SECTOR_SIZE / 2], half.as_slice());
        assert_eq!(&read_back[SECTOR_SIZE / 2..], vec![0x00; SECTOR_SIZE / 2]);
    }
}
