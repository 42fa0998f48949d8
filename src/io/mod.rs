mod block;
mod diskemu;

pub use block::{SectorDevice, SectorNumber};
pub use diskemu::{FileSectorEmulator, FileSectorEmulatorBuilder};
