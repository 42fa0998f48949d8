use sectorfs::io::FileSectorEmulatorBuilder;
use sectorfs::{EntryKind, SectorFs, NUM_SECTORS};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileSectorEmulatorBuilder::from(tmp)
        .with_sector_count(NUM_SECTORS)
        .build()
        .expect("could not initialize disk emulator");

    let mut fs = SectorFs::format(dev).expect("could not format device");
    println!("formatted: {} sectors free", fs.free_sectors());

    fs.create_directory("/docs").unwrap();
    fs.create("/docs/notes", 5000).unwrap();
    fs.create("/hello", 300).unwrap();

    println!("tree:");
    for row in fs.list_recursive("/").unwrap() {
        let tag = match row.kind {
            EntryKind::Dir => 'D',
            EntryKind::File => 'F',
        };
        println!("{}{} {}", "  ".repeat(row.depth), tag, row.name);
    }

    let fd = fs.open("/docs/notes").unwrap();
    println!(
        "/docs/notes: {} bytes, byte 4999 lives in sector {}",
        fs.file_len(fd).unwrap(),
        fs.sector_for(fd, 4999).unwrap()
    );
    fs.close(fd).unwrap();

    fs.remove("/docs").unwrap();
    println!("after removing /docs: {} sectors free", fs.free_sectors());
}
