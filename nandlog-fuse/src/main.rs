use clap::{App, Arg};
use nandlog::{
  FlashDevice, FlashError, FlashResult, LogFs, NUM_BLOCKS, PAGES_PER_BLOCK, SECTORS_PER_PAGE,
  SECTOR_SIZE, SECTOR_SPARE_SIZE,
};
use std::fs::{read_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

const PAGE_MAIN: usize = SECTOR_SIZE * SECTORS_PER_PAGE as usize;
const PAGE_SPARE: usize = SECTOR_SPARE_SIZE * SECTORS_PER_PAGE as usize;
const PAGE_TOTAL: usize = PAGE_MAIN + PAGE_SPARE;
const BLOCK_TOTAL: usize = PAGE_TOTAL * PAGES_PER_BLOCK as usize;
const DEVICE_BYTES: usize = BLOCK_TOTAL * NUM_BLOCKS as usize;

/// The device page register: one page of main data plus its spare bytes.
/// Writes AND into it, since programming NAND can only clear bits.
struct Register {
  block: u16,
  page: u16,
  loaded: bool,
  main: [u8; PAGE_MAIN],
  spare: [u8; PAGE_SPARE],
}

impl Register {
  fn new() -> Self {
    Self { block: 0, page: 0, loaded: false, main: [0xFF; PAGE_MAIN], spare: [0xFF; PAGE_SPARE] }
  }

  fn write_main(&mut self, src: &[u8], sector: u16, offset: usize) {
    let base = (sector % SECTORS_PER_PAGE) as usize * SECTOR_SIZE + offset;
    for (dst, s) in self.main[base..base + src.len()].iter_mut().zip(src) {
      *dst &= *s;
    }
  }

  fn write_spare(&mut self, src: &[u8], sector: u16) {
    let base = (sector % SECTORS_PER_PAGE) as usize * SECTOR_SPARE_SIZE;
    for (dst, s) in self.spare[base..base + src.len()].iter_mut().zip(src) {
      *dst &= *s;
    }
  }

  fn read_main(&self, dst: &mut [u8], sector: u16, offset: usize) {
    let base = (sector % SECTORS_PER_PAGE) as usize * SECTOR_SIZE + offset;
    dst.copy_from_slice(&self.main[base..base + dst.len()]);
  }

  fn read_spare(&self, dst: &mut [u8], sector: u16) {
    let base = (sector % SECTORS_PER_PAGE) as usize * SECTOR_SPARE_SIZE;
    dst.copy_from_slice(&self.spare[base..base + dst.len()]);
  }
}

fn page_offset(block: u16, page: u16) -> usize {
  block as usize * BLOCK_TOTAL + page as usize * PAGE_TOTAL
}

/// NAND emulated in a shared byte vector. A "reboot" attaches a fresh
/// device to the same store, losing only the register. `power_cut_after`
/// lets the next N commits succeed and fails every mutation after them.
struct RamNand {
  store: Arc<Mutex<Vec<u8>>>,
  reg: Mutex<Register>,
  cut: Mutex<Option<u32>>,
}

impl RamNand {
  fn new_store() -> Arc<Mutex<Vec<u8>>> {
    Arc::new(Mutex::new(vec![0xFF; DEVICE_BYTES]))
  }

  fn attach(store: Arc<Mutex<Vec<u8>>>) -> Self {
    Self { store, reg: Mutex::new(Register::new()), cut: Mutex::new(None) }
  }

  fn power_cut_after(&self, commits: u32) {
    *self.cut.lock().unwrap() = Some(commits);
  }

  fn check_power(&self) -> FlashResult<()> {
    match *self.cut.lock().unwrap() {
      Some(0) => Err(FlashError),
      _ => Ok(()),
    }
  }

  fn consume_commit(&self) -> FlashResult<()> {
    let mut cut = self.cut.lock().unwrap();
    match cut.as_mut() {
      Some(0) => Err(FlashError),
      Some(n) => {
        *n -= 1;
        Ok(())
      }
      None => Ok(()),
    }
  }
}

impl FlashDevice for RamNand {
  fn init(&self) -> FlashResult<()> {
    Ok(())
  }

  fn open_page(&self, block: u16, page: u16) -> FlashResult<()> {
    let mut reg = self.reg.lock().unwrap();
    let store = self.store.lock().unwrap();
    let at = page_offset(block, page);
    reg.main.copy_from_slice(&store[at..at + PAGE_MAIN]);
    reg.spare.copy_from_slice(&store[at + PAGE_MAIN..at + PAGE_TOTAL]);
    reg.block = block;
    reg.page = page;
    reg.loaded = true;
    Ok(())
  }

  fn block_is_bad(&self) -> bool {
    false
  }

  fn erase_block(&self, block: u16) -> FlashResult<()> {
    self.check_power()?;
    let mut store = self.store.lock().unwrap();
    let at = block as usize * BLOCK_TOTAL;
    store[at..at + BLOCK_TOTAL].fill(0xFF);
    Ok(())
  }

  fn read_sector(&self, dst: &mut [u8], sector: u16, offset: usize) -> FlashResult<()> {
    self.reg.lock().unwrap().read_main(dst, sector, offset);
    Ok(())
  }

  fn write_sector(&self, src: &[u8], sector: u16, offset: usize) -> FlashResult<()> {
    self.reg.lock().unwrap().write_main(src, sector, offset);
    Ok(())
  }

  fn read_spare(&self, dst: &mut [u8], sector: u16) -> FlashResult<()> {
    self.reg.lock().unwrap().read_spare(dst, sector);
    Ok(())
  }

  fn write_spare(&self, src: &[u8], sector: u16) -> FlashResult<()> {
    self.reg.lock().unwrap().write_spare(src, sector);
    Ok(())
  }

  fn commit(&self) -> FlashResult<()> {
    self.consume_commit()?;
    let reg = self.reg.lock().unwrap();
    if !reg.loaded {
      return Err(FlashError);
    }
    let mut store = self.store.lock().unwrap();
    let at = page_offset(reg.block, reg.page);
    store[at..at + PAGE_MAIN].copy_from_slice(&reg.main);
    store[at + PAGE_MAIN..at + PAGE_TOTAL].copy_from_slice(&reg.spare);
    Ok(())
  }
}

/// NAND emulated in an image file, for the packer.
struct FileNand {
  file: Mutex<File>,
  reg: Mutex<Register>,
}

impl FileNand {
  fn create(path: &str) -> std::io::Result<Self> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.set_len(DEVICE_BYTES as u64)?;
    Ok(Self { file: Mutex::new(file), reg: Mutex::new(Register::new()) })
  }
}

impl FlashDevice for FileNand {
  fn init(&self) -> FlashResult<()> {
    Ok(())
  }

  fn open_page(&self, block: u16, page: u16) -> FlashResult<()> {
    let mut file = self.file.lock().unwrap();
    let mut reg = self.reg.lock().unwrap();
    file.seek(SeekFrom::Start(page_offset(block, page) as u64)).map_err(|_| FlashError)?;
    file.read_exact(&mut reg.main).map_err(|_| FlashError)?;
    file.read_exact(&mut reg.spare).map_err(|_| FlashError)?;
    reg.block = block;
    reg.page = page;
    reg.loaded = true;
    Ok(())
  }

  fn block_is_bad(&self) -> bool {
    false
  }

  fn erase_block(&self, block: u16) -> FlashResult<()> {
    let mut file = self.file.lock().unwrap();
    let at = block as usize * BLOCK_TOTAL;
    file.seek(SeekFrom::Start(at as u64)).map_err(|_| FlashError)?;
    file.write_all(&vec![0xFF; BLOCK_TOTAL]).map_err(|_| FlashError)?;
    Ok(())
  }

  fn read_sector(&self, dst: &mut [u8], sector: u16, offset: usize) -> FlashResult<()> {
    self.reg.lock().unwrap().read_main(dst, sector, offset);
    Ok(())
  }

  fn write_sector(&self, src: &[u8], sector: u16, offset: usize) -> FlashResult<()> {
    self.reg.lock().unwrap().write_main(src, sector, offset);
    Ok(())
  }

  fn read_spare(&self, dst: &mut [u8], sector: u16) -> FlashResult<()> {
    self.reg.lock().unwrap().read_spare(dst, sector);
    Ok(())
  }

  fn write_spare(&self, src: &[u8], sector: u16) -> FlashResult<()> {
    self.reg.lock().unwrap().write_spare(src, sector);
    Ok(())
  }

  fn commit(&self) -> FlashResult<()> {
    let reg = self.reg.lock().unwrap();
    if !reg.loaded {
      return Err(FlashError);
    }
    let mut file = self.file.lock().unwrap();
    file.seek(SeekFrom::Start(page_offset(reg.block, reg.page) as u64)).map_err(|_| FlashError)?;
    file.write_all(&reg.main).map_err(|_| FlashError)?;
    file.write_all(&reg.spare).map_err(|_| FlashError)?;
    Ok(())
  }
}

pub fn main() {
  img_pack().expect("Error when creating flash.img");
}

fn img_pack() -> std::io::Result<()> {
  let matches = App::new("nandlog image packer")
    .arg(
      Arg::with_name("source")
        .short("s")
        .long("source")
        .takes_value(true)
        .help("Directory of files to pack (with backslash)"),
    )
    .arg(
      Arg::with_name("target")
        .short("t")
        .long("target")
        .takes_value(true)
        .help("Directory receiving flash.img (with backslash)"),
    )
    .get_matches();

  let src = matches.value_of("source").unwrap();
  let dst = matches.value_of("target").unwrap();
  println!("src = {}, dst = {}", src, dst);

  let nand = Arc::new(FileNand::create(&format!("{}{}", dst, "flash.img"))?);
  let fs = LogFs::init(nand).expect("flash init failed");
  fs.format().expect("format failed");
  fs.mount().expect("mount failed");

  for entry in read_dir(src)? {
    let entry = entry?;
    let name = entry.file_name().into_string().unwrap();
    let mut data = Vec::new();
    File::open(entry.path())?.read_to_end(&mut data)?;

    let mut f = fs.open_write(&name).expect("create failed");
    assert_eq!(f.write(&data).unwrap(), data.len(), "image full while packing {}", name);
    f.close().expect("close failed");
    println!("packed {} ({} bytes)", name, data.len());
  }

  for name in fs.ls().unwrap() {
    println!("{}", name);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use nandlog::{FsError, BLOCK_CAPACITY};
  use std::mem;

  fn fresh_fs(store: &Arc<Mutex<Vec<u8>>>) -> LogFs {
    LogFs::init(Arc::new(RamNand::attach(store.clone()))).unwrap()
  }

  fn random_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|_| rand::random::<u8>()).collect()
  }

  fn write_file(fs: &LogFs, name: &str, data: &[u8]) {
    let mut f = fs.open_write(name).unwrap();
    assert_eq!(f.write(data).unwrap(), data.len());
    f.close().unwrap();
  }

  fn read_all(fs: &LogFs, name: &str) -> Vec<u8> {
    let mut f = fs.open_read(name).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    loop {
      let n = f.read(&mut buf).unwrap();
      if n == 0 {
        break;
      }
      out.extend_from_slice(&buf[..n]);
    }
    f.close().unwrap();
    out
  }

  #[test]
  fn format_mount_empty_ls() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    assert!(!fs.is_mounted());
    fs.mount().unwrap();
    assert!(fs.is_mounted());

    let mut ls = fs.start_ls().unwrap();
    assert_eq!(ls.next_name().unwrap(), None);
    assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1);
    assert_eq!(fs.num_files(), 0);

    // mounting again is a no-op
    fs.mount().unwrap();
    assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1);
  }

  #[test]
  fn create_and_read_back() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    let data = random_bytes(100);
    write_file(&fs, "a.log", &data);
    assert_eq!(fs.num_files(), 1);

    let mut f = fs.open_read("a.log").unwrap();
    let mut buf = vec![0u8; 100];
    assert_eq!(f.read(&mut buf).unwrap(), 100);
    assert_eq!(buf, data);
    assert_eq!(f.position(), 100);
    assert_eq!(f.read(&mut buf).unwrap(), 0);
    f.close().unwrap();

    assert_eq!(fs.ls().unwrap(), vec!["a.log".to_string()]);
    assert!(matches!(fs.open_read("missing"), Err(FsError::NotFound)));
  }

  #[test]
  fn sector_boundary_fill_and_append() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    // exactly the payload capacity of sector 0
    let first = random_bytes(SECTOR_SIZE - 8);
    write_file(&fs, "edge", &first);
    assert_eq!(read_all(&fs, "edge"), first);

    // the next byte lands in the following sector, via reopen-append
    let mut f = fs.open_write("edge").unwrap();
    assert_eq!(f.position(), first.len() as u32);
    assert_eq!(f.write(&[0x5A]).unwrap(), 1);
    f.close().unwrap();

    let mut expect = first;
    expect.push(0x5A);
    assert_eq!(read_all(&fs, "edge"), expect);
  }

  #[test]
  fn cross_block_write_survives_remount() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    let total = 2 * SECTORS_PER_PAGE as usize * PAGES_PER_BLOCK as usize * SECTOR_SIZE;
    let data = random_bytes(total);
    write_file(&fs, "big.bin", &data);

    drop(fs);
    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    assert_eq!(read_all(&fs, "big.bin"), data);

    // the chain spans several blocks
    let chain_blocks = (total + BLOCK_CAPACITY - 1) / BLOCK_CAPACITY;
    assert!(chain_blocks >= 2);
    assert_eq!(fs.free_blocks(), NUM_BLOCKS - 1 - chain_blocks as u16);
  }

  #[test]
  fn append_survives_remount() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    let a = random_bytes(300);
    write_file(&fs, "grow", &a);

    drop(fs);
    let fs = fresh_fs(&store);
    fs.mount().unwrap();

    let b = random_bytes(BLOCK_CAPACITY);
    let mut f = fs.open_write("grow").unwrap();
    assert_eq!(f.position(), 300);
    assert_eq!(f.write(&b).unwrap(), b.len());
    f.close().unwrap();

    let mut expect = a;
    expect.extend_from_slice(&b);
    assert_eq!(read_all(&fs, "grow"), expect);
  }

  #[test]
  fn delete_is_idempotent() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    write_file(&fs, "a.log", &random_bytes(64));
    let free_before = fs.free_blocks();
    fs.rm("a.log").unwrap();
    fs.rm("a.log").unwrap();
    fs.rm("never-existed").unwrap();
    assert!(matches!(fs.open_read("a.log"), Err(FsError::NotFound)));
    assert_eq!(fs.ls().unwrap().len(), 0);
    assert_eq!(fs.num_files(), 0);
    assert_eq!(fs.free_blocks(), free_before + 1);
  }

  #[test]
  fn deleted_name_can_be_recreated() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    write_file(&fs, "a.log", b"old old old");
    fs.rm("a.log").unwrap();
    write_file(&fs, "a.log", b"new");
    assert_eq!(read_all(&fs, "a.log"), b"new");

    drop(fs);
    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    assert_eq!(read_all(&fs, "a.log"), b"new");
  }

  #[test]
  fn crash_mid_create_leaves_live_empty_file() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    // the inode entry commits inside open_write; power is lost before the
    // first data sector does
    let f = fs.open_write("a.log").unwrap();
    mem::forget(f);
    drop(fs);

    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    assert_eq!(fs.ls().unwrap(), vec!["a.log".to_string()]);
    assert_eq!(read_all(&fs, "a.log"), b"");

    // the repaired file is fully usable
    let data = random_bytes(500);
    let mut f = fs.open_write("a.log").unwrap();
    assert_eq!(f.write(&data).unwrap(), data.len());
    f.close().unwrap();
    assert_eq!(read_all(&fs, "a.log"), data);
  }

  #[test]
  fn crash_mid_delete_is_finished_by_mount() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();
    let total = 2 * SECTORS_PER_PAGE as usize * PAGES_PER_BLOCK as usize * SECTOR_SIZE;
    write_file(&fs, "doomed", &random_bytes(total));
    drop(fs);

    // identical flash images from here on
    let snapshot = Arc::new(Mutex::new(store.lock().unwrap().clone()));

    // clean deletion on the first store
    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    fs.rm("doomed").unwrap();
    drop(fs);
    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    let clean_free = fs.free_blocks();
    assert_eq!(fs.ls().unwrap().len(), 0);

    // interrupted deletion on the snapshot: the inode invalidation
    // commits, the chain walk behind it does not
    let nand = Arc::new(RamNand::attach(snapshot.clone()));
    let fs2 = LogFs::init(nand.clone()).unwrap();
    fs2.mount().unwrap();
    nand.power_cut_after(1);
    assert!(fs2.rm("doomed").is_err());
    drop(fs2);

    let fs2 = fresh_fs(&snapshot);
    fs2.mount().unwrap();
    assert_eq!(fs2.ls().unwrap().len(), 0);
    assert!(matches!(fs2.open_read("doomed"), Err(FsError::NotFound)));
    assert_eq!(fs2.free_blocks(), clean_free);
  }

  #[test]
  fn seek_always_fails() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();
    write_file(&fs, "f", b"abc");
    let mut f = fs.open_read("f").unwrap();
    assert!(matches!(f.seek(0), Err(FsError::Unsupported)));
    let mut buf = [0u8; 3];
    assert_eq!(f.read(&mut buf).unwrap(), 3);
  }

  #[test]
  fn preallocator_scan_wraps_the_device() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    for _ in 0..2 * NUM_BLOCKS as usize {
      fs.preallocate().unwrap();
    }
    // allocation still works and comes from the preallocation list
    write_file(&fs, "after-scan", b"payload");
    assert_eq!(read_all(&fs, "after-scan"), b"payload");
  }

  #[test]
  fn many_files_grow_the_inode_chain() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    // more entries than one inode block holds
    let slots_per_block = (PAGES_PER_BLOCK as usize - 1) * SECTORS_PER_PAGE as usize / 2 - 1;
    let count = slots_per_block + 4;
    for i in 0..count {
      write_file(&fs, &format!("file-{:03}", i), format!("contents {}", i).as_bytes());
    }
    assert_eq!(fs.num_files() as usize, count);

    drop(fs);
    let fs = fresh_fs(&store);
    fs.mount().unwrap();
    let names = fs.ls().unwrap();
    assert_eq!(names.len(), count);
    for i in 0..count {
      assert!(names.contains(&format!("file-{:03}", i)));
      assert_eq!(read_all(&fs, &format!("file-{:03}", i)), format!("contents {}", i).as_bytes());
    }
  }

  #[test]
  fn out_of_space_truncates_the_write() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();

    let huge = vec![0xA5u8; NUM_BLOCKS as usize * BLOCK_CAPACITY];
    let mut f = fs.open_write("hog").unwrap();
    let written = f.write(&huge).unwrap();
    assert!(written < huge.len());
    let _ = f.close();

    // freeing space makes a later write succeed again
    fs.rm("hog").unwrap();
    write_file(&fs, "small", b"fits now");
    assert_eq!(read_all(&fs, "small"), b"fits now");
  }

  #[test]
  fn name_length_is_bounded() {
    let store = RamNand::new_store();
    let fs = fresh_fs(&store);
    fs.format().unwrap();
    fs.mount().unwrap();
    let long = "x".repeat(nandlog::MAX_FNAME_LEN);
    assert!(matches!(fs.open_write(&long), Err(FsError::NameTooLong)));
    let just_fits = "y".repeat(nandlog::MAX_FNAME_LEN - 1);
    write_file(&fs, &just_fits, b"ok");
    assert_eq!(read_all(&fs, &just_fits), b"ok");
  }

  #[test]
  fn file_image_round_trip() {
    let path = std::env::temp_dir().join("nandlog-test.img");
    let path = path.to_str().unwrap();
    let nand = Arc::new(FileNand::create(path).unwrap());
    let fs = LogFs::init(nand).unwrap();
    fs.format().unwrap();
    fs.mount().unwrap();
    let data = random_bytes(4096);
    write_file(&fs, "blob", &data);
    drop(fs);

    let nand = Arc::new(FileNand::create(path).unwrap());
    let fs = LogFs::init(nand).unwrap();
    fs.mount().unwrap();
    assert_eq!(read_all(&fs, "blob"), data);
  }
}
