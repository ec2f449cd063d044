//! Request handlers: the public operations a dispatcher calls, one at a
//! time, to completion. Each composes geometry, cluster-chain traversal,
//! directory iteration, and the handle registries.
//!
//! Directory and file handles borrow their owning filesystem by storing
//! its id and looking it up through [`FILESYSTEMS`] on every call, rather
//! than holding a Rust reference: the registry is a process-wide global,
//! so a borrowed reference would make these structs self-referential.

use alloc::boxed::Box;
use lazy_static::lazy_static;
use spin::RwLock;

use crate::block_device::BlockDevice;
use crate::bpb::Geometry;
use crate::dir::{read_next_entry, DirCursor, DirEntry};
use crate::fat::{next_cluster, read_cluster, NextCluster};
use crate::registry::Registry;
use crate::{Fat32Error, MAX_HANDLES};

struct FilesystemHandle {
    device: Box<dyn BlockDevice>,
    geometry: Geometry,
    #[allow(dead_code)]
    requester: u64,
}

/// The memoized state of the most recently yielded directory entry,
/// consulted by `open_child_directory`/`open_child_file`.
#[derive(Clone, Copy)]
struct LastEntry {
    first_cluster: u32,
    is_dir: bool,
    size: u32,
}

struct DirectoryHandle {
    fs_id: u64,
    cursor: DirCursor,
    last_entry: Option<LastEntry>,
}

struct FileHandle {
    fs_id: u64,
    active_cluster: Option<u32>,
    remaining: u32,
}

lazy_static! {
    static ref FILESYSTEMS: RwLock<Registry<FilesystemHandle>> = RwLock::new(Registry::new(MAX_HANDLES));
    static ref DIRECTORIES: RwLock<Registry<DirectoryHandle>> = RwLock::new(Registry::new(MAX_HANDLES));
    static ref FILES: RwLock<Registry<FileHandle>> = RwLock::new(Registry::new(MAX_HANDLES));
}

/// Opens a FAT32 filesystem over `device`, reading and validating its
/// boot sector. On any failure the device is dropped (released) before
/// the error is returned.
pub fn open_filesystem(device: Box<dyn BlockDevice>, requester: u64) -> Result<u64, Fat32Error> {
    let mut boot_sector = [0u8; 512];
    let read = device.read_at(0, &mut boot_sector).map_err(|_| Fat32Error::Io)?;
    if read != boot_sector.len() {
        return Err(Fat32Error::Io);
    }
    let geometry = Geometry::parse(&boot_sector)?;

    FILESYSTEMS
        .write()
        .create(FilesystemHandle { device, geometry, requester })
}

/// Opens the root directory of `fs`.
pub fn open_root_directory(fs: u64, _requester: u64) -> Result<u64, Fat32Error> {
    let filesystems = FILESYSTEMS.read();
    let fs_handle = filesystems.get(fs).ok_or(Fat32Error::Invalid)?;
    let cursor = DirCursor::open(fs_handle.device.as_ref(), &fs_handle.geometry, fs_handle.geometry.root_cluster)?;
    drop(filesystems);

    DIRECTORIES
        .write()
        .create(DirectoryHandle { fs_id: fs, cursor, last_entry: None })
}

/// Reads the next logical entry from `dir`, memoizing its cluster/kind/size
/// for a following `open_child_*` call. `Ok(None)` means the directory is
/// exhausted.
pub fn read_dir_entry(dir: u64, _requester: u64) -> Result<Option<DirEntry>, Fat32Error> {
    let filesystems = FILESYSTEMS.read();
    let mut directories = DIRECTORIES.write();
    let dir_handle = directories.get_mut(dir).ok_or(Fat32Error::Invalid)?;
    let fs_handle = filesystems.get(dir_handle.fs_id).ok_or(Fat32Error::Invalid)?;

    let entry = read_next_entry(fs_handle.device.as_ref(), &fs_handle.geometry, &mut dir_handle.cursor)?;
    dir_handle.last_entry = entry.as_ref().map(|e| LastEntry {
        first_cluster: e.first_cluster,
        is_dir: e.is_dir,
        size: e.size,
    });
    Ok(entry)
}

/// Opens the directory most recently yielded by `read_dir_entry` on `dir`.
/// Fails with `Invalid` if no entry was read, or the memoized entry is not
/// a directory.
pub fn open_child_directory(dir: u64, _requester: u64) -> Result<u64, Fat32Error> {
    let filesystems = FILESYSTEMS.read();
    let directories = DIRECTORIES.read();
    let parent = directories.get(dir).ok_or(Fat32Error::Invalid)?;
    let last = parent.last_entry.ok_or(Fat32Error::Invalid)?;
    if !last.is_dir {
        return Err(Fat32Error::Invalid);
    }
    let fs_handle = filesystems.get(parent.fs_id).ok_or(Fat32Error::Invalid)?;
    let cursor = DirCursor::open(fs_handle.device.as_ref(), &fs_handle.geometry, last.first_cluster)?;
    let fs_id = parent.fs_id;
    drop(directories);
    drop(filesystems);

    DIRECTORIES
        .write()
        .create(DirectoryHandle { fs_id, cursor, last_entry: None })
}

/// Opens the file most recently yielded by `read_dir_entry` on `dir`.
/// Fails with `Invalid` if no entry was read, or the memoized entry is a
/// directory.
pub fn open_child_file(dir: u64, _requester: u64) -> Result<u64, Fat32Error> {
    let directories = DIRECTORIES.read();
    let parent = directories.get(dir).ok_or(Fat32Error::Invalid)?;
    let last = parent.last_entry.ok_or(Fat32Error::Invalid)?;
    if last.is_dir {
        return Err(Fat32Error::Invalid);
    }
    let fs_id = parent.fs_id;
    drop(directories);

    let active_cluster = if last.size == 0 || last.first_cluster < 2 {
        None
    } else {
        Some(last.first_cluster)
    };

    FILES
        .write()
        .create(FileHandle { fs_id, active_cluster, remaining: last.size })
}

/// Reads one cluster's worth of file data into `buf`, which must be at
/// least `bytes_per_cluster` long. Writes the number of bytes actually
/// produced into `*len`; zero means the file is exhausted.
pub fn read_file_block(file: u64, buf: &mut [u8], len: &mut usize) -> Result<(), Fat32Error> {
    let filesystems = FILESYSTEMS.read();
    let mut files = FILES.write();
    let file_handle = files.get_mut(file).ok_or(Fat32Error::Invalid)?;
    let fs_handle = filesystems.get(file_handle.fs_id).ok_or(Fat32Error::Invalid)?;
    let bytes_per_cluster = fs_handle.geometry.bytes_per_cluster as usize;

    if *len < bytes_per_cluster {
        return Err(Fat32Error::Invalid);
    }

    let cluster = match file_handle.active_cluster {
        None => {
            *len = 0;
            return Ok(());
        }
        Some(c) => c,
    };
    if file_handle.remaining == 0 {
        file_handle.active_cluster = None;
        *len = 0;
        return Ok(());
    }

    read_cluster(fs_handle.device.as_ref(), &fs_handle.geometry, cluster, &mut buf[..bytes_per_cluster])?;

    if (file_handle.remaining as usize) < bytes_per_cluster {
        *len = file_handle.remaining as usize;
        file_handle.remaining = 0;
        file_handle.active_cluster = None;
    } else {
        *len = bytes_per_cluster;
        file_handle.remaining -= bytes_per_cluster as u32;
        match next_cluster(fs_handle.device.as_ref(), &fs_handle.geometry, cluster)? {
            NextCluster::Cluster(next) => file_handle.active_cluster = Some(next),
            NextCluster::EndOfChain => {
                file_handle.active_cluster = None;
                if file_handle.remaining > 0 {
                    log::warn!(
                        "cluster chain ended with {} bytes still declared for file",
                        file_handle.remaining
                    );
                }
            }
        }
    }
    Ok(())
}

pub fn close_file(file: u64) -> Result<(), Fat32Error> {
    FILES.write().destroy(file).map(|_| ()).ok_or(Fat32Error::Invalid)
}

pub fn close_directory(dir: u64) -> Result<(), Fat32Error> {
    DIRECTORIES.write().destroy(dir).map(|_| ()).ok_or(Fat32Error::Invalid)
}

pub fn close_filesystem(fs: u64) -> Result<(), Fat32Error> {
    FILESYSTEMS.write().destroy(fs).map(|_| ()).ok_or(Fat32Error::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::DeviceError;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct FakeDevice {
        data: Mutex<Vec<u8>>,
    }

    impl BlockDevice for FakeDevice {
        fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, DeviceError> {
            let data = self.data.lock();
            if offset + buf.len() > data.len() {
                return Err(DeviceError::OutOfRange);
            }
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            Ok(buf.len())
        }
    }

    fn boot_sector_image(total_sectors_32: u32) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[0] = 0xEB;
        sector[1] = 0x58;
        sector[2] = 0x90;
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 8;
        sector[14..16].copy_from_slice(&32u16.to_le_bytes());
        sector[16] = 2;
        sector[17..19].copy_from_slice(&0u16.to_le_bytes());
        sector[19..21].copy_from_slice(&0u16.to_le_bytes());
        sector[22..24].copy_from_slice(&0u16.to_le_bytes());
        sector[32..36].copy_from_slice(&total_sectors_32.to_le_bytes());
        sector[36..40].copy_from_slice(&1009u32.to_le_bytes());
        sector[44..48].copy_from_slice(&2u32.to_le_bytes());
        sector[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        sector
    }

    fn image_with_root(root_cluster_contents: &[u8]) -> Vec<u8> {
        let mut image = boot_sector_image(1_048_576);
        let first_data_sector = 2050usize;
        let offset = first_data_sector * 512;
        image.resize(offset + root_cluster_contents.len().max(4096), 0);
        image[offset..offset + root_cluster_contents.len()].copy_from_slice(root_cluster_contents);
        // Root cluster (2) terminates immediately: single-cluster root directory.
        let fat_entry_offset = 32 * 512 + 2 * 4;
        image[fat_entry_offset..fat_entry_offset + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        image
    }

    #[test]
    fn open_filesystem_rejects_non_fat32_image() {
        let mut image = boot_sector_image(526_242 - 1);
        image[0] = 0x00;
        let device = Box::new(FakeDevice { data: Mutex::new(image) });
        assert_eq!(open_filesystem(device, 0), Err(Fat32Error::NotFat));
    }

    #[test]
    fn open_filesystem_then_root_directory_and_close() {
        let image = image_with_root(&[0u8; 32]);
        let device = Box::new(FakeDevice { data: Mutex::new(image) });
        let fs = open_filesystem(device, 0).unwrap();
        let dir = open_root_directory(fs, 0).unwrap();

        let entry = read_dir_entry(dir, 0).unwrap();
        assert!(entry.is_none());

        close_directory(dir).unwrap();
        close_filesystem(fs).unwrap();
        assert_eq!(close_filesystem(fs), Err(Fat32Error::Invalid));
    }

    #[test]
    fn closing_one_filesystem_does_not_disturb_another() {
        let device_a = Box::new(FakeDevice { data: Mutex::new(image_with_root(&[0u8; 32])) });
        let device_b = Box::new(FakeDevice { data: Mutex::new(image_with_root(&[0u8; 32])) });
        let fs0 = open_filesystem(device_a, 0).unwrap();
        let fs1 = open_filesystem(device_b, 0).unwrap();
        close_filesystem(fs0).unwrap();
        assert_eq!(close_filesystem(fs0), Err(Fat32Error::Invalid));
        assert!(open_root_directory(fs1, 0).is_ok());
    }

    #[test]
    fn open_child_file_requires_prior_read() {
        let image = image_with_root(&[0u8; 32]);
        let device = Box::new(FakeDevice { data: Mutex::new(image) });
        let fs = open_filesystem(device, 0).unwrap();
        let dir = open_root_directory(fs, 0).unwrap();
        assert_eq!(open_child_file(dir, 0), Err(Fat32Error::Invalid));
    }

    #[test]
    fn read_file_block_rejects_undersized_buffer() {
        let image = image_with_root(&[0u8; 32]);
        let device = Box::new(FakeDevice { data: Mutex::new(image) });
        let fs = open_filesystem(device, 0).unwrap();
        let dir = open_root_directory(fs, 0).unwrap();
        // Manufacture a file handle directly to exercise the buffer check
        // without depending on directory contents.
        let file_id = FILES
            .write()
            .create(FileHandle { fs_id: fs, active_cluster: Some(5), remaining: 100 })
            .unwrap();
        let mut small_buf = [0u8; 10];
        let mut len = small_buf.len();
        assert_eq!(read_file_block(file_id, &mut small_buf, &mut len), Err(Fat32Error::Invalid));
        close_file(file_id).unwrap();
        close_directory(dir).unwrap();
        close_filesystem(fs).unwrap();
    }
}
