//! FAT volume (read-only)
//!
//! Mounts a FAT16/FAT32 filesystem on top of a block-device partition:
//! BPB parse, FAT chain walk, 8.3 directory enumeration and whole-file
//! reads. Long file names are skipped; writes are not supported.

use alloc::string::String;
use alloc::vec::Vec;

use super::{ErrorCode, FileHandle, KResult};

const SECTOR_SIZE: usize = 512;

/// Directory entry attributes
mod attr {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    /// LFN entries carry this marker combination
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatKind {
    Fat16,
    Fat32,
}

/// End-of-chain thresholds
const FAT16_EOC: u32 = 0xFFF8;
const FAT32_EOC: u32 = 0x0FFF_FFF8;

#[derive(Debug, Clone)]
pub struct FatDirEntry {
    pub name: String,
    pub size: u32,
    pub is_dir: bool,
    pub attributes: u8,
    first_cluster: u32,
}

pub struct FatVolume {
    device: FileHandle,
    kind: FatKind,
    sectors_per_cluster: u32,
    first_fat_sector: u64,
    first_data_sector: u64,
    /// FAT16: fixed root directory area
    root_dir_sector: u64,
    root_entry_count: u32,
    /// FAT32: root directory cluster chain
    root_cluster: u32,
    total_clusters: u32,
}

impl FatVolume {
    /// Parse the BPB of the device's first sector and mount.
    pub fn mount(device: FileHandle) -> KResult<FatVolume> {
        let mut sector = [0u8; SECTOR_SIZE];
        read_sector(&device, 0, &mut sector)?;

        if u16::from_le_bytes([sector[510], sector[511]]) != 0xAA55 {
            return Err(ErrorCode::InvalidArg);
        }
        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]) as u32;
        let sectors_per_cluster = sector[13] as u32;
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]) as u32;
        let num_fats = sector[16] as u32;
        let root_entry_count = u16::from_le_bytes([sector[17], sector[18]]) as u32;
        let total_sectors_16 = u16::from_le_bytes([sector[19], sector[20]]) as u32;
        let fat_size_16 = u16::from_le_bytes([sector[22], sector[23]]) as u32;
        let total_sectors_32 = u32::from_le_bytes(sector[32..36].try_into().unwrap());
        let fat_size_32 = u32::from_le_bytes(sector[36..40].try_into().unwrap());
        let root_cluster = u32::from_le_bytes(sector[44..48].try_into().unwrap());

        if bytes_per_sector != SECTOR_SIZE as u32
            || sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || num_fats == 0
        {
            return Err(ErrorCode::InvalidArg);
        }

        let fat_size = if fat_size_16 != 0 { fat_size_16 } else { fat_size_32 };
        let total_sectors = if total_sectors_16 != 0 { total_sectors_16 } else { total_sectors_32 };
        let root_dir_sectors = (root_entry_count * 32).div_ceil(SECTOR_SIZE as u32);
        let first_data_sector =
            (reserved_sectors + num_fats * fat_size + root_dir_sectors) as u64;
        let data_sectors = total_sectors.saturating_sub(first_data_sector as u32);
        let total_clusters = data_sectors / sectors_per_cluster;

        // FAT12 media are not served; everything this system formats is
        // FAT16 or larger.
        let kind = if total_clusters < 4085 {
            return Err(ErrorCode::NotImplemented);
        } else if total_clusters < 65525 {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        };

        crate::log!(
            "[fat] mounted {:?} volume: {} clusters of {} sectors",
            kind,
            total_clusters,
            sectors_per_cluster
        );

        Ok(FatVolume {
            device,
            kind,
            sectors_per_cluster,
            first_fat_sector: reserved_sectors as u64,
            first_data_sector,
            root_dir_sector: (reserved_sectors + num_fats * fat_size) as u64,
            root_entry_count,
            root_cluster,
            total_clusters,
        })
    }

    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Next cluster in the chain, `None` at end-of-chain.
    fn fat_entry(&self, cluster: u32) -> KResult<Option<u32>> {
        let mut sector = [0u8; SECTOR_SIZE];
        match self.kind {
            FatKind::Fat16 => {
                let offset = cluster as u64 * 2;
                read_sector(&self.device, self.first_fat_sector + offset / SECTOR_SIZE as u64, &mut sector)?;
                let index = (offset % SECTOR_SIZE as u64) as usize;
                let value = u16::from_le_bytes([sector[index], sector[index + 1]]) as u32;
                Ok(if value >= FAT16_EOC || value == 0 { None } else { Some(value) })
            }
            FatKind::Fat32 => {
                let offset = cluster as u64 * 4;
                read_sector(&self.device, self.first_fat_sector + offset / SECTOR_SIZE as u64, &mut sector)?;
                let index = (offset % SECTOR_SIZE as u64) as usize;
                let value = u32::from_le_bytes(sector[index..index + 4].try_into().unwrap())
                    & 0x0FFF_FFFF;
                Ok(if value >= FAT32_EOC || value == 0 { None } else { Some(value) })
            }
        }
    }

    /// Entries of the root directory.
    pub fn root_entries(&self) -> KResult<Vec<FatDirEntry>> {
        match self.kind {
            FatKind::Fat16 => {
                let sectors = (self.root_entry_count * 32).div_ceil(SECTOR_SIZE as u32);
                let mut entries = Vec::new();
                let mut sector = [0u8; SECTOR_SIZE];
                'sectors: for i in 0..sectors as u64 {
                    read_sector(&self.device, self.root_dir_sector + i, &mut sector)?;
                    if !parse_dir_sector(&sector, &mut entries) {
                        break 'sectors;
                    }
                }
                Ok(entries)
            }
            FatKind::Fat32 => self.cluster_dir_entries(self.root_cluster),
        }
    }

    /// Entries of a subdirectory.
    pub fn dir_entries(&self, dir: &FatDirEntry) -> KResult<Vec<FatDirEntry>> {
        if !dir.is_dir {
            return Err(ErrorCode::InvalidArg);
        }
        self.cluster_dir_entries(dir.first_cluster)
    }

    fn cluster_dir_entries(&self, first_cluster: u32) -> KResult<Vec<FatDirEntry>> {
        let mut entries = Vec::new();
        let mut sector = [0u8; SECTOR_SIZE];
        let mut cluster = Some(first_cluster);
        while let Some(current) = cluster {
            if current < 2 || current - 2 >= self.total_clusters {
                break;
            }
            let base = self.cluster_to_sector(current);
            for i in 0..self.sectors_per_cluster as u64 {
                read_sector(&self.device, base + i, &mut sector)?;
                if !parse_dir_sector(&sector, &mut entries) {
                    return Ok(entries);
                }
            }
            cluster = self.fat_entry(current)?;
        }
        Ok(entries)
    }

    /// Look up a `/`-separated path from the root.
    pub fn lookup(&self, path: &str) -> KResult<FatDirEntry> {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let first = components.next().ok_or(ErrorCode::InvalidArg)?;
        let mut entry = self
            .root_entries()?
            .into_iter()
            .find(|e| e.name.eq_ignore_ascii_case(first))
            .ok_or(ErrorCode::NotFound)?;
        for component in components {
            entry = self
                .dir_entries(&entry)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component))
                .ok_or(ErrorCode::NotFound)?;
        }
        Ok(entry)
    }

    /// Read a whole file by walking its cluster chain.
    pub fn read_file(&self, entry: &FatDirEntry) -> KResult<Vec<u8>> {
        if entry.is_dir {
            return Err(ErrorCode::InvalidArg);
        }
        let cluster_bytes = self.sectors_per_cluster as usize * SECTOR_SIZE;
        let mut data = Vec::with_capacity(entry.size as usize);
        let mut sector = [0u8; SECTOR_SIZE];
        let mut cluster = Some(entry.first_cluster);
        while data.len() < entry.size as usize {
            let Some(current) = cluster else { break };
            if current < 2 || current - 2 >= self.total_clusters {
                break;
            }
            let base = self.cluster_to_sector(current);
            let remaining = entry.size as usize - data.len();
            let take = remaining.min(cluster_bytes);
            let mut copied = 0;
            for i in 0..self.sectors_per_cluster as u64 {
                if copied >= take {
                    break;
                }
                read_sector(&self.device, base + i, &mut sector)?;
                let n = (take - copied).min(SECTOR_SIZE);
                data.extend_from_slice(&sector[..n]);
                copied += n;
            }
            cluster = self.fat_entry(current)?;
        }
        if data.len() < entry.size as usize {
            crate::log_warn!(
                "[fat] chain for '{}' ended short: {}/{} bytes",
                entry.name,
                data.len(),
                entry.size
            );
        }
        Ok(data)
    }
}

fn read_sector(device: &FileHandle, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()> {
    let read = device.read(&mut [&mut buf[..]], sector * SECTOR_SIZE as u64)?;
    if read != SECTOR_SIZE {
        return Err(ErrorCode::IoError);
    }
    Ok(())
}

/// Decode one directory sector; false when the terminating entry was seen.
fn parse_dir_sector(sector: &[u8], entries: &mut Vec<FatDirEntry>) -> bool {
    for chunk in sector.chunks_exact(32) {
        match chunk[0] {
            0x00 => return false, // end of directory
            0xE5 => continue,     // deleted
            _ => {}
        }
        let attributes = chunk[11];
        if attributes & attr::LONG_NAME == attr::LONG_NAME {
            continue; // LFN fragment
        }
        if attributes & attr::VOLUME_ID != 0 {
            continue;
        }
        let name = decode_83_name(&chunk[0..11]);
        if name == "." || name == ".." {
            continue;
        }
        let cluster_high = u16::from_le_bytes([chunk[20], chunk[21]]) as u32;
        let cluster_low = u16::from_le_bytes([chunk[26], chunk[27]]) as u32;
        entries.push(FatDirEntry {
            name,
            size: u32::from_le_bytes(chunk[28..32].try_into().unwrap()),
            is_dir: attributes & attr::DIRECTORY != 0,
            attributes,
            first_cluster: (cluster_high << 16) | cluster_low,
        });
    }
    true
}

fn decode_83_name(raw: &[u8]) -> String {
    let base: Vec<u8> = raw[0..8].iter().copied().take_while(|&b| b != b' ').collect();
    let ext: Vec<u8> = raw[8..11].iter().copied().take_while(|&b| b != b' ').collect();
    let mut name = String::new();
    for &byte in &base {
        name.push(byte as char);
    }
    if !ext.is_empty() {
        name.push('.');
        for &byte in &ext {
            name.push(byte as char);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{self, DeviceInode, DeviceOps};
    use alloc::sync::Arc;
    use alloc::vec;

    /// RAM-backed block device for filesystem tests.
    struct RamDisk {
        data: spin::Mutex<Vec<u8>>,
    }

    impl DeviceOps for RamDisk {
        fn open(&self, _inode: &Arc<DeviceInode>) -> KResult<()> {
            Ok(())
        }

        fn read_at(
            &self,
            _inode: Option<&Arc<DeviceInode>>,
            segments: &mut [&mut [u8]],
            position: u64,
        ) -> KResult<usize> {
            let data = self.data.lock();
            let mut offset = position as usize;
            let mut total = 0;
            for segment in segments.iter_mut() {
                let end = (offset + segment.len()).min(data.len());
                if offset >= end {
                    break;
                }
                let n = end - offset;
                segment[..n].copy_from_slice(&data[offset..end]);
                offset += n;
                total += n;
            }
            Ok(total)
        }

        fn write_at(
            &self,
            _inode: Option<&Arc<DeviceInode>>,
            segments: &[&[u8]],
            position: u64,
        ) -> KResult<usize> {
            let mut data = self.data.lock();
            let mut offset = position as usize;
            let mut total = 0;
            for segment in segments.iter() {
                data[offset..offset + segment.len()].copy_from_slice(segment);
                offset += segment.len();
                total += segment.len();
            }
            Ok(total)
        }
    }

    const TOTAL_SECTORS: u32 = 8192;
    const FAT_SECTORS: u32 = 32;
    const ROOT_ENTRIES: u32 = 32;

    /// Hand-built FAT16 image: HELLO.TXT spanning two clusters plus SUB/A.TXT.
    fn build_fat16_image() -> Vec<u8> {
        let mut image = vec![0u8; TOTAL_SECTORS as usize * SECTOR_SIZE];

        // BPB
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = 1; // sectors per cluster
        image[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        image[16] = 1; // one FAT
        image[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
        image[19..21].copy_from_slice(&(TOTAL_SECTORS as u16).to_le_bytes());
        image[22..24].copy_from_slice(&(FAT_SECTORS as u16).to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;

        let fat_start = SECTOR_SIZE; // sector 1
        let set_fat = |image: &mut Vec<u8>, cluster: usize, value: u16| {
            let offset = fat_start + cluster * 2;
            image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        };
        set_fat(&mut image, 0, 0xFFF8);
        set_fat(&mut image, 1, 0xFFFF);
        set_fat(&mut image, 2, 3); // HELLO.TXT: 2 -> 3
        set_fat(&mut image, 3, 0xFFFF);
        set_fat(&mut image, 4, 0xFFFF); // SUB directory
        set_fat(&mut image, 5, 0xFFFF); // A.TXT

        let root_start = (1 + FAT_SECTORS) as usize * SECTOR_SIZE; // sector 33
        let write_entry = |image: &mut Vec<u8>,
                           offset: usize,
                           name: &[u8; 11],
                           attributes: u8,
                           cluster: u16,
                           size: u32| {
            image[offset..offset + 11].copy_from_slice(name);
            image[offset + 11] = attributes;
            image[offset + 26..offset + 28].copy_from_slice(&cluster.to_le_bytes());
            image[offset + 28..offset + 32].copy_from_slice(&size.to_le_bytes());
        };
        write_entry(&mut image, root_start, b"HELLO   TXT", 0x20, 2, 600);
        write_entry(&mut image, root_start + 32, b"SUB        ", attr::DIRECTORY, 4, 0);

        // Data area: sector 35 = cluster 2
        let data_start = (1 + FAT_SECTORS + 2) as usize * SECTOR_SIZE;
        for i in 0..600usize {
            image[data_start + i] = (i % 251) as u8;
        }
        // Cluster 4: SUB directory with A.TXT
        let sub_start = data_start + 2 * SECTOR_SIZE;
        write_entry(&mut image, sub_start, b"A       TXT", 0x20, 5, 5);
        // Cluster 5: content of A.TXT
        let a_start = data_start + 3 * SECTOR_SIZE;
        image[a_start..a_start + 5].copy_from_slice(b"abcde");

        image
    }

    fn mount_image(path: &str) -> FatVolume {
        let image = build_fat16_image();
        let size = image.len() as u64;
        let disk = Arc::new(RamDisk { data: spin::Mutex::new(image) });
        let inode = DeviceInode::new(disk);
        inode.span.lock().size = size;
        vfs::register_device(path, inode).unwrap();
        FatVolume::mount(vfs::open(path).unwrap()).unwrap()
    }

    #[test]
    fn mounts_and_lists_root() {
        let volume = mount_image("/dev/test-fat-root");
        let entries = volume.root_entries().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["HELLO.TXT", "SUB"]);
        assert!(!entries[0].is_dir);
        assert!(entries[1].is_dir);
    }

    #[test]
    fn reads_multi_cluster_file() {
        let volume = mount_image("/dev/test-fat-read");
        let entry = volume.lookup("HELLO.TXT").unwrap();
        assert_eq!(entry.size, 600);
        let data = volume.read_file(&entry).unwrap();
        assert_eq!(data.len(), 600);
        for (i, &byte) in data.iter().enumerate() {
            assert_eq!(byte, (i % 251) as u8);
        }
    }

    #[test]
    fn walks_subdirectories() {
        let volume = mount_image("/dev/test-fat-sub");
        let entry = volume.lookup("SUB/A.TXT").unwrap();
        let data = volume.read_file(&entry).unwrap();
        assert_eq!(&data, b"abcde");

        // Case-insensitive lookup, missing files surface NotFound.
        assert!(volume.lookup("sub/a.txt").is_ok());
        assert_eq!(volume.lookup("SUB/B.TXT").unwrap_err(), ErrorCode::NotFound);
    }
}
