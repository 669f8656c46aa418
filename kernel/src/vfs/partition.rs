//! Partition table decoder
//!
//! MBR with EBR chains (extended partitions). The decoder reads through a
//! caller-supplied sector reader so the block driver can route it through
//! its cache-aligned scratch buffer.

use alloc::vec::Vec;

use super::{DeviceGeometry, ErrorCode, KResult};

/// MBR signature (last 2 bytes of sector 0)
const MBR_SIGNATURE: u16 = 0xAA55;

/// Partition types marking an extended container
const TYPE_EXTENDED_CHS: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0F;

/// Upper bound on EBR chain length; anything longer is a corrupt table.
const MAX_LOGICAL_PARTITIONS: usize = 32;

/// One decoded partition, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDesc {
    /// Starting byte offset within the medium
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    /// MBR type byte
    pub part_type: u8,
}

/// Raw 16-byte MBR/EBR partition entry
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    part_type: u8,
    start_lba: u32,
    size_sectors: u32,
}

fn parse_entry(sector: &[u8], index: usize) -> RawEntry {
    let offset = 446 + index * 16;
    RawEntry {
        part_type: sector[offset + 4],
        start_lba: u32::from_le_bytes(sector[offset + 8..offset + 12].try_into().unwrap()),
        size_sectors: u32::from_le_bytes(sector[offset + 12..offset + 16].try_into().unwrap()),
    }
}

fn has_signature(sector: &[u8]) -> bool {
    u16::from_le_bytes([sector[510], sector[511]]) == MBR_SIGNATURE
}

/// Decode the partition table of a medium.
///
/// `buffer` must hold at least one sector and is clobbered. `read` reads a
/// whole sector given a byte offset. Entries with type 0 or size 0 are
/// skipped. A medium without an MBR signature decodes to `Some` empty list.
///
/// I/O errors are caught here and come back as `Ok(None)`: the table could
/// not be read, so the caller must leave whatever partitions it currently
/// publishes untouched.
pub fn decode_disk_partitions(
    buffer: &mut [u8],
    geometry: &DeviceGeometry,
    read: &mut dyn FnMut(u64, &mut [u8]) -> KResult<()>,
) -> KResult<Option<Vec<PartitionDesc>>> {
    let sector_size = geometry.bytes_per_sector as u64;
    if buffer.len() < sector_size as usize {
        return Err(ErrorCode::InvalidArg);
    }
    let sector = &mut buffer[..sector_size as usize];

    if let Err(error) = read(0, sector) {
        crate::log_warn!("[vfs] partition table unreadable: {:?}", error);
        return Ok(None);
    }
    if !has_signature(sector) {
        crate::log!("[vfs] no MBR signature, treating medium as unpartitioned");
        return Ok(Some(Vec::new()));
    }

    let media_size = geometry.sector_count * sector_size;
    let mut partitions = Vec::new();
    let mut extended_start: Option<u64> = None;

    for i in 0..4 {
        let entry = parse_entry(sector, i);
        if entry.part_type == 0 || entry.size_sectors == 0 {
            continue;
        }
        if entry.part_type == TYPE_EXTENDED_CHS || entry.part_type == TYPE_EXTENDED_LBA {
            if extended_start.is_none() {
                extended_start = Some(entry.start_lba as u64 * sector_size);
            }
            continue;
        }
        push_checked(&mut partitions, entry, 0, sector_size, media_size);
    }

    // Walk the EBR chain of the first extended container.
    if let Some(container) = extended_start {
        let mut ebr_offset = container;
        for _ in 0..MAX_LOGICAL_PARTITIONS {
            if let Err(error) = read(ebr_offset, sector) {
                crate::log_warn!("[vfs] EBR at {} unreadable: {:?}", ebr_offset, error);
                return Ok(None);
            }
            if !has_signature(sector) {
                break;
            }
            let logical = parse_entry(sector, 0);
            if logical.part_type != 0 && logical.size_sectors != 0 {
                push_checked(&mut partitions, logical, ebr_offset, sector_size, media_size);
            }
            let next = parse_entry(sector, 1);
            if next.part_type == 0 || next.size_sectors == 0 {
                break;
            }
            ebr_offset = container + next.start_lba as u64 * sector_size;
        }
    }

    Ok(Some(partitions))
}

fn push_checked(
    partitions: &mut Vec<PartitionDesc>,
    entry: RawEntry,
    base: u64,
    sector_size: u64,
    media_size: u64,
) {
    let start = base + entry.start_lba as u64 * sector_size;
    let size = entry.size_sectors as u64 * sector_size;
    if media_size != 0 && start + size > media_size {
        crate::log_warn!(
            "[vfs] partition {:#04x} at {} exceeds medium size, ignored",
            entry.part_type,
            start
        );
        return;
    }
    partitions.push(PartitionDesc { start, size, part_type: entry.part_type });
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn entry_bytes(part_type: u8, start_lba: u32, size: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[4] = part_type;
        e[8..12].copy_from_slice(&start_lba.to_le_bytes());
        e[12..16].copy_from_slice(&size.to_le_bytes());
        e
    }

    fn make_sector(entries: &[[u8; 16]]) -> [u8; 512] {
        let mut sector = [0u8; 512];
        for (i, e) in entries.iter().enumerate() {
            sector[446 + i * 16..446 + (i + 1) * 16].copy_from_slice(e);
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn geometry(sectors: u64) -> DeviceGeometry {
        DeviceGeometry {
            bytes_per_sector: 512,
            sector_count: sectors,
            read_only: false,
            removable: true,
        }
    }

    #[test]
    fn decodes_primary_partitions() {
        let mbr = make_sector(&[
            entry_bytes(0x0C, 2048, 100_000),
            entry_bytes(0x83, 110_000, 50_000),
        ]);
        let mut buffer = [0u8; 512];
        let parts = decode_disk_partitions(
            &mut buffer,
            &geometry(1_000_000),
            &mut |offset, out| {
                assert_eq!(offset, 0);
                out.copy_from_slice(&mbr);
                Ok(())
            },
        )
        .unwrap()
        .expect("table decoded");
        assert_eq!(
            parts,
            vec![
                PartitionDesc { start: 2048 * 512, size: 100_000 * 512, part_type: 0x0C },
                PartitionDesc { start: 110_000 * 512, size: 50_000 * 512, part_type: 0x83 },
            ]
        );
    }

    #[test]
    fn skips_empty_and_missing_signature() {
        let mut sector0 = make_sector(&[entry_bytes(0, 0, 0)]);
        let mut buffer = [0u8; 512];
        let parts = decode_disk_partitions(&mut buffer, &geometry(1000), &mut |_, out| {
            out.copy_from_slice(&sector0);
            Ok(())
        })
        .unwrap()
        .expect("table decoded");
        assert!(parts.is_empty());

        sector0[510] = 0;
        let parts = decode_disk_partitions(&mut buffer, &geometry(1000), &mut |_, out| {
            out.copy_from_slice(&sector0);
            Ok(())
        })
        .unwrap()
        .expect("table decoded");
        assert!(parts.is_empty());
    }

    #[test]
    fn walks_ebr_chain() {
        // Primary FAT + extended container at LBA 1000 holding two logicals.
        let mbr = make_sector(&[
            entry_bytes(0x0C, 100, 800),
            entry_bytes(0x05, 1000, 4000),
        ]);
        let ebr1 = make_sector(&[
            entry_bytes(0x83, 8, 992),      // logical, relative to this EBR
            entry_bytes(0x05, 2000, 2000),  // next EBR, relative to container
        ]);
        let ebr2 = make_sector(&[entry_bytes(0x83, 8, 1992)]);

        let mut buffer = [0u8; 512];
        let parts = decode_disk_partitions(&mut buffer, &geometry(10_000), &mut |offset, out| {
            match offset {
                0 => out.copy_from_slice(&mbr),
                o if o == 1000 * 512 => out.copy_from_slice(&ebr1),
                o if o == 3000 * 512 => out.copy_from_slice(&ebr2),
                other => panic!("unexpected read at {}", other),
            }
            Ok(())
        })
        .unwrap()
        .expect("table decoded");

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].start, (1000 + 8) * 512);
        assert_eq!(parts[2].start, (3000 + 8) * 512);
    }

    #[test]
    fn io_error_yields_no_table() {
        let mut buffer = [0u8; 512];
        let result = decode_disk_partitions(&mut buffer, &geometry(1000), &mut |_, _| {
            Err(ErrorCode::IoError)
        });
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn ebr_io_error_yields_no_table() {
        // Sector 0 reads fine; the extended container does not.
        let mbr = make_sector(&[entry_bytes(0x05, 1000, 4000)]);
        let mut buffer = [0u8; 512];
        let result = decode_disk_partitions(&mut buffer, &geometry(10_000), &mut |offset, out| {
            if offset == 0 {
                out.copy_from_slice(&mbr);
                Ok(())
            } else {
                Err(ErrorCode::IoError)
            }
        });
        assert_eq!(result.unwrap(), None);
    }
}
