//! Virtual File System
//!
//! Device inodes registered under `/dev`, a unified error type, and the
//! device-control surface for block devices. Filesystem volumes (FAT) mount
//! on top of the same block-device contract.

pub mod fat;
pub mod partition;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use spin::{Mutex, RwLock};

/// Kernel-wide error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoDevice,
    InvalidArg,
    IoError,
    Busy,
    NotImplemented,
    NotFound,
    AlreadyExists,
    TimedOut,
    WouldBlock,
}

pub type KResult<T> = Result<T, ErrorCode>;

/// Registry handle for a published device node
pub type NodeHandle = i32;

pub const INVALID_NODE_HANDLE: NodeHandle = -1;

// ============================================================================
// Device geometry & device-control requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceGeometry {
    pub bytes_per_sector: u32,
    pub sector_count: u64,
    pub read_only: bool,
    pub removable: bool,
}

impl DeviceGeometry {
    pub const ENCODED_SIZE: usize = 14;

    pub fn encode(&self, out: &mut [u8]) -> KResult<()> {
        if out.len() < Self::ENCODED_SIZE {
            return Err(ErrorCode::InvalidArg);
        }
        out[0..4].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        out[4..12].copy_from_slice(&self.sector_count.to_le_bytes());
        out[12] = self.read_only as u8;
        out[13] = self.removable as u8;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> KResult<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(ErrorCode::InvalidArg);
        }
        Ok(Self {
            bytes_per_sector: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            sector_count: u64::from_le_bytes(data[4..12].try_into().unwrap()),
            read_only: data[12] != 0,
            removable: data[13] != 0,
        })
    }
}

/// Device-control request codes
pub mod devctl {
    pub const GET_DEVICE_GEOMETRY: u32 = 1;
    pub const REREAD_PARTITION_TABLE: u32 = 2;

    // SD/MMC specific
    pub const SDIO_READ_DIRECT: u32 = 0x0100;
    pub const SDIO_WRITE_DIRECT: u32 = 0x0101;
    pub const SDIO_READ_EXTENDED: u32 = 0x0102;
    pub const SDIO_WRITE_EXTENDED: u32 = 0x0103;
}

/// Fixed-layout argument records for the SDIO device-control requests.
/// Encoded little-endian: `{function: u8, increment_addr: u8, addr: u32}`
/// with the write payload (extended) or data byte (direct) appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdioArgs {
    pub function: u8,
    pub increment_addr: u8,
    pub addr: u32,
}

impl SdioArgs {
    pub const ENCODED_SIZE: usize = 6;

    pub fn encode(&self, out: &mut [u8]) -> KResult<()> {
        if out.len() < Self::ENCODED_SIZE {
            return Err(ErrorCode::InvalidArg);
        }
        out[0] = self.function;
        out[1] = self.increment_addr;
        out[2..6].copy_from_slice(&self.addr.to_le_bytes());
        Ok(())
    }

    pub fn decode(data: &[u8]) -> KResult<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(ErrorCode::InvalidArg);
        }
        Ok(Self {
            function: data[0],
            increment_addr: data[1],
            addr: u32::from_le_bytes(data[2..6].try_into().unwrap()),
        })
    }
}

// ============================================================================
// Device inodes
// ============================================================================

/// Mutable span of a device inode within the raw medium
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeSpan {
    /// Start offset in bytes
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    /// MBR partition type byte (0 for the raw node)
    pub partition_type: u8,
}

/// A device inode. The raw inode spans the whole medium; partition inodes
/// are substrings, re-spanned in place when the partition table is re-read.
pub struct DeviceInode {
    pub ops: Arc<dyn DeviceOps>,
    pub span: Mutex<InodeSpan>,
    pub open_count: AtomicU32,
    pub node_handle: AtomicI32,
}

impl DeviceInode {
    pub fn new(ops: Arc<dyn DeviceOps>) -> Arc<Self> {
        Arc::new(Self {
            ops,
            span: Mutex::new(InodeSpan::default()),
            open_count: AtomicU32::new(0),
            node_handle: AtomicI32::new(INVALID_NODE_HANDLE),
        })
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn node_handle(&self) -> NodeHandle {
        self.node_handle.load(Ordering::Acquire)
    }

    pub fn set_node_handle(&self, handle: NodeHandle) {
        self.node_handle.store(handle, Ordering::Release);
    }
}

/// Driver-side operations behind a device inode
pub trait DeviceOps: Send + Sync {
    /// Open hook; reject when the medium is not usable.
    fn open(&self, inode: &Arc<DeviceInode>) -> KResult<()>;

    fn close(&self, _inode: &Arc<DeviceInode>) {}

    /// Scatter read. `inode` is `None` for internal whole-medium access.
    fn read_at(
        &self,
        inode: Option<&Arc<DeviceInode>>,
        segments: &mut [&mut [u8]],
        position: u64,
    ) -> KResult<usize>;

    /// Gather write.
    fn write_at(
        &self,
        inode: Option<&Arc<DeviceInode>>,
        segments: &[&[u8]],
        position: u64,
    ) -> KResult<usize>;

    fn device_control(&self, request: u32, in_data: &[u8], out_data: &mut [u8]) -> KResult<()> {
        let (_, _, _) = (request, in_data, out_data);
        Err(ErrorCode::NotImplemented)
    }
}

/// An open file over a device inode. Dropping it releases the open count.
pub struct FileHandle {
    inode: Arc<DeviceInode>,
}

impl FileHandle {
    pub fn inode(&self) -> &Arc<DeviceInode> {
        &self.inode
    }

    pub fn read(&self, segments: &mut [&mut [u8]], position: u64) -> KResult<usize> {
        self.inode.ops.read_at(Some(&self.inode), segments, position)
    }

    pub fn write(&self, segments: &[&[u8]], position: u64) -> KResult<usize> {
        self.inode.ops.write_at(Some(&self.inode), segments, position)
    }

    pub fn device_control(&self, request: u32, in_data: &[u8], out_data: &mut [u8]) -> KResult<()> {
        self.inode.ops.device_control(request, in_data, out_data)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.inode.open_count.fetch_sub(1, Ordering::AcqRel);
        self.inode.ops.close(&self.inode);
    }
}

// ============================================================================
// Device registry (/dev)
// ============================================================================

struct Registry {
    nodes: BTreeMap<NodeHandle, (String, Arc<DeviceInode>)>,
    next_handle: NodeHandle,
}

impl Registry {
    const fn new() -> Self {
        Self { nodes: BTreeMap::new(), next_handle: 1 }
    }
}

static REGISTRY: RwLock<Registry> = RwLock::new(Registry::new());

/// Publish a device inode under a `/dev` path.
pub fn register_device(path: &str, inode: Arc<DeviceInode>) -> KResult<NodeHandle> {
    let mut registry = REGISTRY.write();
    if registry.nodes.values().any(|(p, _)| p == path) {
        return Err(ErrorCode::AlreadyExists);
    }
    let handle = registry.next_handle;
    registry.next_handle += 1;
    registry.nodes.insert(handle, (String::from(path), inode.clone()));
    inode.set_node_handle(handle);
    crate::log_debug!("[vfs] registered {}", path);
    Ok(handle)
}

pub fn rename_device(handle: NodeHandle, new_path: &str) -> KResult<()> {
    let mut registry = REGISTRY.write();
    if registry
        .nodes
        .iter()
        .any(|(h, (p, _))| *h != handle && p == new_path)
    {
        return Err(ErrorCode::AlreadyExists);
    }
    match registry.nodes.get_mut(&handle) {
        Some((path, _)) => {
            *path = String::from(new_path);
            Ok(())
        }
        None => Err(ErrorCode::NotFound),
    }
}

pub fn remove_device(handle: NodeHandle) -> KResult<()> {
    let mut registry = REGISTRY.write();
    match registry.nodes.remove(&handle) {
        Some((path, inode)) => {
            inode.set_node_handle(INVALID_NODE_HANDLE);
            crate::log_debug!("[vfs] removed {}", path);
            Ok(())
        }
        None => Err(ErrorCode::NotFound),
    }
}

/// Open a device by `/dev` path.
pub fn open(path: &str) -> KResult<FileHandle> {
    let inode = {
        let registry = REGISTRY.read();
        registry
            .nodes
            .values()
            .find(|(p, _)| p == path)
            .map(|(_, inode)| inode.clone())
            .ok_or(ErrorCode::NotFound)?
    };
    inode.ops.open(&inode)?;
    inode.open_count.fetch_add(1, Ordering::AcqRel);
    Ok(FileHandle { inode })
}

/// Path a handle is currently published under.
pub fn device_path(handle: NodeHandle) -> Option<String> {
    REGISTRY.read().nodes.get(&handle).map(|(p, _)| p.clone())
}

/// Look up a device path without opening it.
pub fn lookup(path: &str) -> Option<Arc<DeviceInode>> {
    REGISTRY
        .read()
        .nodes
        .values()
        .find(|(p, _)| p == path)
        .map(|(_, inode)| inode.clone())
}

#[cfg(test)]
pub fn clear_registry_for_test() {
    REGISTRY.write().nodes.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_round_trip() {
        let geometry = DeviceGeometry {
            bytes_per_sector: 512,
            sector_count: 0x0001_0000_0000,
            read_only: false,
            removable: true,
        };
        let mut buffer = [0u8; DeviceGeometry::ENCODED_SIZE];
        geometry.encode(&mut buffer).unwrap();
        assert_eq!(DeviceGeometry::decode(&buffer).unwrap(), geometry);
    }

    #[test]
    fn sdio_args_round_trip() {
        let args = SdioArgs { function: 1, increment_addr: 1, addr: 0x10F0 };
        let mut buffer = [0u8; SdioArgs::ENCODED_SIZE];
        args.encode(&mut buffer).unwrap();
        assert_eq!(SdioArgs::decode(&buffer).unwrap(), args);
        assert_eq!(SdioArgs::decode(&buffer[..3]), Err(ErrorCode::InvalidArg));
    }
}
