//! Page-aligned buffers, their registration, and the send/receive layout inside one region.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::fabric::{
    AccessFlags, Fabric, ProtectionDomain, QpType, RecvRequest, RegisteredMemory, Sge, GRH_LEN,
};

/// Returns the system page size, falling back to 4 KiB if it cannot be determined.
pub fn page_size() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A zeroed, page-aligned heap buffer.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// the buffer is plain memory; all access goes through raw copies
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `len` zeroed bytes aligned to the page size.
    ///
    /// # Errors
    ///
    ///  - `InvalidInput`: `len` is zero or too large for a layout.
    ///  - `OutOfMemory`: the allocator returned null.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot allocate an empty buffer",
            ));
        }
        let layout = Layout::from_size_align(len, page_size())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "couldn't allocate work buf")
        })?;
        Ok(Self { ptr, layout })
    }

    /// Base pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; empty buffers cannot be allocated.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Copies `data` in at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len())
        };
    }

    /// Copies `out.len()` bytes out from `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len(), "read out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len())
        };
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Bytes needed for a receive area and a send area of `message_size` each.
///
/// UD reserves a GRH ahead of each payload.
pub fn buffer_len(message_size: usize, qp_type: QpType) -> usize {
    match qp_type {
        QpType::Ud => 2 * (message_size + GRH_LEN),
        QpType::Rc | QpType::Uc => 2 * message_size,
    }
}

/// A registered region, together with the buffer it covers.
pub struct MemoryRegion<F: Fabric> {
    mr: F::Mr,
}

impl<F: Fabric> MemoryRegion<F> {
    /// Base address.
    pub fn addr(&self) -> u64 {
        self.mr.addr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.mr.len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.mr.is_empty()
    }

    /// Local key.
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    /// Remote key.
    pub fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    /// An SGE covering `len` bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in the region.
    pub fn sge(&self, offset: usize, len: usize) -> Sge {
        assert!(offset + len <= self.len(), "SGE out of bounds");
        Sge {
            addr: self.addr() + offset as u64,
            length: len as u32,
            lkey: self.lkey(),
        }
    }

    /// Copies `data` into the region at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.mr.write_at(offset, data)
    }

    /// Copies bytes out of the region at `offset`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        self.mr.read_at(offset, out)
    }
}

/// Allocates a page-aligned buffer of `len` bytes and registers it on `pd`.
///
/// Local and remote write are always granted; `extra` adds to that (e.g. remote read).
pub fn register_buffer<F: Fabric>(
    pd: &F::Pd,
    len: usize,
    extra: AccessFlags,
) -> Result<MemoryRegion<F>> {
    let buf = AlignedBuffer::new(len).map_err(|source| Error::RegistrationFailed { len, source })?;
    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | extra;
    let mr = pd
        .register(buf, access)
        .map_err(|source| Error::RegistrationFailed { len, source })?;
    log::debug!("registered {} bytes at {:#x}, lkey {:#x}", len, mr.addr(), mr.lkey());
    Ok(MemoryRegion { mr })
}

/// Where the receive area, the send area and the stamped byte sit inside one region.
///
/// The receive area starts at offset 0; the send area follows it, so the device writing an
/// inbound message never overlaps the bytes being sent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferLayout {
    capacity: usize,
    qp_type: QpType,
}

impl BufferLayout {
    /// Layout for messages of up to `capacity` bytes.
    pub fn new(capacity: usize, qp_type: QpType) -> Self {
        Self { capacity, qp_type }
    }

    /// Total region length.
    pub fn len(&self) -> usize {
        buffer_len(self.capacity, self.qp_type)
    }

    /// Always false for a valid layout.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grh(&self) -> usize {
        match self.qp_type {
            QpType::Ud => GRH_LEN,
            _ => 0,
        }
    }

    /// Largest message the layout can send or receive.
    pub fn payload_len(&self) -> usize {
        self.capacity
    }

    /// Length of the receive area, including the GRH for UD.
    pub fn recv_len(&self) -> usize {
        self.capacity + self.grh()
    }

    /// Offset of the first payload byte to send.
    pub fn send_offset(&self) -> usize {
        self.recv_len() + self.grh()
    }

    /// Offset of the byte stamped with the iteration number for a message of `size` bytes.
    pub fn stamp_offset(&self, size: usize) -> usize {
        self.send_offset() + size.max(1) - 1
    }

    /// The address advertised to the peer.
    pub fn remote_addr(&self, base: u64) -> u64 {
        base + self.capacity as u64
    }

    /// SGE for sending `size` bytes.
    pub fn send_sge<F: Fabric>(&self, mr: &MemoryRegion<F>, size: usize) -> Sge {
        mr.sge(self.send_offset(), size)
    }

    /// Receive request covering the whole receive area.
    pub fn recv_request<F: Fabric>(&self, mr: &MemoryRegion<F>, wr_id: u64) -> RecvRequest {
        RecvRequest {
            wr_id,
            sge: mr.sge(0, self.recv_len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_page_aligned_and_zeroed() {
        let buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        let mut out = [1u8; 100];
        buf.read_at(0, &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(AlignedBuffer::new(0).is_err());
    }

    #[test]
    fn two_region_lengths() {
        assert_eq!(buffer_len(2, QpType::Rc), 4);
        assert_eq!(buffer_len(2, QpType::Uc), 4);
        assert_eq!(buffer_len(2, QpType::Ud), 84);
    }

    #[test]
    fn ud_layout_reserves_grh_ahead_of_both_areas() {
        let l = BufferLayout::new(64, QpType::Ud);
        assert_eq!(l.payload_len(), 64);
        assert_eq!(l.recv_len(), 104);
        assert_eq!(l.send_offset(), 144);
        assert_eq!(l.stamp_offset(64), 207);
        assert_eq!(l.len(), 208);
        assert_eq!(l.remote_addr(0x1000), 0x1040);
    }

    #[test]
    fn rc_layout_sends_from_the_upper_half() {
        let l = BufferLayout::new(8, QpType::Rc);
        assert_eq!(l.recv_len(), 8);
        assert_eq!(l.send_offset(), 8);
        assert_eq!(l.stamp_offset(2), 9);
        assert!(l.stamp_offset(8) < l.len());
    }
}
