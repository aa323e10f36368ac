//! MSC block-device binding
//!
//! Every block operation validates the request completely before a transfer
//! is issued, then issues exactly one asynchronous transfer and waits for it
//! through the blocking helper. A logical unit has at most one transfer in
//! flight; a transfer that times out keeps the unit busy until the controller
//! finally completes it.

use crate::blocking::wait_while;
use crate::controller::TransferTag;
use crate::error::{Result, TransferFailure, UsbhError, map_transfer_status};
use crate::host::UsbHost;
use crate::pool::MscHandle;
use common::usb_types::{DeviceAddress, TransferStatus};
use tracing::{debug, trace};

/// Alignment the controller's DMA engine needs for single-block transfers
const DMA_ALIGN: usize = 4;

/// ENODEV, as returned by a failed `Init`
const INIT_NO_DEVICE: u32 = 19;

/// Block-device control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockIoctl {
    Init = 1,
    Deinit = 2,
    Sync = 3,
    BlockCount = 4,
    BlockSize = 5,
    BlockErase = 6,
}

impl BlockIoctl {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(BlockIoctl::Init),
            2 => Some(BlockIoctl::Deinit),
            3 => Some(BlockIoctl::Sync),
            4 => Some(BlockIoctl::BlockCount),
            5 => Some(BlockIoctl::BlockSize),
            6 => Some(BlockIoctl::BlockErase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// A validated block request
#[derive(Debug, Clone, Copy)]
struct Request {
    slot: usize,
    addr: DeviceAddress,
    lun: u8,
    lba: u32,
    count: u16,
    /// Start of the transferred range within the caller's buffer
    start: usize,
    len: usize,
}

/// A bound mass-storage logical unit
pub struct MscPort<'a> {
    host: &'a mut UsbHost,
    handle: MscHandle,
}

impl<'a> MscPort<'a> {
    pub(crate) fn new(host: &'a mut UsbHost, handle: MscHandle) -> Self {
        Self { host, handle }
    }

    pub fn handle(&self) -> MscHandle {
        self.handle
    }

    fn slot_index(&self) -> Result<usize> {
        self.host.ensure_active()?;
        self.host
            .pool()
            .msc_active(self.handle)
            .ok_or(UsbhError::NoDevice)
    }

    pub fn is_connected(&self) -> bool {
        self.slot_index().is_ok()
    }

    pub fn block_count(&self) -> Result<u32> {
        let i = self.slot_index()?;
        Ok(self.host.pool().msc[i].block_count)
    }

    pub fn block_size(&self) -> Result<u32> {
        let i = self.slot_index()?;
        Ok(self.host.pool().msc[i].block_size)
    }

    pub fn is_readonly(&self) -> Result<bool> {
        let i = self.slot_index()?;
        Ok(self.host.pool().msc[i].read_only)
    }

    /// Logical unit number on the device
    pub fn lun(&self) -> Result<u8> {
        let i = self.slot_index()?;
        Ok(self.host.pool().msc[i].lun)
    }

    /// Whether a transfer is still outstanding
    pub fn is_busy(&self) -> bool {
        self.slot_index()
            .map(|i| self.host.pool().msc[i].operation_pending)
            .unwrap_or(false)
    }

    /// Read blocks starting at `block`
    ///
    /// Without an offset as many whole blocks as fit in `buf` are read,
    /// clamped to the end of the device. With an offset exactly one block is
    /// read into `buf[offset..offset + block_size]`, which must be 4-byte
    /// aligned. Returns the number of blocks read.
    pub fn readblocks(&mut self, block: u32, buf: &mut [u8], offset: Option<usize>) -> Result<usize> {
        let request = self.validate(Direction::Read, block, buf.len(), buf.as_ptr() as usize, offset)?;
        self.issue(Direction::Read, &request, None)?;
        self.wait_complete()?;
        self.finish(&request, Some(&mut buf[request.start..request.start + request.len]))
    }

    /// Write blocks starting at `block`; sizing rules as for [`readblocks`](Self::readblocks)
    pub fn writeblocks(&mut self, block: u32, buf: &[u8], offset: Option<usize>) -> Result<usize> {
        let request = self.validate(Direction::Write, block, buf.len(), buf.as_ptr() as usize, offset)?;
        self.issue(
            Direction::Write,
            &request,
            Some(&buf[request.start..request.start + request.len]),
        )?;
        self.wait_complete()?;
        self.finish(&request, None)
    }

    #[cfg(feature = "async")]
    pub async fn readblocks_async(
        &mut self,
        block: u32,
        buf: &mut [u8],
        offset: Option<usize>,
    ) -> Result<usize> {
        let request = self.validate(Direction::Read, block, buf.len(), buf.as_ptr() as usize, offset)?;
        self.issue(Direction::Read, &request, None)?;
        self.wait_complete_async().await?;
        self.finish(&request, Some(&mut buf[request.start..request.start + request.len]))
    }

    #[cfg(feature = "async")]
    pub async fn writeblocks_async(
        &mut self,
        block: u32,
        buf: &[u8],
        offset: Option<usize>,
    ) -> Result<usize> {
        let request = self.validate(Direction::Write, block, buf.len(), buf.as_ptr() as usize, offset)?;
        self.issue(
            Direction::Write,
            &request,
            Some(&buf[request.start..request.start + request.len]),
        )?;
        self.wait_complete_async().await?;
        self.finish(&request, None)
    }

    /// Block-device control; `Init` reports 0 when the unit is usable
    pub fn ioctl(&mut self, op: BlockIoctl) -> Result<u32> {
        match op {
            BlockIoctl::Init => Ok(if self.is_connected() { 0 } else { INIT_NO_DEVICE }),
            BlockIoctl::Deinit | BlockIoctl::Sync => Ok(0),
            // Not available through this interface; accepted without effect.
            BlockIoctl::BlockErase => Ok(0),
            BlockIoctl::BlockCount => self.block_count(),
            BlockIoctl::BlockSize => self.block_size(),
        }
    }

    /// [`ioctl`](Self::ioctl) by numeric operation code
    pub fn ioctl_code(&mut self, code: u32) -> Result<u32> {
        let op = BlockIoctl::from_code(code).ok_or(UsbhError::InvalidArgument("unknown block ioctl"))?;
        self.ioctl(op)
    }

    fn validate(
        &self,
        direction: Direction,
        block: u32,
        buf_len: usize,
        buf_addr: usize,
        offset: Option<usize>,
    ) -> Result<Request> {
        let i = self.slot_index()?;
        let slot = &self.host.pool().msc[i];

        if direction == Direction::Write && slot.read_only {
            return Err(UsbhError::ReadOnly);
        }
        if slot.operation_pending {
            return Err(UsbhError::Busy);
        }
        if block >= slot.block_count {
            return Err(UsbhError::OutOfRange {
                block,
                count: slot.block_count,
            });
        }

        let block_size = slot.block_size as usize;
        let (start, count) = match offset {
            None => {
                let whole = buf_len / block_size;
                if whole == 0 {
                    return Err(UsbhError::BufferTooSmall {
                        needed: block_size,
                        actual: buf_len,
                    });
                }
                let remaining = (slot.block_count - block) as usize;
                (0, whole.min(remaining).min(usize::from(u16::MAX)))
            }
            Some(offset) => {
                let needed = offset.saturating_add(block_size);
                if needed > buf_len {
                    return Err(UsbhError::BufferTooSmall {
                        needed,
                        actual: buf_len,
                    });
                }
                let address = buf_addr.wrapping_add(offset);
                if address % DMA_ALIGN != 0 {
                    return Err(UsbhError::Misaligned { address });
                }
                (offset, 1)
            }
        };

        let addr = slot.bind.addr.ok_or(UsbhError::NoDevice)?;
        Ok(Request {
            slot: i,
            addr,
            lun: slot.lun,
            lba: block,
            count: count as u16,
            start,
            len: count * block_size,
        })
    }

    fn issue(&mut self, direction: Direction, request: &Request, data: Option<&[u8]>) -> Result<()> {
        let tag = TransferTag {
            slot: request.slot as u8,
            generation: self.handle.generation,
        };
        let (controller, pool) = self.host.parts();
        let slot = &mut pool.msc[request.slot];

        let mut buffer = slot.buffer.take().unwrap_or_default();
        buffer.resize(request.len);
        if let Some(data) = data {
            buffer.as_mut_slice().copy_from_slice(data);
        }

        slot.operation_pending = true;
        slot.operation_success = false;
        slot.operation_status = None;

        let issued = match direction {
            Direction::Read => controller.msc_read10(
                request.addr,
                request.lun,
                request.lba,
                request.count,
                buffer,
                tag,
            ),
            Direction::Write => controller.msc_write10(
                request.addr,
                request.lun,
                request.lba,
                request.count,
                buffer,
                tag,
            ),
        };

        if let Err(buffer) = issued {
            slot.buffer = Some(buffer);
            slot.operation_pending = false;
            debug!(
                "Controller rejected {:?} of {} blocks at {} on device {}",
                direction, request.count, request.lba, request.addr
            );
            return Err(UsbhError::TransferFailed(TransferFailure::Rejected));
        }

        trace!(
            "{:?} of {} blocks at {} issued on device {}",
            direction, request.count, request.lba, request.addr
        );
        Ok(())
    }

    /// Whether the transfer is still outstanding; a vanished unit counts as done
    fn still_pending(&self) -> bool {
        self.host
            .pool()
            .msc_active(self.handle)
            .is_some_and(|i| self.host.pool().msc[i].operation_pending)
    }

    fn wait_complete(&mut self) -> Result<()> {
        let timeout = self.host.config().msc.transfer_timeout;
        let slice = self.host.config().scheduler.wait_slice;
        let signal = self.host.signal();

        wait_while(timeout, slice, &signal, || {
            self.host.pump();
            self.still_pending()
        })
    }

    #[cfg(feature = "async")]
    async fn wait_complete_async(&mut self) -> Result<()> {
        let timeout = self.host.config().msc.transfer_timeout;
        let slice = self.host.config().scheduler.wait_slice;

        crate::blocking::wait_while_async(timeout, slice, || {
            self.host.pump();
            self.still_pending()
        })
        .await
    }

    fn finish(&mut self, request: &Request, out: Option<&mut [u8]>) -> Result<usize> {
        let i = self.slot_index()?;
        let slot = &self.host.pool().msc[i];

        if !slot.operation_success {
            map_transfer_status(slot.operation_status.unwrap_or(TransferStatus::Failed))?;
            return Err(UsbhError::TransferFailed(TransferFailure::Failed));
        }

        if let Some(out) = out {
            let data = slot
                .buffer
                .as_ref()
                .map(|b| b.as_slice())
                .filter(|d| d.len() >= request.len)
                .ok_or(UsbhError::TransferFailed(TransferFailure::Short))?;
            out.copy_from_slice(&data[..request.len]);
        }

        Ok(usize::from(request.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_codes() {
        assert_eq!(BlockIoctl::from_code(4), Some(BlockIoctl::BlockCount));
        assert_eq!(BlockIoctl::from_code(5), Some(BlockIoctl::BlockSize));
        assert_eq!(BlockIoctl::from_code(6), Some(BlockIoctl::BlockErase));
        assert_eq!(BlockIoctl::from_code(0), None);
        assert_eq!(BlockIoctl::from_code(7), None);
        assert_eq!(BlockIoctl::Sync as u32, 3);
    }
}
