//! CDC serial binding

use crate::blocking::wait_while;
use crate::error::{Result, UsbhError};
use crate::host::UsbHost;
use crate::irq::{IRQ_RX, IrqHandler, resolve_registration};
use crate::pool::CdcHandle;
use bitflags::bitflags;
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

bitflags! {
    /// Stream readiness, as requested from and reported by [`StreamRequest::Poll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollFlags: u32 {
        const RD = 0x0001;
        const WR = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
        /// The stream is not usable
        const NVAL = 0x0020;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    Poll(PollFlags),
    Close,
    Other(u32),
}

/// A bound CDC interface
pub struct CdcPort<'a> {
    host: &'a mut UsbHost,
    handle: CdcHandle,
}

impl<'a> CdcPort<'a> {
    pub(crate) fn new(host: &'a mut UsbHost, handle: CdcHandle) -> Self {
        Self { host, handle }
    }

    pub fn handle(&self) -> CdcHandle {
        self.handle
    }

    /// Controller interface index, if the instance is still live
    fn index(&self) -> Result<u8> {
        self.host.ensure_active()?;
        let pool = self.host.pool();
        let i = pool.cdc_active(self.handle).ok_or(UsbhError::NoDevice)?;
        Ok(pool.cdc[i].index)
    }

    pub fn is_connected(&self) -> bool {
        self.index().is_ok()
    }

    /// Bytes waiting in the receive FIFO; 0 when inactive
    pub fn any(&self) -> usize {
        self.index()
            .map(|index| self.host.controller().cdc_read_available(index))
            .unwrap_or(0)
    }

    /// Read up to `n` bytes without waiting
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let index = self.index()?;
        let len = n.min(self.host.controller().cdc_read_available(index));
        let mut data = vec![0; len];
        let got = self.host.controller_mut().cdc_read(index, &mut data);
        data.truncate(got);
        Ok(data)
    }

    /// Read up to `n` bytes, waiting until at least one arrives
    ///
    /// Waits for `timeout`, or the configured `cdc.read_timeout` when `None`.
    /// Returns an empty buffer if nothing arrived in time.
    pub fn read_timeout(&mut self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.index()?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let timeout = timeout.unwrap_or(self.host.config().cdc.read_timeout);
        let slice = self.host.config().scheduler.wait_slice;
        let signal = self.host.signal();

        let waited = wait_while(timeout, slice, &signal, || {
            self.host.pump();
            match self.index() {
                Ok(index) => self.host.controller().cdc_read_available(index) == 0,
                Err(_) => false,
            }
        });

        match waited {
            Ok(()) => self.read(n),
            Err(UsbhError::Timeout(_)) => {
                self.index()?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Write all of `data`, pumping while the transmit FIFO is full
    ///
    /// Gives up once `cdc.write_idle_timeout` passes without progress and
    /// returns the count accepted so far, which may be short.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut index = self.index()?;
        if data.is_empty() {
            return Ok(0);
        }

        let idle_timeout = self.host.config().cdc.write_idle_timeout;
        let slice = self.host.config().scheduler.wait_slice;
        let signal = self.host.signal();

        let mut written = 0;
        let mut last_progress = Instant::now();
        loop {
            let controller = self.host.controller_mut();
            let space = controller.cdc_write_available(index);
            if space > 0 {
                let end = data.len().min(written + space);
                let accepted = controller.cdc_write(index, &data[written..end]);
                if accepted > 0 {
                    written += accepted;
                    last_progress = Instant::now();
                }
            }
            controller.cdc_write_flush(index);

            if written == data.len() {
                return Ok(written);
            }
            if last_progress.elapsed() >= idle_timeout {
                trace!(
                    "CDC write stalled after {} of {} bytes",
                    written,
                    data.len()
                );
                return Ok(written);
            }

            self.host.pump();
            index = self.index()?;
            signal.wait(slice);
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        let index = self.index()?;
        self.host.controller_mut().cdc_write_flush(index);
        Ok(())
    }

    /// Register, replace or clear (`trigger == 0`) the receive handler
    pub fn irq(&mut self, handler: Option<IrqHandler>, trigger: u32, hard: bool) -> Result<()> {
        self.index()?;
        let resolved = resolve_registration(handler, trigger, IRQ_RX, hard)?;
        if let Some(i) = self.host.pool().cdc_active(self.handle) {
            self.host.pool_mut().cdc[i].irq.set(resolved);
        }
        Ok(())
    }

    /// Readiness of the stream, restricted to `requested`
    pub fn poll(&self, requested: PollFlags) -> PollFlags {
        let Ok(index) = self.index() else {
            return PollFlags::NVAL;
        };

        let controller = self.host.controller();
        let mut ready = PollFlags::empty();
        if requested.contains(PollFlags::RD) && controller.cdc_read_available(index) > 0 {
            ready |= PollFlags::RD;
        }
        if requested.contains(PollFlags::WR)
            && (!self.host.config().cdc.poll_checks_tx_space
                || controller.cdc_write_available(index) > 0)
        {
            ready |= PollFlags::WR;
        }
        ready
    }

    pub fn ioctl(&mut self, request: StreamRequest) -> Result<usize> {
        match request {
            StreamRequest::Poll(requested) => Ok(self.poll(requested).bits() as usize),
            StreamRequest::Close => Ok(0),
            StreamRequest::Other(_) => Err(UsbhError::InvalidArgument("unsupported stream ioctl")),
        }
    }
}

impl io::Read for CdcPort<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let index = self.index()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let got = self.host.controller_mut().cdc_read(index, buf);
        if got == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(got)
    }
}

impl io::Write for CdcPort<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match CdcPort::write(self, buf)? {
            0 if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        CdcPort::flush(self).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_flag_values() {
        assert_eq!(PollFlags::RD.bits(), 1);
        assert_eq!(PollFlags::WR.bits(), 4);
        assert_eq!(PollFlags::NVAL.bits(), 0x20);
        assert!((PollFlags::RD | PollFlags::WR).contains(PollFlags::WR));
    }
}
