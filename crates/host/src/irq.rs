//! IRQ handlers for class instances
//!
//! A handler is one of three shapes, fixed when it is registered: a plain
//! function, a boxed closure, or a coroutine that is resumed once per event and
//! dropped when it completes. Notifications are never delivered in callback
//! context; they are queued and run at the cooperative task's next safe point.

use crate::error::{Result, UsbhError};
use crate::host::UsbHost;
use crate::pool::{CdcHandle, HidHandle};
use std::fmt;

/// CDC trigger: data received
pub const IRQ_RX: u32 = 1;

/// HID trigger: input report received
pub const IRQ_REPORT: u32 = 1;

/// What a handler is told when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    CdcRx(CdcHandle),
    HidReport(HidHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Resume again on the next event
    Yielded,
    /// Done; the handler is unregistered
    Complete,
}

/// A resumable handler
pub trait IrqCoroutine: Send {
    fn resume(&mut self, host: &mut UsbHost, event: IrqEvent) -> CoroutineState;
}

pub type IrqFn = fn(&mut UsbHost, IrqEvent);

pub enum IrqHandler {
    Function(IrqFn),
    Callable(Box<dyn FnMut(&mut UsbHost, IrqEvent) + Send>),
    Coroutine(Box<dyn IrqCoroutine>),
}

impl IrqHandler {
    pub fn function(f: IrqFn) -> Self {
        IrqHandler::Function(f)
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: FnMut(&mut UsbHost, IrqEvent) + Send + 'static,
    {
        IrqHandler::Callable(Box::new(f))
    }

    pub fn coroutine<C>(c: C) -> Self
    where
        C: IrqCoroutine + 'static,
    {
        IrqHandler::Coroutine(Box::new(c))
    }

    /// Run the handler once; returns `false` when it is spent
    pub(crate) fn dispatch(&mut self, host: &mut UsbHost, event: IrqEvent) -> bool {
        match self {
            IrqHandler::Function(f) => {
                f(host, event);
                true
            }
            IrqHandler::Callable(f) => {
                f(host, event);
                true
            }
            IrqHandler::Coroutine(c) => c.resume(host, event) == CoroutineState::Yielded,
        }
    }
}

impl fmt::Debug for IrqHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            IrqHandler::Function(_) => "Function",
            IrqHandler::Callable(_) => "Callable",
            IrqHandler::Coroutine(_) => "Coroutine",
        };
        f.debug_tuple("IrqHandler").field(&kind).finish()
    }
}

/// Registration state of an instance's handler
///
/// While a handler runs it is out of its slot; registering or clearing during
/// that time wins over putting the running handler back.
#[derive(Debug, Default)]
pub(crate) enum IrqSlot {
    #[default]
    Empty,
    Installed(IrqHandler),
    Running,
}

impl IrqSlot {
    /// Whether events should be queued for this instance
    pub fn is_armed(&self) -> bool {
        !matches!(self, IrqSlot::Empty)
    }

    pub fn set(&mut self, handler: Option<IrqHandler>) {
        *self = match handler {
            Some(handler) => IrqSlot::Installed(handler),
            None => IrqSlot::Empty,
        };
    }

    /// Take the handler out for a run
    pub fn begin(&mut self) -> Option<IrqHandler> {
        match std::mem::take(self) {
            IrqSlot::Installed(handler) => {
                *self = IrqSlot::Running;
                Some(handler)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Put the handler back unless it was replaced, cleared or spent meanwhile
    pub fn finish(&mut self, handler: IrqHandler, keep: bool) {
        if matches!(self, IrqSlot::Running) {
            *self = if keep {
                IrqSlot::Installed(handler)
            } else {
                IrqSlot::Empty
            };
        }
    }
}

/// Work queued from callback context for the cooperative task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    CdcRx { slot: u8, generation: u32 },
    HidReport { slot: u8, generation: u32 },
}

/// Resolve an `irq()` call into the handler to install
///
/// Trigger 0 or no handler clears the slot. Any trigger other than
/// `supported` is rejected, as is a hard IRQ.
pub(crate) fn resolve_registration(
    handler: Option<IrqHandler>,
    trigger: u32,
    supported: u32,
    hard: bool,
) -> Result<Option<IrqHandler>> {
    if hard {
        return Err(UsbhError::InvalidArgument("hard IRQ not supported"));
    }
    match trigger {
        0 => Ok(None),
        t if t == supported => Ok(handler),
        t => Err(UsbhError::UnsupportedTrigger(t)),
    }
}
