//! USB device driver access
//!
//! [Driver] is the hardware seam: one synchronous call per attempt, no retries, no
//! bookkeeping. [Usbd] wraps a driver and is the only path by which classes touch
//! endpoints. It serializes every call behind per-endpoint locks, retries transient
//! faults according to a [RetryPolicy], tracks active transfers and halted endpoints,
//! and forwards completion events from interrupt context to worker threads.

use crate::rtos::{Delay, ThreadFlags};
use bitflags::bitflags;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbError;

mod access;

pub use access::{EndpointAccess, Usbd};

/// Number of endpoint numbers per direction
pub const ENDPOINT_COUNT: usize = 16;

/// Driver call outcome
pub type DriverResult<T> = Result<T, DriverError>;

/// Hardware driver error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// Unspecified error
    Error,
    /// Driver is busy
    Busy,
    /// Operation timed out
    Timeout,
    /// Operation not supported by the hardware
    Unsupported,
    /// Invalid argument
    Parameter,
    /// Driver specific error code
    Specific(i32),
}

impl DriverError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Error | Self::Busy | Self::Timeout)
    }
}

/// Access layer error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbdError {
    /// Lock not available, endpoint halted or busy, or the driver stayed busy
    Busy,
    /// The driver failed
    Driver(DriverError),
}

impl From<DriverError> for UsbdError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Busy => Self::Busy,
            err => Self::Driver(err),
        }
    }
}

impl From<UsbdError> for UsbError {
    fn from(err: UsbdError) -> Self {
        match err {
            UsbdError::Busy | UsbdError::Driver(DriverError::Timeout) => UsbError::WouldBlock,
            UsbdError::Driver(DriverError::Unsupported) => UsbError::Unsupported,
            UsbdError::Driver(DriverError::Parameter) => UsbError::InvalidEndpoint,
            UsbdError::Driver(_) => UsbError::InvalidState,
        }
    }
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u8,
    /// Pause between attempts
    pub delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails permanently or the attempts run out
    pub fn run<T, K, F>(&self, delay: &K, mut op: F) -> DriverResult<T>
    where
        K: Delay,
        F: FnMut() -> DriverResult<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < attempts => {
                    delay.delay_ms(self.delay_ms);
                    attempt += 1;
                }
                res => return res,
            }
        }
    }

    /// Polls `try_op` until it reports success, pausing after every miss
    pub fn poll<K, F>(&self, delay: &K, mut try_op: F) -> bool
    where
        K: Delay,
        F: FnMut() -> bool,
    {
        for _ in 0..self.attempts.max(1) {
            if try_op() {
                return true;
            }
            delay.delay_ms(self.delay_ms);
        }
        false
    }
}

/// Driver power state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    Off,
    Low,
    Full,
}

/// Bus speed
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Low,
    #[default]
    Full,
    High,
}

/// Device state as reported by the hardware
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceState {
    pub vbus: bool,
    pub speed: Speed,
    pub active: bool,
}

bitflags! {
    /// Endpoint event bits, as signalled by the driver
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EndpointEvent: u8 {
        /// SETUP packet received on a control endpoint
        const SETUP = 0x01;
        /// OUT transfer completed
        const OUT = 0x02;
        /// IN transfer completed
        const IN = 0x04;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for EndpointEvent {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "EndpointEvent({=u8:#x})", self.bits())
    }
}

impl EndpointEvent {
    /// Thread flags payload: endpoint number in bits 12..16, event in bits 8..12
    pub const fn encode(self, ep_num: u8) -> u32 {
        ((ep_num as u32 & 0x0F) << 12) | ((self.bits() as u32) << 8)
    }

    /// Inverse of [encode](EndpointEvent::encode). Unknown event bits are dropped.
    pub const fn decode(flags: u32) -> (u8, Self) {
        (
            ((flags >> 12) & 0x0F) as u8,
            Self::from_bits_truncate(((flags >> 8) & 0x0F) as u8),
        )
    }
}

/// USB device controller driver
///
/// Every method performs a single attempt. Retrying, locking and bookkeeping belong to
/// [Usbd].
///
/// Transfers never keep a borrow of the caller's buffer: an IN transfer copies `data`
/// into endpoint memory before returning, an OUT transfer only arms reception of up to
/// `data.len()` bytes. Received bytes are handed over by
/// [endpoint_transfer_get_result](Driver::endpoint_transfer_get_result).
pub trait Driver {
    fn initialize(&self) -> DriverResult<()>;

    fn uninitialize(&self) -> DriverResult<()>;

    fn power_control(&self, state: PowerState) -> DriverResult<()>;

    fn device_connect(&self) -> DriverResult<()>;

    fn device_disconnect(&self) -> DriverResult<()>;

    fn device_state(&self) -> DeviceState {
        DeviceState::default()
    }

    fn device_remote_wakeup(&self) -> DriverResult<()> {
        Err(DriverError::Unsupported)
    }

    fn device_set_address(&self, address: u8) -> DriverResult<()>;

    fn read_setup_packet(&self, setup: &mut [u8; 8]) -> DriverResult<()>;

    fn get_frame_number(&self) -> u16 {
        0
    }

    fn endpoint_configure(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> DriverResult<()>;

    fn endpoint_unconfigure(&self, ep: EndpointAddress) -> DriverResult<()>;

    fn endpoint_stall(&self, ep: EndpointAddress, stall: bool) -> DriverResult<()>;

    /// Starts a transfer of `data.len()` bytes
    fn endpoint_transfer(&self, ep: EndpointAddress, data: &mut [u8]) -> DriverResult<()>;

    /// Bytes moved by the last transfer. For OUT endpoints they are copied into `data`.
    fn endpoint_transfer_get_result(&self, ep: EndpointAddress, data: &mut [u8]) -> usize;

    fn endpoint_transfer_abort(&self, ep: EndpointAddress) -> DriverResult<()>;
}

/// Receiver of events signalled from interrupt context
pub trait EventSink {
    /// Delivers an encoded endpoint event to the worker owning endpoint `ep_num`
    fn post_endpoint(&self, ep_num: u8, flags: u32);

    /// Delivers a device event (bus reset, suspend, ...) to the core worker
    fn post_device(&self, _event: u32) {}
}

/// [EventSink] routing endpoint events by endpoint number
///
/// ```
/// use usbd_msc::driver::EndpointRouter;
/// use usbd_msc::rtos::EventFlags;
///
/// let msc_flags = EventFlags::new();
/// let router = EndpointRouter::new().route(1, &msc_flags);
/// ```
pub struct EndpointRouter<'a> {
    owners: [Option<&'a dyn ThreadFlags>; ENDPOINT_COUNT],
    core: Option<&'a dyn ThreadFlags>,
}

impl Default for EndpointRouter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> EndpointRouter<'a> {
    pub fn new() -> Self {
        Self {
            owners: [None; ENDPOINT_COUNT],
            core: None,
        }
    }

    /// Sends events of endpoint number `ep_num` (both directions) to `owner`
    pub fn route(mut self, ep_num: u8, owner: &'a dyn ThreadFlags) -> Self {
        if let Some(slot) = self.owners.get_mut(ep_num as usize) {
            *slot = Some(owner);
        }
        self
    }

    /// Sends device events to `owner`
    pub fn route_device(mut self, owner: &'a dyn ThreadFlags) -> Self {
        self.core = Some(owner);
        self
    }
}

impl EventSink for EndpointRouter<'_> {
    fn post_endpoint(&self, ep_num: u8, flags: u32) {
        if let Some(Some(owner)) = self.owners.get(ep_num as usize) {
            owner.set(flags);
        }
    }

    fn post_device(&self, event: u32) {
        if let Some(owner) = self.core {
            owner.set(event);
        }
    }
}
