use super::{
    DeviceState, Driver, DriverResult, EndpointEvent, EventSink, PowerState, RetryPolicy,
    UsbdError, ENDPOINT_COUNT,
};
use crate::fmt::{info, trace, warn};
use crate::rtos::{Delay, Semaphore, SpinSemaphore};
use core::sync::atomic::{AtomicU32, Ordering};
use usb_device::endpoint::{EndpointAddress, EndpointType};

/// Endpoint operations available to device classes
///
/// Implemented by [Usbd]. Every operation takes the endpoint's own lock, so operations on
/// different endpoints (or directions) never wait for each other.
pub trait EndpointAccess {
    /// Configures an endpoint, aborting its active transfer first
    ///
    /// A configured endpoint starts out of halt, held halts included.
    fn configure(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), UsbdError>;

    /// Unconfigures an endpoint, aborting its active transfer first
    fn unconfigure(&self, ep: EndpointAddress) -> Result<(), UsbdError>;

    /// Sets or clears the endpoint stall and updates the halt state on success
    fn stall(&self, ep: EndpointAddress, stall: bool) -> Result<(), UsbdError>;

    /// Starts a transfer. See [Driver] for the buffer contract.
    fn transfer(&self, ep: EndpointAddress, data: &mut [u8]) -> Result<(), UsbdError>;

    /// Bytes moved by the last transfer, copied into `data` for OUT endpoints.
    /// Zero if the endpoint lock cannot be taken.
    fn transfer_get_result(&self, ep: EndpointAddress, data: &mut [u8]) -> usize;

    /// Aborts the active transfer. Succeeds immediately if nothing is active.
    fn transfer_abort(&self, ep: EndpointAddress) -> Result<(), UsbdError>;

    /// Keeps a halted endpoint stalled through host ClearFeature(ENDPOINT_HALT) requests
    fn hold_halt(&self, ep: EndpointAddress);

    /// Lets the host clear every held halt again
    fn release_halts(&self);

    /// Handles a host ClearFeature(ENDPOINT_HALT)
    ///
    /// Returns `Ok(false)` if the halt is held and the endpoint stays stalled.
    fn clear_feature_halt(&self, ep: EndpointAddress) -> Result<bool, UsbdError>;

    fn is_halted(&self, ep: EndpointAddress) -> bool;

    fn is_active(&self, ep: EndpointAddress) -> bool;
}

#[inline]
fn ep_mask(ep: EndpointAddress) -> u32 {
    let mut idx = ep.index() & 0x0F;
    if ep.is_in() {
        idx += ENDPOINT_COUNT;
    }
    1 << idx
}

#[inline]
fn lock_index(ep: EndpointAddress) -> usize {
    ep_mask(ep).trailing_zeros() as usize
}

struct LockGuard<'a, S: Semaphore>(&'a S);

impl<S: Semaphore> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Driver access layer of one USB device
///
/// Safe to share between worker threads and interrupt context: bookkeeping lives in
/// atomics and the driver is only called with the matching lock held. Interrupt context
/// must only call [signal_endpoint_event](Usbd::signal_endpoint_event) and
/// [signal_device_event](Usbd::signal_device_event).
pub struct Usbd<D, E, K, S = SpinSemaphore> {
    device: u8,
    driver: D,
    events: E,
    delay: K,
    retry: RetryPolicy,
    device_lock: S,
    ep_locks: [S; 2 * ENDPOINT_COUNT],
    active: AtomicU32,
    halt: AtomicU32,
    no_halt_clear: AtomicU32,
}

impl<D, E, K> Usbd<D, E, K>
where
    D: Driver,
    E: EventSink,
    K: Delay,
{
    /// Creates the access layer of device `device` with the default [RetryPolicy]
    pub fn new(device: u8, driver: D, events: E, delay: K) -> Self {
        Self::with_retry(device, driver, events, delay, RetryPolicy::default())
    }

    pub fn with_retry(device: u8, driver: D, events: E, delay: K, retry: RetryPolicy) -> Self {
        Self::with_locks(device, driver, events, delay, retry)
    }
}

impl<D, E, K, S> Usbd<D, E, K, S>
where
    D: Driver,
    E: EventSink,
    K: Delay,
    S: Semaphore + Default,
{
    /// Creates the access layer with RTOS-provided locks of type `S`
    pub fn with_locks(device: u8, driver: D, events: E, delay: K, retry: RetryPolicy) -> Self {
        Self {
            device,
            driver,
            events,
            delay,
            retry,
            device_lock: S::default(),
            ep_locks: core::array::from_fn(|_| S::default()),
            active: AtomicU32::new(0),
            halt: AtomicU32::new(0),
            no_halt_clear: AtomicU32::new(0),
        }
    }
}

impl<D, E, K, S> Usbd<D, E, K, S>
where
    D: Driver,
    E: EventSink,
    K: Delay,
    S: Semaphore,
{
    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Transfer completion from interrupt context
    ///
    /// Clears the active flag and wakes the worker owning the endpoint.
    pub fn signal_endpoint_event(&self, ep: EndpointAddress, event: EndpointEvent) {
        let ep_num = (ep.index() & 0x0F) as u8;
        trace!("usb: drv: Endpoint event: {:?} {}", ep, event.bits());
        self.active.fetch_and(!ep_mask(ep), Ordering::AcqRel);
        self.events.post_endpoint(ep_num, event.encode(ep_num));
    }

    /// Device event from interrupt context
    pub fn signal_device_event(&self, event: u32) {
        trace!("usb: drv: Device event: {}", event);
        self.events.post_device(event);
    }

    pub fn initialize(&self) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.initialize())
    }

    pub fn uninitialize(&self) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.uninitialize())
    }

    pub fn power_control(&self, state: PowerState) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.power_control(state))
    }

    pub fn connect(&self) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.device_connect())
    }

    pub fn disconnect(&self) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.device_disconnect())
    }

    pub fn remote_wakeup(&self) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.device_remote_wakeup())
    }

    pub fn set_address(&self, address: u8) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.device_set_address(address))
    }

    pub fn read_setup_packet(&self, setup: &mut [u8; 8]) -> Result<(), UsbdError> {
        self.with_device(|| self.driver.read_setup_packet(&mut *setup))
    }

    /// Current frame number, 0 if the device lock is not available
    pub fn frame_number(&self) -> u16 {
        match self.lock(&self.device_lock) {
            Ok(_guard) => self.driver.get_frame_number(),
            Err(_) => 0,
        }
    }

    pub fn device_state(&self) -> DeviceState {
        self.driver.device_state()
    }

    fn with_device<T, F>(&self, op: F) -> Result<T, UsbdError>
    where
        F: FnMut() -> DriverResult<T>,
    {
        let _guard = self.lock(&self.device_lock)?;
        self.retry.run(&self.delay, op).map_err(|err| {
            warn!("usb: drv: Device {} operation failed: {:?}", self.device, err);
            UsbdError::from(err)
        })
    }

    fn lock<'a>(&'a self, sem: &'a S) -> Result<LockGuard<'a, S>, UsbdError> {
        if self.retry.poll(&self.delay, || sem.try_acquire()) {
            Ok(LockGuard(sem))
        } else {
            warn!("usb: drv: Lock busy on device {}", self.device);
            Err(UsbdError::Busy)
        }
    }

    fn lock_endpoint(&self, ep: EndpointAddress) -> Result<LockGuard<'_, S>, UsbdError> {
        self.lock(&self.ep_locks[lock_index(ep)])
    }

    /// The caller holds the endpoint lock
    fn abort_locked(&self, ep: EndpointAddress) -> Result<(), UsbdError> {
        let mask = ep_mask(ep);
        if self.active.load(Ordering::Acquire) & mask == 0 {
            return Ok(());
        }
        self.retry
            .run(&self.delay, || self.driver.endpoint_transfer_abort(ep))
            .map_err(|err| {
                warn!("usb: drv: Abort failed on {:?}: {:?}", ep, err);
                UsbdError::from(err)
            })?;
        self.active.fetch_and(!mask, Ordering::AcqRel);
        trace!("usb: drv: Aborted transfer on {:?}", ep);
        Ok(())
    }

    fn forget_halt(&self, ep: EndpointAddress) {
        let mask = ep_mask(ep);
        self.halt.fetch_and(!mask, Ordering::AcqRel);
        self.no_halt_clear.fetch_and(!mask, Ordering::AcqRel);
    }
}

impl<D, E, K, S> EndpointAccess for Usbd<D, E, K, S>
where
    D: Driver,
    E: EventSink,
    K: Delay,
    S: Semaphore,
{
    fn configure(
        &self,
        ep: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), UsbdError> {
        let _guard = self.lock_endpoint(ep)?;
        self.abort_locked(ep)?;
        self.retry
            .run(&self.delay, || {
                self.driver.endpoint_configure(ep, ep_type, max_packet_size)
            })
            .map_err(UsbdError::from)?;
        self.forget_halt(ep);
        info!("usb: drv: Configured {:?}, max packet {}", ep, max_packet_size);
        Ok(())
    }

    fn unconfigure(&self, ep: EndpointAddress) -> Result<(), UsbdError> {
        let _guard = self.lock_endpoint(ep)?;
        self.abort_locked(ep)?;
        self.retry
            .run(&self.delay, || self.driver.endpoint_unconfigure(ep))
            .map_err(UsbdError::from)?;
        self.forget_halt(ep);
        info!("usb: drv: Unconfigured {:?}", ep);
        Ok(())
    }

    fn stall(&self, ep: EndpointAddress, stall: bool) -> Result<(), UsbdError> {
        let mask = ep_mask(ep);
        let _guard = self.lock_endpoint(ep)?;
        self.abort_locked(ep)?;
        self.retry
            .run(&self.delay, || self.driver.endpoint_stall(ep, stall))
            .map_err(UsbdError::from)?;
        if stall {
            self.halt.fetch_or(mask, Ordering::AcqRel);
        } else {
            self.halt.fetch_and(!mask, Ordering::AcqRel);
        }
        info!("usb: drv: Stall {:?}: {}", ep, stall);
        Ok(())
    }

    fn transfer(&self, ep: EndpointAddress, data: &mut [u8]) -> Result<(), UsbdError> {
        let mask = ep_mask(ep);
        let _guard = self.lock_endpoint(ep)?;

        if self.halt.load(Ordering::Acquire) & mask != 0 {
            trace!("usb: drv: Transfer on halted {:?}", ep);
            return Err(UsbdError::Busy);
        }
        if self.active.load(Ordering::Acquire) & mask != 0 {
            if ep.index() & 0x0F != 0 {
                trace!("usb: drv: Transfer already active on {:?}", ep);
                return Err(UsbdError::Busy);
            }
            self.abort_locked(ep)?;
        }

        // marked before the call: the completion may be signalled before it returns
        self.active.fetch_or(mask, Ordering::AcqRel);
        match self
            .retry
            .run(&self.delay, || self.driver.endpoint_transfer(ep, &mut *data))
        {
            Ok(()) => {
                trace!("usb: drv: Transfer {:?}, {} bytes", ep, data.len());
                Ok(())
            }
            Err(err) => {
                self.active.fetch_and(!mask, Ordering::AcqRel);
                warn!("usb: drv: Transfer failed on {:?}: {:?}", ep, err);
                Err(UsbdError::from(err))
            }
        }
    }

    fn transfer_get_result(&self, ep: EndpointAddress, data: &mut [u8]) -> usize {
        match self.lock_endpoint(ep) {
            Ok(_guard) => self.driver.endpoint_transfer_get_result(ep, data),
            Err(_) => 0,
        }
    }

    fn transfer_abort(&self, ep: EndpointAddress) -> Result<(), UsbdError> {
        if !self.is_active(ep) {
            return Ok(());
        }
        let _guard = self.lock_endpoint(ep)?;
        self.abort_locked(ep)
    }

    fn hold_halt(&self, ep: EndpointAddress) {
        self.no_halt_clear.fetch_or(ep_mask(ep), Ordering::AcqRel);
    }

    fn release_halts(&self) {
        self.no_halt_clear.store(0, Ordering::Release);
    }

    fn clear_feature_halt(&self, ep: EndpointAddress) -> Result<bool, UsbdError> {
        let mask = ep_mask(ep);
        let held = self.halt.load(Ordering::Acquire) & self.no_halt_clear.load(Ordering::Acquire);
        if held & mask != 0 {
            info!("usb: drv: Halt held on {:?}", ep);
            return Ok(false);
        }
        self.stall(ep, false)?;
        Ok(true)
    }

    fn is_halted(&self, ep: EndpointAddress) -> bool {
        self.halt.load(Ordering::Acquire) & ep_mask(ep) != 0
    }

    fn is_active(&self, ep: EndpointAddress) -> bool {
        self.active.load(Ordering::Acquire) & ep_mask(ep) != 0
    }
}
