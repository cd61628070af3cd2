#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;
use usbd_msc::driver::{
    Driver, DriverError, DriverResult, EndpointEvent, EndpointRouter, PowerState, Usbd,
};
use usbd_msc::media::{Capacity, MediaError, MediaProvider, MediaStatus};
use usbd_msc::msc::{InquiryData, MscConfig};
use usbd_msc::rtos::{EventFlags, NoDelay};
use usbd_msc::subclass::scsi::Scsi;

pub mod bbb;
pub mod scsi;

pub const EP_NUM: u8 = 1;
pub const BLOCK_SIZE: usize = 512;
pub const CACHE_LEN: usize = 1024;

pub fn ep_in() -> EndpointAddress {
    EndpointAddress::from_parts(EP_NUM as usize, UsbDirection::In)
}

pub fn ep_out() -> EndpointAddress {
    EndpointAddress::from_parts(EP_NUM as usize, UsbDirection::Out)
}

/// Driver calls that can be scripted to fail
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Op {
    Configure,
    Unconfigure,
    Stall,
    Transfer,
    Abort,
}

#[derive(Default)]
struct Endpoint {
    stalled: bool,
    /// OUT: bytes the device is ready to receive
    armed: Option<usize>,
    /// IN: bytes waiting for the host
    payload: Option<Vec<u8>>,
    /// OUT: bytes of the last completed transfer
    received: Vec<u8>,
    /// IN: length of the last completed transfer
    sent: usize,
}

#[derive(Default)]
struct Inner {
    eps: HashMap<u8, Endpoint>,
    host_out: HashMap<u8, VecDeque<Vec<u8>>>,
    completions: VecDeque<(EndpointAddress, EndpointEvent)>,
    failures: HashMap<Op, VecDeque<DriverError>>,
    calls: HashMap<Op, usize>,
    overlaps: usize,
}

impl Inner {
    fn script(&mut self, op: Op) -> DriverResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Moves queued host bytes into an armed OUT endpoint
    fn deliver(&mut self, addr: u8) {
        let ep = self.eps.entry(addr).or_default();
        let Some(armed) = ep.armed else {
            return;
        };
        if ep.stalled {
            return;
        }
        let Some(queue) = self.host_out.get_mut(&addr) else {
            return;
        };
        let Some(front) = queue.front_mut() else {
            return;
        };
        let chunk = if front.len() > armed {
            front.drain(..armed).collect()
        } else {
            queue.pop_front().unwrap_or_default()
        };
        ep.received = chunk;
        ep.armed = None;
        self.completions
            .push_back((EndpointAddress::from(addr), EndpointEvent::OUT));
    }
}

/// Device controller model with a host on the other side of the bus
#[derive(Clone, Default)]
pub struct MockDriver {
    inner: Arc<Mutex<Inner>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host to device bytes, as one transfer
    pub fn host_write(&self, ep: EndpointAddress, bytes: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        let addr = u8::from(ep);
        lock.host_out
            .entry(addr)
            .or_default()
            .push_back(bytes.to_vec());
        lock.deliver(addr);
    }

    /// Device to host bytes, `None` if nothing is submitted or the endpoint is stalled
    pub fn host_read(&self, ep: EndpointAddress) -> Option<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        let state = lock.eps.entry(u8::from(ep)).or_default();
        if state.stalled {
            return None;
        }
        let payload = state.payload.take()?;
        state.sent = payload.len();
        lock.completions.push_back((ep, EndpointEvent::IN));
        Some(payload)
    }

    pub fn is_stalled(&self, ep: EndpointAddress) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.eps.get(&u8::from(ep)).is_some_and(|e| e.stalled)
    }

    pub fn is_armed(&self, ep: EndpointAddress) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.eps.get(&u8::from(ep)).is_some_and(|e| e.armed.is_some())
    }

    pub fn take_completion(&self) -> Option<(EndpointAddress, EndpointEvent)> {
        self.inner.lock().unwrap().completions.pop_front()
    }

    /// Makes the next `times` calls of `op` fail with `err`
    pub fn fail(&self, op: Op, err: DriverError, times: usize) {
        let mut lock = self.inner.lock().unwrap();
        let queue = lock.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    pub fn calls(&self, op: Op) -> usize {
        let lock = self.inner.lock().unwrap();
        lock.calls.get(&op).copied().unwrap_or(0)
    }

    /// Transfers started while another one was still pending on the same endpoint
    pub fn overlaps(&self) -> usize {
        self.inner.lock().unwrap().overlaps
    }
}

impl Driver for MockDriver {
    fn initialize(&self) -> DriverResult<()> {
        Ok(())
    }

    fn uninitialize(&self) -> DriverResult<()> {
        Ok(())
    }

    fn power_control(&self, _state: PowerState) -> DriverResult<()> {
        Ok(())
    }

    fn device_connect(&self) -> DriverResult<()> {
        Ok(())
    }

    fn device_disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    fn device_set_address(&self, _address: u8) -> DriverResult<()> {
        Ok(())
    }

    fn read_setup_packet(&self, setup: &mut [u8; 8]) -> DriverResult<()> {
        setup.fill(0);
        Ok(())
    }

    fn endpoint_configure(
        &self,
        ep: EndpointAddress,
        _ep_type: EndpointType,
        _max_packet_size: u16,
    ) -> DriverResult<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.script(Op::Configure)?;
        // a configured endpoint starts unstalled with nothing pending
        lock.eps.insert(u8::from(ep), Endpoint::default());
        Ok(())
    }

    fn endpoint_unconfigure(&self, ep: EndpointAddress) -> DriverResult<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.script(Op::Unconfigure)?;
        lock.eps.remove(&u8::from(ep));
        Ok(())
    }

    fn endpoint_stall(&self, ep: EndpointAddress, stall: bool) -> DriverResult<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.script(Op::Stall)?;
        let addr = u8::from(ep);
        lock.eps.entry(addr).or_default().stalled = stall;
        if !stall {
            lock.deliver(addr);
        }
        Ok(())
    }

    fn endpoint_transfer(&self, ep: EndpointAddress, data: &mut [u8]) -> DriverResult<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.script(Op::Transfer)?;
        let addr = u8::from(ep);
        let state = lock.eps.entry(addr).or_default();
        let overlap = if ep.is_in() {
            state.payload.replace(data.to_vec()).is_some()
        } else {
            state.armed.replace(data.len()).is_some()
        };
        if overlap {
            lock.overlaps += 1;
        }
        if !ep.is_in() {
            lock.deliver(addr);
        }
        Ok(())
    }

    fn endpoint_transfer_get_result(&self, ep: EndpointAddress, data: &mut [u8]) -> usize {
        let lock = self.inner.lock().unwrap();
        let Some(state) = lock.eps.get(&u8::from(ep)) else {
            return 0;
        };
        if ep.is_in() {
            return state.sent;
        }
        let n = state.received.len().min(data.len());
        data[..n].copy_from_slice(&state.received[..n]);
        n
    }

    fn endpoint_transfer_abort(&self, ep: EndpointAddress) -> DriverResult<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.script(Op::Abort)?;
        let state = lock.eps.entry(u8::from(ep)).or_default();
        state.armed = None;
        state.payload = None;
        Ok(())
    }
}

/// Single LUN media backed by a vector
pub struct RamDisk {
    pub data: Vec<u8>,
    pub present: bool,
    pub write_protected: bool,
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Unit count reported to Get Max LUN, 0 for the configured value
    pub lun_count: u8,
    pub reads: usize,
    pub writes: usize,
    pub started: Option<bool>,
    pub cache: Option<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_count: usize) -> Self {
        Self {
            data: (0..block_count * BLOCK_SIZE).map(|i| (i / BLOCK_SIZE) as u8 ^ i as u8).collect(),
            present: true,
            write_protected: false,
            fail_reads: false,
            fail_writes: false,
            lun_count: 0,
            reads: 0,
            writes: 0,
            started: None,
            cache: Some(vec![0; CACHE_LEN]),
        }
    }

    pub fn block(&self, block: usize) -> &[u8] {
        &self.data[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE]
    }
}

impl MediaProvider for RamDisk {
    type Cache = Vec<u8>;

    fn take_cache(&mut self) -> Option<Self::Cache> {
        self.cache.take()
    }

    fn check_media(&mut self, _lun: u8) -> MediaStatus {
        MediaStatus {
            ready: self.present,
            write_protected: self.write_protected,
        }
    }

    fn capacity(&mut self, _lun: u8) -> Result<Capacity, MediaError> {
        Ok(Capacity {
            block_count: (self.data.len() / BLOCK_SIZE) as u32,
            block_size: BLOCK_SIZE as u32,
        })
    }

    fn read(&mut self, _lun: u8, block: u32, count: u32, buf: &mut [u8]) -> Result<(), MediaError> {
        self.reads += 1;
        if self.fail_reads {
            return Err(MediaError::Failed);
        }
        let start = block as usize * BLOCK_SIZE;
        let len = count as usize * BLOCK_SIZE;
        assert_eq!(len, buf.len());
        buf.copy_from_slice(&self.data[start..start + len]);
        Ok(())
    }

    fn write(&mut self, _lun: u8, block: u32, count: u32, buf: &[u8]) -> Result<(), MediaError> {
        self.writes += 1;
        if self.fail_writes {
            return Err(MediaError::Failed);
        }
        let start = block as usize * BLOCK_SIZE;
        let len = count as usize * BLOCK_SIZE;
        assert_eq!(len, buf.len());
        self.data[start..start + len].copy_from_slice(buf);
        Ok(())
    }

    fn start_stop(&mut self, _lun: u8, start: bool) -> Result<(), MediaError> {
        self.started = Some(start);
        Ok(())
    }

    fn max_lun(&mut self) -> u8 {
        self.lun_count
    }
}

pub type TestUsbd<'a> = Usbd<MockDriver, EndpointRouter<'a>, NoDelay>;
pub type TestScsi<'a> = Scsi<'a, TestUsbd<'a>, RamDisk>;

pub fn config() -> MscConfig<'static> {
    MscConfig {
        ep_bulk_in: EP_NUM,
        ep_bulk_out: EP_NUM,
        inquiry: [InquiryData {
            vendor: "usbd-msc",
            product: "RAM disk",
            revision: "0.1",
        }; 4],
        serial_number: Some("0001"),
        ..Default::default()
    }
}

/// A configured device and the host end of its bulk pipes
pub struct Harness<'a> {
    pub driver: MockDriver,
    pub usbd: &'a TestUsbd<'a>,
    pub flags: &'a EventFlags,
    pub scsi: TestScsi<'a>,
}

impl Harness<'_> {
    /// Feeds completions to the engine until the bus is idle
    pub fn pump(&mut self) {
        while let Some((ep, event)) = self.driver.take_completion() {
            self.usbd.signal_endpoint_event(ep, event);
            let flags = self.flags.take();
            self.scsi.handle_event(flags);
        }
    }

    pub fn host_write(&mut self, bytes: &[u8]) {
        self.driver.host_write(ep_out(), bytes);
        self.pump();
    }

    pub fn host_read(&mut self) -> Option<Vec<u8>> {
        let data = self.driver.host_read(ep_in());
        self.pump();
        data
    }

    pub fn send_cbw(&mut self, cbw: bbb::Cbw) {
        self.host_write(&cbw.into_bytes());
    }

    pub fn read_csw(&mut self) -> bbb::Csw {
        let bytes = self.host_read().expect("no CSW");
        bbb::Csw::from_bytes(&bytes)
    }

    /// Host ClearFeature(ENDPOINT_HALT)
    pub fn clear_halt(&mut self, ep: EndpointAddress) {
        self.scsi.endpoint_clear_feature_stall(ep).unwrap();
        self.pump();
    }

    pub fn mass_storage_reset(&mut self) {
        self.scsi.bulk_only_mass_storage_reset();
        self.pump();
    }
}

/// Runs `f` against a freshly configured device
pub fn with_device<F>(config: MscConfig<'static>, disk: RamDisk, f: F)
where
    F: FnOnce(&mut Harness<'_>),
{
    let driver = MockDriver::new();
    let flags = EventFlags::new();
    let router = EndpointRouter::new().route(EP_NUM, &flags);
    let usbd = Usbd::new(0, driver.clone(), router, NoDelay);
    let mut scsi = Scsi::new(&usbd, config, disk).unwrap();
    scsi.initialize().unwrap();
    scsi.configure().unwrap();

    let mut harness = Harness {
        driver,
        usbd: &usbd,
        flags: &flags,
        scsi,
    };
    harness.pump();
    f(&mut harness);
    assert_eq!(0, harness.driver.overlaps());
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
