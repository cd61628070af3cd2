//! USB SCSI

use crate::driver::{EndpointAccess, EndpointEvent, UsbdError};
use crate::fmt::{debug, info, trace, warn};
use crate::media::{MediaError, MediaProvider, MediaStatus};
use crate::msc::{MscConfig, MscError, MAX_LUNS};
use crate::rtos::{ThreadFlags, FLAGS_ERROR};
use crate::transport::bbb::{BulkOnly, DataStage, Stage, CBW_LEN};
use crate::transport::DataDirection;
use core::borrow::BorrowMut;
use core::cmp::min;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

/* SCSI codes */

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const MODE_SENSE_10: u8 = 0x5A;

/* SBC */
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;
const SYNCHRONIZE_CACHE_16: u8 = 0x91;
const READ_12: u8 = 0xA8;
const WRITE_12: u8 = 0xAA;

/* MMC */
const READ_FORMAT_CAPACITIES: u8 = 0x23;

/* VPD pages */
const VPD_SUPPORTED_PAGES: u8 = 0x00;
const VPD_UNIT_SERIAL_NUMBER: u8 = 0x80;

const INQUIRY_LEN: usize = 36;
const SERIAL_NUMBER_LEN: usize = 20;
const REQUEST_SENSE_LEN: usize = 18;

/// Block size every logical unit starts with
const DEFAULT_BLOCK_SIZE: u32 = 512;

/// SCSI command
///
/// Refer to specifications (SPC,SAM,SBC,MMC,etc.)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    /// Operation code not handled by this device
    Unknown(u8),

    /* SPC */
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    StartStopUnit {
        power_condition_modifier: u8,
        start: bool,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },
    /// Answered with the mode parameter header only
    ModeSense6 {
        alloc_len: u8,
    },
    ModeSense10 {
        alloc_len: u16,
    },

    /* SBC */
    ReadCapacity10,
    Read {
        lba: u32,
        len: u32,
    },
    Write {
        lba: u32,
        len: u32,
    },
    SynchronizeCache,

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },
}

pub fn parse_cb(cb: &[u8; 16]) -> ScsiCommand {
    match cb[0] {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        INQUIRY => ScsiCommand::Inquiry {
            evpd: (cb[1] & 0b00000001) != 0,
            page_code: cb[2],
            alloc_len: u16::from_be_bytes([cb[3], cb[4]]),
        },
        REQUEST_SENSE => ScsiCommand::RequestSense { alloc_len: cb[4] },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            power_condition_modifier: cb[3] & 0b00001111,
            start: (cb[4] & 0b00000001) != 0,
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000001) != 0,
        },
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        READ_10 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]) as u32,
        },
        READ_12 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u32::from_be_bytes([cb[6], cb[7], cb[8], cb[9]]),
        },
        WRITE_10 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]) as u32,
        },
        WRITE_12 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u32::from_be_bytes([cb[6], cb[7], cb[8], cb[9]]),
        },
        SYNCHRONIZE_CACHE_10 | SYNCHRONIZE_CACHE_16 => ScsiCommand::SynchronizeCache,
        MODE_SENSE_6 => ScsiCommand::ModeSense6 { alloc_len: cb[4] },
        MODE_SENSE_10 => ScsiCommand::ModeSense10 {
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        opcode => ScsiCommand::Unknown(opcode),
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    IllegalRequest = 0x05,
    DataProtect = 0x07,
}

/// Outcome of the last command of a logical unit, reported by RequestSense
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sense {
    #[default]
    NoError,
    NoMedia,
    WriteFault,
    ReadError,
    IllegalCommand,
    InvalidCdb,
    InvalidParameter,
    WriteProtect,
}

impl Sense {
    pub fn key(self) -> SenseKey {
        match self {
            Self::NoError => SenseKey::NoSense,
            Self::NoMedia => SenseKey::NotReady,
            Self::WriteFault | Self::ReadError => SenseKey::MediumError,
            Self::IllegalCommand | Self::InvalidCdb | Self::InvalidParameter => {
                SenseKey::IllegalRequest
            }
            Self::WriteProtect => SenseKey::DataProtect,
        }
    }

    /// Additional sense code and qualifier
    pub fn asc(self) -> (u8, u8) {
        match self {
            Self::NoError => (0x00, 0x00),
            Self::NoMedia => (0x3A, 0x00),
            Self::WriteFault => (0x03, 0x00),
            Self::ReadError => (0x11, 0x00),
            Self::IllegalCommand => (0x20, 0x00),
            Self::InvalidCdb => (0x24, 0x00),
            Self::InvalidParameter => (0x26, 0x02),
            Self::WriteProtect => (0x27, 0x00),
        }
    }
}

#[derive(Default, Copy, Clone, Debug)]
struct LogicalUnit {
    block_size: u32,
    block_count: u32,
    sense: Sense,
}

/// SCSI USB Mass Storage subclass over Bulk Only Transport
///
/// One instance serves one bulk endpoint pair. It is driven by one worker: either
/// [run](Scsi::run) on its own thread, or [handle_event](Scsi::handle_event) called with
/// the thread flags posted by [Usbd](crate::driver::Usbd).
pub struct Scsi<'a, A, M: MediaProvider> {
    config: MscConfig<'a>,
    transport: BulkOnly<'a, A>,
    media: M,
    cache: Option<M::Cache>,
    luns: [LogicalUnit; MAX_LUNS],
    max_lun: u8,
}

impl<'a, A: EndpointAccess, M: MediaProvider> Scsi<'a, A, M> {
    /// Creates an SCSI over Bulk Only Transport instance
    ///
    /// # Errors
    /// * [InvalidPacketSize](MscError::InvalidPacketSize) unless 8, 16, 32, 64 or 512
    /// * [InvalidMaxLun](MscError::InvalidMaxLun) above 15
    /// * [InvalidEndpoint](MscError::InvalidEndpoint) for endpoint numbers outside 1..=15
    pub fn new(access: &'a A, config: MscConfig<'a>, media: M) -> Result<Self, MscError> {
        if !matches!(config.max_packet_size, 8 | 16 | 32 | 64 | 512) {
            return Err(MscError::InvalidPacketSize);
        }
        if config.max_lun > 15 {
            return Err(MscError::InvalidMaxLun);
        }
        if ![config.ep_bulk_in, config.ep_bulk_out]
            .iter()
            .all(|ep| (1..=15).contains(ep))
        {
            return Err(MscError::InvalidEndpoint);
        }

        Ok(Self {
            transport: BulkOnly::new(
                access,
                config.ep_bulk_in,
                config.ep_bulk_out,
                config.max_packet_size,
            ),
            config,
            media,
            cache: None,
            luns: Default::default(),
            max_lun: min(config.max_lun, MAX_LUNS as u8 - 1),
        })
    }

    pub fn config(&self) -> &MscConfig<'a> {
        &self.config
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn stage(&self) -> Stage {
        self.transport.stage()
    }

    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    /// Pending sense of `lun`
    pub fn sense(&self, lun: u8) -> Option<Sense> {
        self.luns.get(lun as usize).map(|unit| unit.sense)
    }

    /// Resets runtime state and takes the block cache from the media
    ///
    /// # Errors
    /// * [NoCache](MscError::NoCache) if the media has no cache to give
    /// * [CacheTooSmall](MscError::CacheTooSmall) if it does not fit one 512 byte block
    pub fn initialize(&mut self) -> Result<(), MscError> {
        self.transport.clear(Stage::AwaitCbw);
        self.luns = [LogicalUnit {
            block_size: DEFAULT_BLOCK_SIZE,
            ..Default::default()
        }; MAX_LUNS];
        self.max_lun = min(self.config.max_lun, MAX_LUNS as u8 - 1);
        self.media.initialize();

        let mut cache = self.media.take_cache().ok_or(MscError::NoCache)?;
        let len = slice_of(&mut cache).len();
        if len < DEFAULT_BLOCK_SIZE as usize {
            return Err(MscError::CacheTooSmall);
        }
        info!("usb: scsi: Initialized, cache {} bytes", len);
        self.cache = Some(cache);
        Ok(())
    }

    /// Forgets the media geometry and gives the block cache back
    pub fn uninitialize(&mut self) -> Option<M::Cache> {
        for unit in self.luns.iter_mut() {
            unit.block_count = 0;
        }
        self.media.uninitialize();
        info!("usb: scsi: Uninitialized");
        self.cache.take()
    }

    /// Configures the bulk endpoint pair and starts waiting for a CBW
    pub fn configure(&mut self) -> Result<(), UsbdError> {
        let access = self.transport.access();
        let packet_size = self.transport.packet_size();
        access.configure(self.transport.ep_in(), EndpointType::Bulk, packet_size)?;
        access.configure(self.transport.ep_out(), EndpointType::Bulk, packet_size)?;
        self.endpoint_start(self.transport.ep_out());
        Ok(())
    }

    pub fn unconfigure(&mut self) -> Result<(), UsbdError> {
        let access = self.transport.access();
        access.unconfigure(self.transport.ep_in())?;
        access.unconfigure(self.transport.ep_out())
    }

    /// USB bus reset
    pub fn reset(&mut self) {
        self.transport.reset();
        self.clear_sense();
    }

    /// Bulk-Only Mass Storage Reset class request
    pub fn bulk_only_mass_storage_reset(&mut self) {
        self.transport.mass_storage_reset();
        self.clear_sense();
        if !self.transport.access().is_halted(self.transport.ep_out()) {
            self.transport.start_out();
        }
    }

    /// Get Max LUN class request
    ///
    /// The media reports a unit count; 0 falls back to the configured max LUN.
    pub fn get_max_lun(&mut self) -> u8 {
        let max_lun = match self.media.max_lun() {
            0 => self.config.max_lun,
            count if count as usize > MAX_LUNS => MAX_LUNS as u8 - 1,
            count => count - 1,
        };
        self.max_lun = min(max_lun, MAX_LUNS as u8 - 1);
        info!("usb: scsi: Max LUN: {}", self.max_lun);
        self.max_lun
    }

    /// The endpoint was configured by the host
    pub fn endpoint_start(&mut self, ep: EndpointAddress) {
        if ep == self.transport.ep_out() {
            self.transport.arm_cbw();
        }
    }

    /// Host ClearFeature(ENDPOINT_HALT) on one of the bulk endpoints
    ///
    /// A halt held by a phase error stays in place until a mass storage reset.
    pub fn endpoint_clear_feature_stall(&mut self, ep: EndpointAddress) -> Result<(), UsbdError> {
        if ep != self.transport.ep_in() && ep != self.transport.ep_out() {
            return Ok(());
        }
        if self.transport.access().clear_feature_halt(ep)? {
            self.transport.clear_feature_stall(ep);
        }
        Ok(())
    }

    /// Worker loop. Never returns.
    pub fn run<F: ThreadFlags>(&mut self, flags: &F) -> ! {
        loop {
            let events = flags.wait();
            self.handle_event(events);
        }
    }

    /// Handles thread flags posted for this instance. OUT is handled before IN.
    pub fn handle_event(&mut self, flags: u32) {
        if flags & FLAGS_ERROR != 0 {
            return;
        }
        let (_, event) = EndpointEvent::decode(flags);
        if event.contains(EndpointEvent::OUT) {
            self.on_bulk_out();
        }
        if event.contains(EndpointEvent::IN) {
            self.on_bulk_in();
        }
    }

    fn on_bulk_out(&mut self) {
        let stage = self.transport.stage();
        if let Stage::DataOut(cursor) = stage {
            self.memory_write(cursor);
            return;
        }

        let len = self.transport.fetch();
        match stage {
            Stage::AwaitCbw => self.get_cbw(len),
            Stage::Reset => {
                // a short packet is a leftover from before the reset
                self.transport.enter(Stage::AwaitCbw);
                if len == CBW_LEN {
                    self.get_cbw(len);
                } else {
                    debug!("usb: scsi: Dropped {} stale bytes", len);
                    self.transport.arm_cbw();
                }
            }
            Stage::SendCsw => trace!("usb: scsi: Ignored OUT while sending CSW"),
            _ => self.transport.phase_error(UsbDirection::Out),
        }
    }

    fn on_bulk_in(&mut self) {
        match self.transport.stage() {
            Stage::DataIn(cursor) => self.memory_read(cursor),
            _ => self.transport.on_bulk_in(),
        }
    }

    fn get_cbw(&mut self, len: usize) {
        let cbw = match self.transport.accept_cbw(len) {
            Ok(cbw) => cbw,
            Err(_) => {
                warn!("usb: scsi: Invalid CBW, {} bytes", len);
                self.transport.phase_error(UsbDirection::In);
                self.transport.phase_error(UsbDirection::Out);
                return;
            }
        };

        if cbw.lun > self.max_lun || !(1..=16).contains(&cbw.block_len) {
            self.fail(None, Sense::InvalidCdb);
            return;
        }

        let command = parse_cb(&cbw.block);
        debug!("usb: scsi: Command: {:?}", command);

        match command {
            ScsiCommand::TestUnitReady => self.test_unit_ready(),
            ScsiCommand::RequestSense { alloc_len } => self.request_sense(alloc_len as usize),
            ScsiCommand::Inquiry {
                evpd,
                page_code,
                alloc_len,
            } => self.inquiry(evpd, page_code, alloc_len as usize),
            ScsiCommand::StartStopUnit {
                power_condition_modifier,
                start,
            } => self.start_stop_unit(power_condition_modifier, start),
            ScsiCommand::PreventAllowMediumRemoval { prevent } => self.medium_removal(prevent),
            ScsiCommand::ModeSense6 { alloc_len } => self.mode_sense(false, alloc_len as usize),
            ScsiCommand::ModeSense10 { alloc_len } => self.mode_sense(true, alloc_len as usize),
            ScsiCommand::ReadFormatCapacities { alloc_len } => {
                self.read_format_capacities(alloc_len as usize)
            }
            ScsiCommand::ReadCapacity10 => self.read_capacity(),
            ScsiCommand::Read { lba, len } => self.read(lba, len),
            ScsiCommand::Write { lba, len } => self.write(lba, len),
            // media writes are synchronous
            ScsiCommand::SynchronizeCache => self.pass(),
            ScsiCommand::Unknown(opcode) => {
                warn!("usb: scsi: Unsupported command: {}", opcode);
                self.fail(self.declared_direction(), Sense::IllegalCommand);
            }
        }
    }

    /* status */

    fn pass(&mut self) {
        self.set_sense(Sense::NoError);
        self.transport.pass();
    }

    fn fail(&mut self, stall: Option<UsbDirection>, sense: Sense) {
        debug!("usb: scsi: Failed: {:?}", sense);
        self.set_sense(sense);
        self.transport.fail(stall);
    }

    fn set_sense(&mut self, sense: Sense) {
        let lun = self.lun() as usize;
        if let Some(unit) = self.luns.get_mut(lun) {
            unit.sense = sense;
        }
    }

    fn clear_sense(&mut self) {
        for unit in self.luns.iter_mut() {
            unit.sense = Sense::NoError;
        }
    }

    #[inline]
    fn lun(&self) -> u8 {
        self.transport.cbw().lun
    }

    #[inline]
    fn unit(&self) -> LogicalUnit {
        self.luns
            .get(self.lun() as usize)
            .copied()
            .unwrap_or_default()
    }

    fn declared_direction(&self) -> Option<UsbDirection> {
        match self.transport.cbw().direction {
            DataDirection::In => Some(UsbDirection::In),
            DataDirection::Out => Some(UsbDirection::Out),
            DataDirection::NotExpected => None,
        }
    }

    /* checks */

    fn check_no_data(&mut self) -> bool {
        if self.transport.cbw().data_transfer_len != 0 {
            self.fail(self.declared_direction(), Sense::InvalidCdb);
            return false;
        }
        true
    }

    fn check_data_in(&mut self) -> bool {
        match self.transport.cbw().direction {
            DataDirection::In => true,
            DataDirection::Out => {
                self.fail(Some(UsbDirection::Out), Sense::InvalidCdb);
                false
            }
            DataDirection::NotExpected => {
                self.fail(None, Sense::InvalidCdb);
                false
            }
        }
    }

    fn check_data_out(&mut self) -> bool {
        match self.transport.cbw().direction {
            DataDirection::Out => true,
            DataDirection::In => {
                self.fail(Some(UsbDirection::In), Sense::InvalidCdb);
                false
            }
            DataDirection::NotExpected => {
                self.fail(None, Sense::InvalidCdb);
                false
            }
        }
    }

    /// Media presence gate, fails the command if the media is gone
    ///
    /// `received` is the size of the OUT chunk being handled: bulk-OUT is stalled only if
    /// the host still has more to send.
    fn check_media(&mut self, received: u32) -> Option<MediaStatus> {
        let lun = self.lun();
        let status = self.media.check_media(lun);
        if status.ready {
            return Some(status);
        }

        info!("usb: scsi: No media on LUN {}", lun);
        if let Some(unit) = self.luns.get_mut(lun as usize) {
            unit.block_count = 0;
        }
        let stall = match self.transport.cbw().direction {
            DataDirection::In => Some(UsbDirection::In),
            DataDirection::Out if self.transport.residue() != received => Some(UsbDirection::Out),
            _ => None,
        };
        self.fail(stall, Sense::NoMedia);
        None
    }

    fn refresh_geometry(&mut self) -> Result<LogicalUnit, MediaError> {
        let lun = self.lun();
        let capacity = self.media.capacity(lun)?;
        if capacity.block_size == 0 {
            return Err(MediaError::Failed);
        }
        let unit = self
            .luns
            .get_mut(lun as usize)
            .ok_or(MediaError::Failed)?;
        unit.block_size = capacity.block_size;
        unit.block_count = capacity.block_count;
        trace!(
            "usb: scsi: LUN {}: {} blocks of {}",
            lun,
            capacity.block_count,
            capacity.block_size
        );
        Ok(*unit)
    }

    /// Whole blocks of `block_size` fitting into the cache, in bytes
    fn chunk_capacity(&mut self, block_size: u32) -> usize {
        let block_size = block_size as usize;
        match self.cache.as_mut() {
            Some(cache) if block_size != 0 => slice_of(cache).len() / block_size * block_size,
            _ => 0,
        }
    }

    /* commands */

    fn test_unit_ready(&mut self) {
        if !self.check_no_data() {
            return;
        }
        if self.check_media(0).is_none() {
            return;
        }
        self.pass();
    }

    fn request_sense(&mut self, alloc_len: usize) {
        if !self.check_data_in() {
            return;
        }

        let sense = self.unit().sense;
        let (asc, ascq) = sense.asc();
        let buf = &mut self.transport.buf[..REQUEST_SENSE_LEN];
        buf.fill(0);
        buf[0] = 0x70; // current errors, fixed format
        buf[2] = sense.key().into();
        buf[7] = (REQUEST_SENSE_LEN - 8) as u8;
        buf[12] = asc;
        buf[13] = ascq;

        // reported once
        self.set_sense(Sense::NoError);
        self.transport.data_in(min(REQUEST_SENSE_LEN, alloc_len));
    }

    fn inquiry(&mut self, evpd: bool, page_code: u8, alloc_len: usize) {
        if !self.check_data_in() {
            return;
        }

        let lun = self.lun() as usize;
        match inquiry_data(&mut self.transport.buf, &self.config, lun, evpd, page_code) {
            Some(len) => self.transport.data_in(min(len, alloc_len)),
            None => self.fail(Some(UsbDirection::In), Sense::InvalidParameter),
        }
    }

    fn start_stop_unit(&mut self, power_condition_modifier: u8, start: bool) {
        if !self.check_no_data() {
            return;
        }
        if power_condition_modifier != 0 {
            self.fail(None, Sense::InvalidParameter);
            return;
        }

        let lun = self.lun();
        match self.media.start_stop(lun, start) {
            Err(MediaError::Unsupported) => self.fail(None, Sense::IllegalCommand),
            res => {
                if let Err(err) = res {
                    warn!("usb: scsi: Start/stop of LUN {} failed: {:?}", lun, err);
                }
                self.pass();
            }
        }
    }

    fn medium_removal(&mut self, prevent: bool) {
        if !self.check_no_data() {
            return;
        }
        // the medium can not be locked
        if prevent {
            self.fail(None, Sense::InvalidParameter);
        } else {
            self.pass();
        }
    }

    fn mode_sense(&mut self, ten: bool, alloc_len: usize) {
        if !self.check_data_in() {
            return;
        }
        let Some(status) = self.check_media(0) else {
            return;
        };

        let wp = if status.write_protected { 1 << 7 } else { 0 };
        let buf = &mut self.transport.buf;
        let len = if ten {
            buf[..8].copy_from_slice(&[0x00, 0x06, 0x00, wp, 0x00, 0x00, 0x00, 0x00]);
            8
        } else {
            buf[..4].copy_from_slice(&[0x03, 0x00, wp, 0x00]);
            4
        };
        self.transport.data_in(min(len, alloc_len));
    }

    fn read_format_capacities(&mut self, alloc_len: usize) {
        if !self.check_data_in() {
            return;
        }
        if self.check_media(0).is_none() {
            return;
        }
        let unit = match self.refresh_geometry() {
            Ok(unit) => unit,
            Err(_) => {
                self.fail(Some(UsbDirection::In), Sense::ReadError);
                return;
            }
        };

        let buf = &mut self.transport.buf[..12];
        buf[..4].copy_from_slice(&[0x00, 0x00, 0x00, 0x08]); // capacity list length
        buf[4..8].copy_from_slice(&unit.block_count.to_be_bytes());
        buf[8..12].copy_from_slice(&unit.block_size.to_be_bytes());
        buf[8] = 0x02; // formatted media
        self.transport.data_in(min(12, alloc_len));
    }

    fn read_capacity(&mut self) {
        if !self.check_data_in() {
            return;
        }
        if self.check_media(0).is_none() {
            return;
        }
        let unit = match self.refresh_geometry() {
            Ok(unit) => unit,
            Err(_) => {
                self.fail(Some(UsbDirection::In), Sense::ReadError);
                return;
            }
        };

        let buf = &mut self.transport.buf[..8];
        // last logical block
        buf[..4].copy_from_slice(&unit.block_count.wrapping_sub(1).to_be_bytes());
        buf[4..].copy_from_slice(&unit.block_size.to_be_bytes());
        self.transport.data_in(8);
    }

    fn read(&mut self, lba: u32, count: u32) {
        if let Some(cursor) = self.rw_setup(lba, count, UsbDirection::In) {
            self.memory_read(cursor);
        }
    }

    fn write(&mut self, lba: u32, count: u32) {
        let Some(cursor) = self.rw_setup(lba, count, UsbDirection::Out) else {
            return;
        };

        let chunk = self.chunk_capacity(self.unit().block_size);
        let len = min(cursor.remaining as usize, chunk);
        self.transport.enter(Stage::DataOut(cursor));
        if let Some(cache) = self.cache.as_mut() {
            self.transport.receive(&mut slice_of(cache)[..len]);
        }
    }

    /// Validates a Read or Write and returns the data stage cursor
    fn rw_setup(&mut self, lba: u32, count: u32, dir: UsbDirection) -> Option<DataStage> {
        let status = self.check_media(0)?;

        let mut unit = self.unit();
        if unit.block_count == 0 {
            // geometry not read yet, a failure shows up as an out of range access
            if let Ok(fresh) = self.refresh_geometry() {
                unit = fresh;
            }
        }

        match dir {
            UsbDirection::Out => {
                if status.write_protected {
                    self.fail(Some(UsbDirection::Out), Sense::WriteProtect);
                    return None;
                }
                if !self.check_data_out() {
                    return None;
                }
            }
            UsbDirection::In => {
                if !self.check_data_in() {
                    return None;
                }
            }
        }

        let expected = self.transport.cbw().data_transfer_len;
        let length = match count.checked_mul(unit.block_size) {
            Some(length) if length == expected => length,
            _ => {
                self.fail(self.declared_direction(), Sense::InvalidCdb);
                return None;
            }
        };

        if lba as u64 + count as u64 > unit.block_count as u64
            || self.chunk_capacity(unit.block_size) == 0
        {
            self.fail(Some(dir), Sense::InvalidParameter);
            return None;
        }

        Some(DataStage {
            block: lba,
            offset: 0,
            remaining: length,
        })
    }

    /// Reads the next chunk from the media and sends it
    fn memory_read(&mut self, mut cursor: DataStage) {
        let lun = self.lun();
        let unit = self.unit();
        if cursor.block >= unit.block_count {
            self.fail(Some(UsbDirection::In), Sense::InvalidParameter);
            return;
        }
        if self.check_media(0).is_none() {
            return;
        }

        let block_size = unit.block_size as usize;
        let chunk = self.chunk_capacity(unit.block_size);
        let len = min(cursor.remaining as usize, chunk);
        let count = len.checked_div(block_size).unwrap_or(0) as u32;

        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let cache = slice_of(cache);
        let res = self.media.read(lun, cursor.block, count, &mut cache[..len]);
        if res.is_ok() {
            cursor.block += count;
            cursor.remaining -= len as u32;
            self.transport.consume(len as u32);
            self.transport.enter(if cursor.remaining == 0 {
                Stage::DataInLast
            } else {
                Stage::DataIn(cursor)
            });
            self.transport.send(&mut cache[..len]);
        }

        if let Err(err) = res {
            warn!("usb: scsi: Read of block {} failed: {:?}", cursor.block, err);
            self.fail(Some(UsbDirection::In), Sense::ReadError);
        }
    }

    /// Takes a received chunk, flushes the cache when full and asks for more
    fn memory_write(&mut self, mut cursor: DataStage) {
        let lun = self.lun();
        let unit = self.unit();
        let chunk = self.chunk_capacity(unit.block_size);
        let requested = min(
            cursor.remaining as usize,
            chunk.saturating_sub(cursor.offset),
        );
        let received = match self.cache.as_mut() {
            Some(cache) => {
                let dst = &mut slice_of(cache)[cursor.offset..cursor.offset + requested];
                self.transport.fetch_into(dst)
            }
            None => 0,
        };

        if cursor.block >= unit.block_count || received > requested {
            self.fail(Some(UsbDirection::Out), Sense::InvalidParameter);
            return;
        }
        if self.check_media(received as u32).is_none() {
            return;
        }

        cursor.offset += received;
        cursor.remaining -= received as u32;
        self.transport.consume(received as u32);

        if received != 0 && (cursor.remaining == 0 || cursor.offset == chunk) {
            let block_size = unit.block_size as usize;
            let count = cursor.offset.div_ceil(block_size);
            let res = match self.cache.as_mut() {
                Some(cache) => self.media.write(
                    lun,
                    cursor.block,
                    count as u32,
                    &slice_of(cache)[..count * block_size],
                ),
                None => Err(MediaError::Failed),
            };
            if let Err(err) = res {
                warn!("usb: scsi: Write of block {} failed: {:?}", cursor.block, err);
                self.fail(Some(UsbDirection::Out), Sense::WriteFault);
                return;
            }
            cursor.block += count as u32;
            cursor.offset = 0;
        }

        if cursor.remaining == 0 {
            self.pass();
            return;
        }

        let len = min(cursor.remaining as usize, chunk - cursor.offset);
        self.transport.enter(Stage::DataOut(cursor));
        if let Some(cache) = self.cache.as_mut() {
            self.transport
                .receive(&mut slice_of(cache)[cursor.offset..cursor.offset + len]);
        }
    }
}

/// Fills `buf` with the Inquiry response and returns its length
///
/// `None` for unsupported pages.
fn inquiry_data(
    buf: &mut [u8],
    config: &MscConfig,
    lun: usize,
    evpd: bool,
    page_code: u8,
) -> Option<usize> {
    if evpd {
        return match page_code {
            VPD_SUPPORTED_PAGES => {
                buf[..6].copy_from_slice(&[
                    0x00,
                    VPD_SUPPORTED_PAGES,
                    0x00,
                    2,
                    VPD_SUPPORTED_PAGES,
                    VPD_UNIT_SERIAL_NUMBER,
                ]);
                Some(6)
            }
            VPD_UNIT_SERIAL_NUMBER => {
                buf[..4].copy_from_slice(&[
                    0x00,
                    VPD_UNIT_SERIAL_NUMBER,
                    0x00,
                    SERIAL_NUMBER_LEN as u8,
                ]);
                pad(
                    &mut buf[4..4 + SERIAL_NUMBER_LEN],
                    config.serial_number.unwrap_or(""),
                );
                Some(4 + SERIAL_NUMBER_LEN)
            }
            _ => None,
        };
    }
    if page_code != 0 {
        return None;
    }

    let inquiry = config.inquiry.get(lun).copied().unwrap_or_default();
    buf[..8].copy_from_slice(&[
        0x00, // direct access device
        0x80, // removable medium
        0x00, // no conformance claimed
        0x02, // response data format
        (INQUIRY_LEN - 5) as u8,
        0x00,
        0x00,
        0x00,
    ]);
    pad(&mut buf[8..16], inquiry.vendor);
    pad(&mut buf[16..32], inquiry.product);
    pad(&mut buf[32..INQUIRY_LEN], inquiry.revision);
    Some(INQUIRY_LEN)
}

#[inline]
fn slice_of<C: BorrowMut<[u8]>>(cache: &mut C) -> &mut [u8] {
    cache.borrow_mut()
}

/// Copies ASCII `s` into `dst`, truncated or padded with spaces
fn pad(dst: &mut [u8], s: &str) {
    let len = min(dst.len(), s.len());
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
    dst[len..].fill(b' ');
}
