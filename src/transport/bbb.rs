//! Bulk Only Transport (BBB/BOT)
//!
//! Framing of one transaction: a Command Block Wrapper on bulk-OUT, an optional data
//! stage, and a Command Status Wrapper on bulk-IN. The SCSI layer decides what each
//! command does; this module owns the endpoint pair, the transaction stage and the
//! status wrapper.

use crate::driver::EndpointAccess;
use crate::fmt::{info, trace, warn};
use crate::transport::{CommandStatus, DataDirection};
use core::cmp::{max, min};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

pub const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
pub const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// CBW reception and short responses. Fits a high speed bulk packet.
pub(crate) const BULK_BUF_LEN: usize = 512;

/// Wrong size or signature
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidCbwError;

/// Command Block Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    /// Declared command block length. Not validated here.
    pub block_len: u8,
    /// The whole command block, including bytes past `block_len`
    pub block: [u8; 16],
}

impl CommandBlockWrapper {
    pub fn from_le_bytes(value: &[u8]) -> Result<Self, InvalidCbwError> {
        if value.len() != CBW_LEN || !value.starts_with(&CBW_SIGNATURE_LE) {
            return Err(InvalidCbwError);
        }

        let value = &value[4..]; // skip signature
        let data_transfer_len = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
        let mut block = [0u8; 16];
        block.copy_from_slice(&value[11..27]);

        Ok(CommandBlockWrapper {
            tag: u32::from_le_bytes([value[0], value[1], value[2], value[3]]),
            data_transfer_len,
            direction: if data_transfer_len != 0 {
                if (value[8] & (1 << 7)) > 0 {
                    DataDirection::In
                } else {
                    DataDirection::Out
                }
            } else {
                DataDirection::NotExpected
            },
            lun: value[9] & 0b00001111,
            block_len: value[10],
            block,
        })
    }
}

/// Command Status Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn to_le_bytes(&self) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(CSW_SIGNATURE_LE.as_slice());
        csw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        csw[8..12].copy_from_slice(self.data_residue.to_le_bytes().as_slice());
        csw[12] = self.status as u8;
        csw
    }
}

/// Progress of a Read or Write data stage
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataStage {
    /// Next block to read or write
    pub block: u32,
    /// Bytes already in the block cache
    pub offset: usize,
    /// Bytes left to move
    pub remaining: u32,
}

/// Transaction stage
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// The next bulk-OUT packet may be stale
    Reset,
    #[default]
    AwaitCbw,
    /// Streaming blocks to the host
    DataIn(DataStage),
    /// Last data sent, CSW follows
    DataInLast,
    /// Short data sent, bulk-IN gets stalled before the CSW
    DataInLastStall,
    /// Receiving blocks from the host
    DataOut(DataStage),
    SendCsw,
    /// Waiting for a Bulk-Only Mass Storage Reset
    PhaseError,
}

/// Bulk Only Transport over a bulk endpoint pair
pub(crate) struct BulkOnly<'a, A> {
    access: &'a A,
    ep_in: EndpointAddress,
    ep_out: EndpointAddress,
    packet_size: u16,
    stage: Stage,
    cbw: CommandBlockWrapper,
    residue: u32,
    status: CommandStatus,
    /// Stamped CSW, kept until its transfer completes
    csw: Option<[u8; CSW_LEN]>,
    pub(crate) buf: [u8; BULK_BUF_LEN],
}

impl<'a, A: EndpointAccess> BulkOnly<'a, A> {
    pub(crate) fn new(access: &'a A, ep_in: u8, ep_out: u8, packet_size: u16) -> Self {
        Self {
            access,
            ep_in: EndpointAddress::from_parts(ep_in as usize, UsbDirection::In),
            ep_out: EndpointAddress::from_parts(ep_out as usize, UsbDirection::Out),
            packet_size,
            stage: Stage::AwaitCbw,
            cbw: Default::default(),
            residue: 0,
            status: CommandStatus::Passed,
            csw: None,
            buf: [0u8; BULK_BUF_LEN],
        }
    }

    #[inline]
    pub(crate) fn access(&self) -> &'a A {
        self.access
    }

    #[inline]
    pub(crate) fn ep_in(&self) -> EndpointAddress {
        self.ep_in
    }

    #[inline]
    pub(crate) fn ep_out(&self) -> EndpointAddress {
        self.ep_out
    }

    #[inline]
    pub(crate) fn packet_size(&self) -> u16 {
        self.packet_size
    }

    #[inline]
    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    #[inline]
    pub(crate) fn cbw(&self) -> &CommandBlockWrapper {
        &self.cbw
    }

    #[inline]
    pub(crate) fn residue(&self) -> u32 {
        self.residue
    }

    #[inline]
    pub(crate) fn enter(&mut self, stage: Stage) {
        trace!("usb: bbb: Enter stage: {:?}", stage);
        self.stage = stage;
    }

    /// Drops the current transaction without touching the endpoints
    pub(crate) fn clear(&mut self, stage: Stage) {
        self.cbw = Default::default();
        self.residue = 0;
        self.status = CommandStatus::Passed;
        self.csw = None;
        self.enter(stage);
    }

    /// Aborts both endpoints and waits for a fresh CBW
    pub(crate) fn reset(&mut self) {
        info!("usb: bbb: Reset");
        for ep in [self.ep_out, self.ep_in] {
            if let Err(err) = self.access.transfer_abort(ep) {
                warn!("usb: bbb: Abort on {:?} failed: {:?}", ep, err);
            }
        }
        self.clear(Stage::Reset);
    }

    /// Bulk-Only Mass Storage Reset: also lets the host clear phase error halts
    pub(crate) fn mass_storage_reset(&mut self) {
        info!("usb: bbb: Recv mass storage reset");
        self.access.release_halts();
        self.reset();
    }

    /// Arms bulk-OUT for the next CBW if one is expected
    pub(crate) fn start_out(&mut self) {
        if matches!(self.stage, Stage::AwaitCbw | Stage::Reset) {
            self.arm_cbw();
        }
    }

    pub(crate) fn arm_cbw(&mut self) {
        let len = min(max(self.packet_size as usize, CBW_LEN), BULK_BUF_LEN);
        submit(self.access, self.ep_out, &mut self.buf[..len]);
    }

    /// Bytes of the completed bulk-OUT transfer, copied into the bulk buffer
    pub(crate) fn fetch(&mut self) -> usize {
        self.access.transfer_get_result(self.ep_out, &mut self.buf)
    }

    /// Bytes of the completed bulk-OUT transfer, copied into `dst`
    pub(crate) fn fetch_into(&self, dst: &mut [u8]) -> usize {
        self.access.transfer_get_result(self.ep_out, dst)
    }

    /// Starts a transaction from `len` received bytes
    pub(crate) fn accept_cbw(&mut self, len: usize) -> Result<CommandBlockWrapper, InvalidCbwError> {
        let cbw = CommandBlockWrapper::from_le_bytes(&self.buf[..min(len, BULK_BUF_LEN)])?;
        info!("usb: bbb: Recv CBW: {:?}", cbw);
        self.cbw = cbw;
        self.residue = cbw.data_transfer_len;
        self.status = CommandStatus::Passed;
        self.csw = None;
        Ok(cbw)
    }

    /// Accounts `count` bytes moved in the data stage
    pub(crate) fn consume(&mut self, count: u32) {
        self.residue = self.residue.saturating_sub(count);
        trace!("usb: bbb: Data residue: {}", self.residue);
    }

    /// Sends a chunk of data stage bytes
    pub(crate) fn send(&self, data: &mut [u8]) {
        submit(self.access, self.ep_in, data);
    }

    /// Arms reception of a chunk of data stage bytes
    pub(crate) fn receive(&self, data: &mut [u8]) {
        submit(self.access, self.ep_out, data);
    }

    /// Sends the first `len` bytes of the bulk buffer as the whole data stage
    ///
    /// The response is truncated to the length the host asked for. A shorter response
    /// ends with a bulk-IN stall.
    pub(crate) fn data_in(&mut self, len: usize) {
        let mut len = min(len, BULK_BUF_LEN);
        if len as u32 >= self.cbw.data_transfer_len {
            len = self.cbw.data_transfer_len as usize;
            self.enter(Stage::DataInLast);
        } else {
            self.enter(Stage::DataInLastStall);
        }
        self.status = CommandStatus::Passed;
        self.consume(len as u32);
        submit(self.access, self.ep_in, &mut self.buf[..len]);
    }

    pub(crate) fn pass(&mut self) {
        self.status = CommandStatus::Passed;
        self.send_csw();
    }

    /// Fails the command
    ///
    /// With bulk-IN stalled the CSW is only stamped: it goes out once the host clears
    /// the halt.
    pub(crate) fn fail(&mut self, stall: Option<UsbDirection>) {
        self.status = CommandStatus::Failed;
        match stall {
            Some(UsbDirection::In) => {
                self.stall_in_ep();
                self.stamp_csw();
                self.enter(Stage::SendCsw);
            }
            Some(UsbDirection::Out) => {
                self.stall_out_ep();
                self.send_csw();
            }
            None => self.send_csw(),
        }
    }

    /// Stalls `dir` for good: only a mass storage reset lets the host clear it
    pub(crate) fn phase_error(&mut self, dir: UsbDirection) {
        let ep = match dir {
            UsbDirection::In => {
                self.stall_in_ep();
                self.ep_in
            }
            UsbDirection::Out => {
                self.stall_out_ep();
                self.ep_out
            }
        };
        self.access.hold_halt(ep);
        self.status = CommandStatus::PhaseError;
        self.stamp_csw();
        self.enter(Stage::PhaseError);
    }

    pub(crate) fn send_csw(&mut self) {
        self.enter(Stage::SendCsw);
        let (access, ep) = (self.access, self.ep_in);
        let csw = self.stamp_csw();
        submit(access, ep, csw);
    }

    fn stamp_csw(&mut self) -> &mut [u8; CSW_LEN] {
        let csw = CommandStatusWrapper {
            tag: self.cbw.tag,
            data_residue: self.residue,
            status: self.status,
        };
        info!("usb: bbb: CSW: {:?}", csw);
        self.csw.insert(csw.to_le_bytes())
    }

    /// Bulk-IN completion outside of a Read data stage
    pub(crate) fn on_bulk_in(&mut self) {
        match self.stage {
            Stage::DataInLast => self.send_csw(),
            Stage::DataInLastStall => {
                self.stall_in_ep();
                self.stamp_csw();
                self.enter(Stage::SendCsw);
            }
            Stage::SendCsw => {
                self.csw = None;
                self.enter(Stage::AwaitCbw);
                self.arm_cbw();
            }
            stage => trace!("usb: bbb: Ignored IN completion in {:?}", stage),
        }
    }

    /// The host cleared a halt on `ep`
    pub(crate) fn clear_feature_stall(&mut self, ep: EndpointAddress) {
        if ep == self.ep_in {
            if let Some(csw) = self.csw.as_mut() {
                info!("usb: bbb: Resend CSW");
                submit(self.access, ep, csw);
            }
        } else if ep == self.ep_out {
            self.start_out();
        }
    }

    #[inline]
    fn stall_in_ep(&self) {
        info!("usb: bbb: Stall IN ep");
        stall(self.access, self.ep_in);
    }

    #[inline]
    fn stall_out_ep(&self) {
        info!("usb: bbb: Stall OUT ep");
        stall(self.access, self.ep_out);
    }
}

/// A failed submission leaves the stage unresolved until the host recovers
fn submit<A: EndpointAccess>(access: &A, ep: EndpointAddress, data: &mut [u8]) {
    if let Err(err) = access.transfer(ep, data) {
        warn!("usb: bbb: Transfer on {:?} failed: {:?}", ep, err);
    }
}

fn stall<A: EndpointAccess>(access: &A, ep: EndpointAddress) {
    if let Err(err) = access.stall(ep, true) {
        warn!("usb: bbb: Stall on {:?} failed: {:?}", ep, err);
    }
}
