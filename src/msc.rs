//! Mass storage class instances
//!
//! Configuration, errors and the control-plane entry points of [Scsi] instances kept in a
//! [Registry].

use crate::driver::{EndpointAccess, UsbdError};
use crate::fmt::{debug, info};
use crate::media::MediaProvider;
use crate::registry::{Handle, InvalidHandle, Registry};
use crate::subclass::scsi::Scsi;
use crate::transport::bbb::{
    CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET, CLASS_SPECIFIC_GET_MAX_LUN,
};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Logical units per instance
pub const MAX_LUNS: usize = 4;

/// Standard Inquiry strings of a logical unit
///
/// Longer strings are truncated, shorter ones padded with spaces.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InquiryData<'a> {
    /// 8 characters
    pub vendor: &'a str,
    /// 16 characters
    pub product: &'a str,
    /// 4 characters
    pub revision: &'a str,
}

/// Instance configuration, fixed for the lifetime of the instance
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MscConfig<'a> {
    /// Interface number class requests are addressed to
    pub interface: u8,
    /// Bulk-IN endpoint number
    pub ep_bulk_in: u8,
    /// Bulk-OUT endpoint number
    pub ep_bulk_out: u8,
    /// Bulk max packet size for the speed the device enumerated at
    ///
    /// Allowed values: 8, 16, 32, 64 (full speed) and 512 (high speed).
    pub max_packet_size: u16,
    /// Highest LUN. Values above 3 are clamped to 3.
    pub max_lun: u8,
    pub inquiry: [InquiryData<'a>; MAX_LUNS],
    /// Reported in the unit serial number VPD page, spaces if unset
    pub serial_number: Option<&'a str>,
}

impl Default for MscConfig<'_> {
    fn default() -> Self {
        Self {
            interface: 0,
            ep_bulk_in: 1,
            ep_bulk_out: 1,
            max_packet_size: 64,
            max_lun: 0,
            inquiry: Default::default(),
            serial_number: None,
        }
    }
}

/// Instance construction and lifecycle error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MscError {
    InvalidMaxLun,
    InvalidPacketSize,
    InvalidEndpoint,
    /// The media has no block cache
    NoCache,
    /// The block cache does not fit one block
    CacheTooSmall,
    Usbd(UsbdError),
}

impl From<UsbdError> for MscError {
    fn from(err: UsbdError) -> Self {
        Self::Usbd(err)
    }
}

/// How a control request was handled
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassResponse {
    /// Handled, status stage follows
    Accepted,
    /// Handled, the byte goes out in the data stage
    MaxLun(u8),
    /// Addressed to this instance but malformed, stall EP0
    Rejected,
    /// Not addressed to this instance
    Ignored,
}

impl<'a, A: EndpointAccess, M: MediaProvider> Scsi<'a, A, M> {
    /// Decodes a class request on EP0
    pub fn control_request(&mut self, req: &Request) -> ClassResponse {
        // not interested in this request
        if !(req.request_type == RequestType::Class
            && req.recipient == Recipient::Interface
            && req.index == self.config().interface as u16)
        {
            return ClassResponse::Ignored;
        }

        debug!("usb: msc: Recv ctrl request: {}", req.request);

        match req.request {
            // BOT section 3.1
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET => {
                if req.direction == UsbDirection::Out && req.value == 0 && req.length == 0 {
                    self.bulk_only_mass_storage_reset();
                    ClassResponse::Accepted
                } else {
                    ClassResponse::Rejected
                }
            }
            // BOT section 3.2
            CLASS_SPECIFIC_GET_MAX_LUN => {
                if req.direction == UsbDirection::In && req.value == 0 && req.length == 1 {
                    ClassResponse::MaxLun(self.get_max_lun())
                } else {
                    ClassResponse::Rejected
                }
            }
            _ => ClassResponse::Ignored,
        }
    }
}

/// Control-plane entry points by instance handle
impl<'a, A, M, const N: usize> Registry<Scsi<'a, A, M>, N>
where
    A: EndpointAccess,
    M: MediaProvider,
{
    pub fn bulk_only_mass_storage_reset(
        &mut self,
        handle: Handle<Scsi<'a, A, M>>,
    ) -> Result<(), InvalidHandle> {
        info!("usb: msc: Mass storage reset of {:?}", handle);
        self.get_mut(handle)?.bulk_only_mass_storage_reset();
        Ok(())
    }

    pub fn get_max_lun(&mut self, handle: Handle<Scsi<'a, A, M>>) -> Result<u8, InvalidHandle> {
        Ok(self.get_mut(handle)?.get_max_lun())
    }

    /// Forwards a host ClearFeature(ENDPOINT_HALT)
    ///
    /// The inner result reports the access layer outcome of the unstall.
    pub fn endpoint_clear_feature_stall(
        &mut self,
        handle: Handle<Scsi<'a, A, M>>,
        ep: EndpointAddress,
    ) -> Result<Result<(), UsbdError>, InvalidHandle> {
        Ok(self.get_mut(handle)?.endpoint_clear_feature_stall(ep))
    }
}
