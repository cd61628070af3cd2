use usbd_msc::subclass::scsi::ScsiCommand;

const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const MODE_SENSE_10: u8 = 0x5A;
const READ_10: u8 = 0x28;
const READ_CAPACITY_10: u8 = 0x25;
const WRITE_10: u8 = 0x2A;
const READ_12: u8 = 0xA8;
const WRITE_12: u8 = 0xAA;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;
const READ_FORMAT_CAPACITIES: u8 = 0x23;

pub fn cmd_into_bytes(cmd: ScsiCommand) -> Vec<u8> {
    let mut bytes = vec![];
    match cmd {
        ScsiCommand::Unknown(opcode) => {
            bytes.push(opcode);
        }
        ScsiCommand::Inquiry {
            evpd,
            page_code,
            alloc_len,
        } => {
            bytes.push(INQUIRY);
            bytes.push(evpd as u8);
            bytes.push(page_code);
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::TestUnitReady => {
            bytes.extend_from_slice([TEST_UNIT_READY, 0, 0, 0, 0, 0].as_slice());
        }
        ScsiCommand::RequestSense { alloc_len } => {
            bytes.extend_from_slice([REQUEST_SENSE, 0, 0, 0].as_slice());
            bytes.push(alloc_len);
            bytes.push(0);
        }
        ScsiCommand::StartStopUnit {
            power_condition_modifier,
            start,
        } => {
            bytes.extend_from_slice([START_STOP_UNIT, 0, 0].as_slice());
            bytes.push(power_condition_modifier);
            bytes.push(start as u8);
            bytes.push(0);
        }
        ScsiCommand::PreventAllowMediumRemoval { prevent } => {
            bytes.extend_from_slice([PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0].as_slice());
            bytes.push(prevent as u8);
            bytes.push(0);
        }
        ScsiCommand::ModeSense6 { alloc_len } => {
            // all pages, current values
            bytes.extend_from_slice([MODE_SENSE_6, 0, 0x3F, 0].as_slice());
            bytes.push(alloc_len);
            bytes.push(0);
        }
        ScsiCommand::ModeSense10 { alloc_len } => {
            bytes.extend_from_slice([MODE_SENSE_10, 0, 0x3F, 0, 0, 0, 0].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::ReadCapacity10 => {
            bytes.push(READ_CAPACITY_10);
            bytes.extend_from_slice([0; 9].as_slice());
        }
        ScsiCommand::Read { lba, len } => {
            bytes.push(READ_10);
            bytes.push(0);
            bytes.extend_from_slice(lba.to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::Write { lba, len } => {
            bytes.push(WRITE_10);
            bytes.push(0);
            bytes.extend_from_slice(lba.to_be_bytes().as_slice());
            bytes.push(0);
            bytes.extend_from_slice((len as u16).to_be_bytes().as_slice());
            bytes.push(0);
        }
        ScsiCommand::SynchronizeCache => {
            bytes.push(SYNCHRONIZE_CACHE_10);
            bytes.extend_from_slice([0; 9].as_slice());
        }
        ScsiCommand::ReadFormatCapacities { alloc_len } => {
            bytes.push(READ_FORMAT_CAPACITIES);
            bytes.extend_from_slice([0; 6].as_slice());
            bytes.extend_from_slice(alloc_len.to_be_bytes().as_slice());
            bytes.push(0);
        }
        other => panic!("no encoding for {:?}", other),
    }
    bytes
}

/// Read(12) or Write(12), which parse into the same commands as their 10 byte forms
pub fn cmd12_into_bytes(cmd: ScsiCommand) -> Vec<u8> {
    let (opcode, lba, len) = match cmd {
        ScsiCommand::Read { lba, len } => (READ_12, lba, len),
        ScsiCommand::Write { lba, len } => (WRITE_12, lba, len),
        other => panic!("no 12 byte form of {:?}", other),
    };
    let mut bytes = vec![opcode, 0];
    bytes.extend_from_slice(lba.to_be_bytes().as_slice());
    bytes.extend_from_slice(len.to_be_bytes().as_slice());
    bytes.extend_from_slice([0; 2].as_slice());
    bytes
}
