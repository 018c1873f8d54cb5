use crate::device_ids::{DeviceCandidate, Locator, SelectError, UsbId, compatible, select};
use log::{debug, info, trace, warn};
use num_enum::{TryFromPrimitive, TryFromPrimitiveError};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use thiserror::Error;

/// Every transfer in either direction is exactly one frame of this size.
pub const FRAME_SIZE: usize = 64;

/// Bulk OUT endpoint carrying command frames.
pub const ENDPOINT_OUT: u8 = 0x01;
/// Bulk IN endpoint carrying response frames.
pub const ENDPOINT_IN: u8 = 0x82;

pub type Frame = [u8; FRAME_SIZE];

/// Commands understood by the device firmware.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Opcode {
    Nop = 0x00,
    WriteByte = 0x21,
    ReadByte = 0x31,
}

/// One request to the device: an opcode and up to three argument bytes. On the wire this is
/// padded with zeroes out to [FRAME_SIZE].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub args: [u8; 3],
}

impl CommandFrame {
    pub fn new(opcode: Opcode, arg1: u8, arg2: u8, arg3: u8) -> Self {
        Self {
            opcode,
            args: [arg1, arg2, arg3],
        }
    }

    pub fn to_bytes(&self) -> Frame {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = self.opcode as u8;
        frame[1..4].copy_from_slice(&self.args);
        frame
    }

    /// Decode the first four bytes of a frame. Padding is not inspected.
    pub fn parse(frame: &Frame) -> Result<Self, TryFromPrimitiveError<Opcode>> {
        Ok(Self {
            opcode: Opcode::try_from(frame[0])?,
            args: [frame[1], frame[2], frame[3]],
        })
    }
}

/// A frame read back from the device along with how many bytes the transfer actually carried.
/// A zero length means the device had nothing to say yet.
#[derive(Copy, Clone, Debug)]
pub struct Response {
    pub frame: Frame,
    pub len: usize,
}

impl Response {
    pub fn data(&self) -> Option<u8> {
        match self.len {
            0 => None,
            _ => Some(self.frame[0]),
        }
    }
}

/// A request/response channel to one device. There is no acknowledgement, checksum or sequence
/// number; correctness is left to the underlying bus.
pub trait Transport {
    /// Send one complete frame.
    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Receive one frame into `frame`, returning how many bytes were transferred.
    fn receive_frame(&mut self, frame: &mut Frame) -> Result<usize, Error>;

    fn send_command(&mut self, command: CommandFrame) -> Result<(), Error> {
        trace!(
            "send cmd [{:02x} {:02x} {:02x} {:02x}]",
            command.opcode as u8, command.args[0], command.args[1], command.args[2]
        );
        self.send_frame(&command.to_bytes())
    }

    fn receive_response(&mut self) -> Result<Response, Error> {
        let mut frame = [0u8; FRAME_SIZE];
        let len = self.receive_frame(&mut frame)?;
        trace!("read {len} bytes [{:02x}]", frame[0]);
        Ok(Response { frame, len })
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        (**self).send_frame(frame)
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<usize, Error> {
        (**self).receive_frame(frame)
    }
}

/// An open Blaustahl on the USB bus. The only way to get one is [open_device], so holding one
/// means selection succeeded. The handle is released when this is dropped.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    locator: Locator,
    timeout: Duration,
}

impl UsbTransport {
    pub fn locator(&self) -> Locator {
        self.locator
    }

    /// A zero timeout makes every transfer block until it completes.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Transport for UsbTransport {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let sent = self
            .handle
            .write_bulk(ENDPOINT_OUT, frame, self.timeout)
            .map_err(|e| Error::Usb {
                source: e,
                action: "sending command frame",
            })?;

        if sent != FRAME_SIZE {
            return Err(Error::ShortWrite {
                expected: FRAME_SIZE,
                actual: sent,
            });
        }

        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<usize, Error> {
        self.handle
            .read_bulk(ENDPOINT_IN, frame, self.timeout)
            .map_err(|e| Error::Usb {
                source: e,
                action: "reading response frame",
            })
    }
}

/// Describe every device on the bus, compatible or not.
fn enumerate(context: &Context) -> Result<Vec<(DeviceCandidate, Device<Context>)>, Error> {
    let devices = context.devices().map_err(|e| Error::Usb {
        source: e,
        action: "enumerating devices",
    })?;

    if devices.len() == 0 {
        warn!("no USB devices found");
    }

    let mut found = vec![];
    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(e) => {
                debug!(
                    "Skipping device at bus {} addr {}: {e}",
                    device.bus_number(),
                    device.address()
                );
                continue;
            }
        };

        let candidate = DeviceCandidate {
            id: UsbId {
                vid: desc.vendor_id(),
                pid: desc.product_id(),
            },
            serial_index: desc.serial_number_string_index().unwrap_or(0),
            locator: Locator {
                bus: device.bus_number(),
                address: device.address(),
            },
        };

        found.push((candidate, device));
    }

    Ok(found)
}

/// List every attached Blaustahl without opening any of them.
pub fn list_devices(context: &Context) -> Result<Vec<DeviceCandidate>, Error> {
    let candidates: Vec<DeviceCandidate> = enumerate(context)?
        .into_iter()
        .map(|(candidate, _)| candidate)
        .collect();
    Ok(compatible(&candidates).into_iter().cloned().collect())
}

/// Enumerate the bus, log every Blaustahl seen and open exactly one of them according to
/// [select]. Nothing but the selected device is ever opened.
pub fn open_device(
    context: &Context,
    locator: Option<Locator>,
    timeout: Duration,
) -> Result<UsbTransport, Error> {
    let found = enumerate(context)?;
    let candidates: Vec<DeviceCandidate> = found.iter().map(|(c, _)| c.clone()).collect();
    let selected = select(&candidates, locator)?.locator;

    let (_, device) = found
        .iter()
        .find(|(c, _)| c.locator == selected)
        .ok_or(SelectError::NoMatchingLocator(selected))?;

    info!("using {selected}");
    let handle = device.open().map_err(|e| Error::Usb {
        source: e,
        action: "opening device",
    })?;

    Ok(UsbTransport {
        handle,
        locator: selected,
        timeout,
    })
}

/// Errors raised while talking to, or finding, a device.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("USB transaction error while {action}")]
    Usb {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("bulk write sent {actual} bytes, expected {expected}")]
    ShortWrite { expected: usize, actual: usize },

    #[error("device selection failed")]
    Select(#[from] SelectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frame_layout() {
        let address: u16 = 0x1abc;
        let [hi, lo] = address.to_be_bytes();
        let frame = CommandFrame::new(Opcode::WriteByte, hi, lo, 0x5a).to_bytes();

        assert_eq!(frame[..4], [0x21, 0x1a, 0xbc, 0x5a]);
        assert!(frame[4..].iter().all(|&b| b == 0));
        assert_eq!(frame.len(), 64);
    }

    #[test]
    fn read_frame_layout() {
        let frame = CommandFrame::new(Opcode::ReadByte, 0x00, 0x07, 0x00).to_bytes();
        assert_eq!(frame[..4], [0x31, 0x00, 0x07, 0x00]);
        assert!(frame[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_frame() {
        let cmd = CommandFrame::new(Opcode::Nop, 1, 2, 3);
        assert_eq!(CommandFrame::parse(&cmd.to_bytes()).unwrap(), cmd);

        let mut bogus = [0u8; FRAME_SIZE];
        bogus[0] = 0x99;
        assert_eq!(CommandFrame::parse(&bogus).unwrap_err().number, 0x99);
    }

    #[test]
    fn empty_response_has_no_data() {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = 0x42;
        assert_eq!(Response { frame, len: 0 }.data(), None);
        assert_eq!(Response { frame, len: 1 }.data(), Some(0x42));
    }
}
