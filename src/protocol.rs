use crate::transport::{self, CommandFrame, Opcode, Transport};
use byteorder::{BE, ByteOrder};
use log::{debug, trace, warn};
use std::io::Write;
use std::num::NonZeroU32;
use thiserror::Error;

/// Size of the FRAM array in bytes. Valid addresses are `0..FRAM_SIZE`.
pub const FRAM_SIZE: usize = 8192;

const DEFAULT_READ_ATTEMPTS: NonZeroU32 = NonZeroU32::new(1000).unwrap();

/// How long [Fram::read_byte] keeps asking for a response while the device answers with empty
/// transfers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Receive attempts per read, counting the one that finally carries data.
    pub max_attempts: NonZeroU32,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }
}

/// One byte that differs between the device and the image it was verified against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u16,
    pub device: u8,
    pub image: u8,
}

/// Outcome of [Fram::verify_image]. Mismatches are a normal result, not an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Number of addresses that were read back and compared.
    pub compared: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn mismatch_count(&self) -> usize {
        self.mismatches.len()
    }

    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// A session with one FRAM device. Owns its transport for as long as it lives, so there is never
/// more than one conversation with the device in flight.
pub struct Fram<T: Transport> {
    transport: T,
    policy: ReadPolicy,
}

impl<T: Transport> Fram<T> {
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, ReadPolicy::default())
    }

    pub fn with_policy(transport: T, policy: ReadPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Store `value` at `address`. The device does not acknowledge writes.
    pub fn write_byte(&mut self, address: u16, value: u8) -> Result<(), Error> {
        let [hi, lo] = encode_address(address)?;
        self.transport
            .send_command(CommandFrame::new(Opcode::WriteByte, hi, lo, value))?;
        Ok(())
    }

    /// Fetch the byte at `address`. Empty responses mean the device is not ready yet and are
    /// retried immediately, up to the session's [ReadPolicy].
    pub fn read_byte(&mut self, address: u16) -> Result<u8, Error> {
        let [hi, lo] = encode_address(address)?;
        self.transport
            .send_command(CommandFrame::new(Opcode::ReadByte, hi, lo, 0))?;

        let max_attempts = self.policy.max_attempts.get();
        for attempt in 1..=max_attempts {
            if let Some(data) = self.transport.receive_response()?.data() {
                if attempt > 1 {
                    trace!("address {address:#06x} ready after {attempt} attempts");
                }
                return Ok(data);
            }
        }

        Err(ProtocolError::DeviceNotReady {
            address,
            attempts: max_attempts,
        }
        .into())
    }

    /// Write `image` starting at address 0, one command per byte. Returns the number of bytes
    /// written.
    pub fn write_image(&mut self, image: &[u8]) -> Result<usize, Error> {
        ensure_fits(image)?;

        for (address, &value) in image.iter().enumerate() {
            self.write_byte(address as u16, value)?;
        }

        debug!("Wrote {} bytes", image.len());
        Ok(image.len())
    }

    /// Read the entire array into `sink`, one byte at a time as each arrives. Always reads
    /// [FRAM_SIZE] bytes.
    pub fn read_image(&mut self, sink: &mut impl Write) -> Result<usize, Error> {
        for address in 0..FRAM_SIZE {
            let data = self.read_byte(address as u16)?;
            sink.write_all(&[data])?;
        }

        debug!("Read {FRAM_SIZE} bytes");
        Ok(FRAM_SIZE)
    }

    /// Compare the device against `image`, starting at address 0. Only the bytes the image
    /// actually has are compared; a shorter image leaves the rest of the array unchecked.
    pub fn verify_image(&mut self, image: &[u8]) -> Result<VerifyReport, Error> {
        ensure_fits(image)?;

        if image.len() < FRAM_SIZE {
            warn!(
                "Image is {} bytes; addresses {:#06x}..{FRAM_SIZE:#06x} will not be verified",
                image.len(),
                image.len()
            );
        }

        let mut report = VerifyReport::default();
        for (address, &expected) in image.iter().enumerate() {
            let address = address as u16;
            let actual = self.read_byte(address)?;
            if actual != expected {
                debug!("Mismatch at {address:#06x}: {actual:02x} != {expected:02x}");
                report.mismatches.push(Mismatch {
                    address,
                    device: actual,
                    image: expected,
                });
            }
            report.compared += 1;
        }

        Ok(report)
    }

    /// Zero the whole array.
    pub fn clear(&mut self) -> Result<(), Error> {
        for address in 0..FRAM_SIZE {
            self.write_byte(address as u16, 0)?;
        }
        Ok(())
    }

    /// Whether every byte of the array is zero. Stops reading at the first byte that isn't.
    pub fn is_blank(&mut self) -> Result<bool, Error> {
        for address in 0..FRAM_SIZE {
            let data = self.read_byte(address as u16)?;
            if data != 0 {
                debug!("First non-zero byte at {address:#06x}: {data:02x}");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn encode_address(address: u16) -> Result<[u8; 2], ProtocolError> {
    if address as usize >= FRAM_SIZE {
        return Err(ProtocolError::AddressOutOfRange(address));
    }

    let mut bytes = [0u8; 2];
    BE::write_u16(&mut bytes, address);
    Ok(bytes)
}

fn ensure_fits(image: &[u8]) -> Result<(), ProtocolError> {
    if image.len() > FRAM_SIZE {
        return Err(ProtocolError::ImageTooLarge {
            len: image.len(),
            capacity: FRAM_SIZE,
        });
    }
    Ok(())
}

/// All errors (protocol and I/O) that can happen during a FRAM operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("FRAM protocol error")]
    ProtocolError(#[from] ProtocolError),

    #[error("device transport error")]
    TransportError(#[from] transport::Error),

    #[error("file I/O error")]
    FileIoError(#[from] std::io::Error),
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("device sent no data for address {address:#06x} after {attempts} attempts")]
    DeviceNotReady { address: u16, attempts: u32 },

    #[error("image is {len} bytes but the device only holds {capacity}")]
    ImageTooLarge { len: usize, capacity: usize },

    #[error("address {0:#06x} is outside the FRAM array")]
    AddressOutOfRange(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatedFram;
    use crate::transport::{FRAME_SIZE, Frame};
    use std::collections::VecDeque;

    /// Replays canned response lengths and records every frame sent.
    struct Scripted {
        sent: Vec<Frame>,
        responses: VecDeque<(usize, u8)>,
        receives: usize,
    }

    impl Scripted {
        fn new(responses: impl IntoIterator<Item = (usize, u8)>) -> Self {
            Self {
                sent: vec![],
                responses: responses.into_iter().collect(),
                receives: 0,
            }
        }
    }

    impl Transport for Scripted {
        fn send_frame(&mut self, frame: &Frame) -> Result<(), transport::Error> {
            self.sent.push(*frame);
            Ok(())
        }

        fn receive_frame(&mut self, frame: &mut Frame) -> Result<usize, transport::Error> {
            self.receives += 1;
            let (len, data) = self.responses.pop_front().unwrap_or((0, 0));
            frame[0] = data;
            Ok(len)
        }
    }

    #[test]
    fn write_byte_sends_one_frame() {
        let mut fram = Fram::new(Scripted::new([]));
        fram.write_byte(0x1234, 0xa5).unwrap();

        let t = fram.into_inner();
        assert_eq!(t.sent.len(), 1);
        assert_eq!(t.sent[0][..4], [0x21, 0x12, 0x34, 0xa5]);
        assert!(t.sent[0][4..].iter().all(|&b| b == 0));
        assert_eq!(t.receives, 0);
    }

    #[test]
    fn read_byte_retries_empty_responses() {
        let n = 7;
        let script = std::iter::repeat_n((0, 0xff), n).chain([(FRAME_SIZE, 0x3c)]);
        let mut fram = Fram::new(Scripted::new(script));

        assert_eq!(fram.read_byte(0x0100).unwrap(), 0x3c);

        let t = fram.into_inner();
        assert_eq!(t.receives, n + 1);
        assert_eq!(t.sent.len(), 1);
        assert_eq!(t.sent[0][..4], [0x31, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn read_byte_gives_up() {
        let policy = ReadPolicy {
            max_attempts: NonZeroU32::new(5).unwrap(),
        };
        let mut fram = Fram::with_policy(Scripted::new([]), policy);

        match fram.read_byte(42) {
            Err(Error::ProtocolError(e)) => assert_eq!(
                e,
                ProtocolError::DeviceNotReady {
                    address: 42,
                    attempts: 5
                }
            ),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fram.transport().receives, 5);
    }

    #[test]
    fn out_of_range_address_is_rejected() {
        let mut fram = Fram::new(Scripted::new([]));
        assert!(matches!(
            fram.write_byte(FRAM_SIZE as u16, 0),
            Err(Error::ProtocolError(ProtocolError::AddressOutOfRange(0x2000)))
        ));
        assert!(matches!(
            fram.read_byte(0xffff),
            Err(Error::ProtocolError(ProtocolError::AddressOutOfRange(0xffff)))
        ));
        assert!(fram.transport().sent.is_empty());
    }

    #[test]
    fn oversized_image_is_rejected_before_any_transfer() {
        let mut fram = Fram::new(EmulatedFram::new());
        let image = vec![0u8; FRAM_SIZE + 1];

        assert!(matches!(
            fram.write_image(&image),
            Err(Error::ProtocolError(ProtocolError::ImageTooLarge { len, capacity: FRAM_SIZE }))
                if len == FRAM_SIZE + 1
        ));
        assert!(matches!(
            fram.verify_image(&image),
            Err(Error::ProtocolError(ProtocolError::ImageTooLarge { .. }))
        ));
        assert_eq!(fram.transport().commands(), 0);
    }

    #[test]
    fn write_then_verify() {
        let image: Vec<u8> = (0..FRAM_SIZE).map(|i| (i * 7 + 3) as u8).collect();
        let mut fram = Fram::new(EmulatedFram::new());

        assert_eq!(fram.write_image(&image).unwrap(), FRAM_SIZE);
        let report = fram.verify_image(&image).unwrap();
        assert!(report.is_match());
        assert_eq!(report.compared, FRAM_SIZE);
    }

    #[test]
    fn verify_reports_each_difference() {
        let mut fram = Fram::new(EmulatedFram::with_data(&[0x11; FRAM_SIZE]));
        let mut image = vec![0x11; FRAM_SIZE];
        image[0] = 0x00;
        image[4000] = 0x12;
        image[FRAM_SIZE - 1] = 0xff;

        let report = fram.verify_image(&image).unwrap();
        assert_eq!(report.mismatch_count(), 3);
        assert_eq!(
            report.mismatches,
            vec![
                Mismatch {
                    address: 0,
                    device: 0x11,
                    image: 0x00
                },
                Mismatch {
                    address: 4000,
                    device: 0x11,
                    image: 0x12
                },
                Mismatch {
                    address: 0x1fff,
                    device: 0x11,
                    image: 0xff
                },
            ]
        );
    }

    #[test]
    fn short_image_verifies_overlap_only() {
        let mut fram = Fram::new(EmulatedFram::with_data(&[0xaa; FRAM_SIZE]));
        let report = fram.verify_image(&[0xaa; 16]).unwrap();

        assert!(report.is_match());
        assert_eq!(report.compared, 16);
        assert_eq!(fram.transport().commands(), 16);
    }

    #[test]
    fn read_image_always_reads_whole_array() {
        let mut fram = Fram::new(EmulatedFram::with_data(b"hello"));
        let mut out = vec![];

        assert_eq!(fram.read_image(&mut out).unwrap(), FRAM_SIZE);
        assert_eq!(out.len(), FRAM_SIZE);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn clear_and_blank_check() {
        let mut fram = Fram::new(EmulatedFram::with_data(&[0x5a; 64]));
        assert!(!fram.is_blank().unwrap());
        // Stopped at the first non-zero byte.
        assert_eq!(fram.transport().commands(), 1);

        fram.clear().unwrap();
        assert!(fram.is_blank().unwrap());
        assert!(fram.transport().memory().iter().all(|&b| b == 0));
    }
}
