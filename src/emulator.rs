use crate::protocol::FRAM_SIZE;
use crate::transport::{CommandFrame, Error, FRAME_SIZE, Frame, Opcode, Transport};
use byteorder::{BE, ByteOrder};
use log::debug;

/// An in-memory Blaustahl. Decodes command frames the way the firmware does and answers reads,
/// so protocol code can be exercised without hardware.
#[derive(Clone, Debug)]
pub struct EmulatedFram {
    memory: Vec<u8>,
    pending: Option<u8>,
    busy_responses: u32,
    busy_remaining: u32,
    commands: usize,
    receives: usize,
}

impl EmulatedFram {
    /// A device whose array is all zeroes.
    pub fn new() -> Self {
        Self {
            memory: vec![0u8; FRAM_SIZE],
            pending: None,
            busy_responses: 0,
            busy_remaining: 0,
            commands: 0,
            receives: 0,
        }
    }

    /// A device whose array starts with `initial`. Anything past [FRAM_SIZE] is dropped.
    pub fn with_data(initial: &[u8]) -> Self {
        let mut fram = Self::new();
        let len = initial.len().min(FRAM_SIZE);
        fram.memory[..len].copy_from_slice(&initial[..len]);
        fram
    }

    /// Answer each read with `count` empty transfers before the one carrying data.
    pub fn with_busy_responses(mut self, count: u32) -> Self {
        self.busy_responses = count;
        self
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Number of command frames received.
    pub fn commands(&self) -> usize {
        self.commands
    }

    /// Number of response frames requested, empty ones included.
    pub fn receives(&self) -> usize {
        self.receives
    }
}

impl Default for EmulatedFram {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EmulatedFram {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.commands += 1;

        let command = match CommandFrame::parse(frame) {
            Ok(command) => command,
            Err(e) => {
                debug!("Ignoring unknown opcode {:#04x}", e.number);
                return Ok(());
            }
        };

        let address = BE::read_u16(&command.args[0..2]) as usize;
        match command.opcode {
            Opcode::Nop => {}
            Opcode::WriteByte => match self.memory.get_mut(address) {
                Some(cell) => *cell = command.args[2],
                None => debug!("Ignoring write past end of array at {address:#06x}"),
            },
            Opcode::ReadByte => match self.memory.get(address) {
                Some(&data) => {
                    self.pending = Some(data);
                    self.busy_remaining = self.busy_responses;
                }
                None => debug!("Ignoring read past end of array at {address:#06x}"),
            },
        }

        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<usize, Error> {
        self.receives += 1;

        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            return Ok(0);
        }

        match self.pending.take() {
            Some(data) => {
                frame.fill(0);
                frame[0] = data;
                Ok(FRAME_SIZE)
            }
            None => Ok(0),
        }
    }
}
