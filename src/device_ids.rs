use log::info;
use std::fmt::Display;
use thiserror::Error;

/// USB identity every Blaustahl storage device enumerates with.
pub const BLAUSTAHL_ID: UsbId = UsbId {
    vid: 0x16c0,
    pid: 0x05e1,
};

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Position of a device on the host: bus number plus device address. Used to pick one device
/// when several Blaustahls are plugged in at once.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locator {
    pub bus: u8,
    pub address: u8,
}

impl Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bus {} addr {}", self.bus, self.address)
    }
}

/// What enumeration tells us about one attached USB device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub id: UsbId,
    /// Index of the serial number string descriptor, 0 if the device has none.
    pub serial_index: u8,
    pub locator: Locator,
}

impl DeviceCandidate {
    pub fn is_compatible(&self) -> bool {
        self.id == BLAUSTAHL_ID
    }
}

impl Display for DeviceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "vendor {:04x} id {:04x} serial {} {}",
            self.id.vid, self.id.pid, self.serial_index, self.locator
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SelectError {
    #[error("no device with USB ID {id} is attached", id = BLAUSTAHL_ID)]
    NoDevices,

    #[error("no device with USB ID {id} at {0}", id = BLAUSTAHL_ID)]
    NoMatchingLocator(Locator),
}

/// Every Blaustahl among `candidates`, in enumeration order. Each one is logged whether or not it
/// ends up being opened.
pub fn compatible(candidates: &[DeviceCandidate]) -> Vec<&DeviceCandidate> {
    candidates
        .iter()
        .filter(|c| c.is_compatible())
        .inspect(|c| info!("found {c}"))
        .collect()
}

/// Pick the device to open out of everything that was enumerated. Devices with a foreign USB ID
/// are ignored. With a locator, only the device at exactly that bus and address qualifies.
/// Without one, the compatible device with the lowest (bus, address) wins, so the choice does not
/// depend on the order the platform enumerates devices in.
pub fn select(
    candidates: &[DeviceCandidate],
    locator: Option<Locator>,
) -> Result<&DeviceCandidate, SelectError> {
    let matches = compatible(candidates);

    if matches.is_empty() {
        return Err(SelectError::NoDevices);
    }

    match locator {
        Some(wanted) => matches
            .into_iter()
            .find(|c| c.locator == wanted)
            .ok_or(SelectError::NoMatchingLocator(wanted)),
        None => matches
            .into_iter()
            .min_by_key(|c| c.locator)
            .ok_or(SelectError::NoDevices),
    }
}
