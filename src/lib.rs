/// Identify Blaustahl devices by USB ID and pick one among several.
pub mod device_ids;

/// Frame commands and move them over USB bulk endpoints.
pub mod transport;

/// Read, write and verify the FRAM array of an open device.
pub mod protocol;

/// An in-memory device that speaks the same protocol, for testing without hardware.
pub mod emulator;

/// Load and store the image files a device's contents are copied from and to.
pub mod image;
