//! Property-based tests for the FRAM session against the emulated device.
//!
//! Uses `proptest` to generate addresses, values and images and checks that
//! what is written comes back, and that verify counts exactly the bytes that
//! differ.

use blaustahl::emulator::EmulatedFram;
use blaustahl::protocol::{FRAM_SIZE, Fram, Mismatch};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

fn address() -> impl Strategy<Value = u16> {
    0..FRAM_SIZE as u16
}

proptest! {
    /// A byte written at an address is what a later read of that address returns.
    #[test]
    fn write_then_read_byte(addr in address(), value in any::<u8>(), busy in 0u32..4) {
        let mut fram = Fram::new(EmulatedFram::new().with_busy_responses(busy));

        fram.write_byte(addr, value).unwrap();
        prop_assert_eq!(fram.read_byte(addr).unwrap(), value);
        // One write and one read command; busy + 1 receives for the read.
        prop_assert_eq!(fram.transport().commands(), 2);
        prop_assert_eq!(fram.transport().receives(), busy as usize + 1);
    }

    /// Bulk write followed by bulk verify of the same image finds nothing.
    #[test]
    fn write_then_verify_image(image in vec(any::<u8>(), 0..=FRAM_SIZE)) {
        let mut fram = Fram::new(EmulatedFram::with_data(&[0x5a; FRAM_SIZE]));

        prop_assert_eq!(fram.write_image(&image).unwrap(), image.len());
        let report = fram.verify_image(&image).unwrap();
        prop_assert!(report.is_match());
        prop_assert_eq!(report.compared, image.len());
    }

    /// Verify reports exactly the positions that were changed, with both bytes.
    #[test]
    fn verify_counts_each_difference(
        base in vec(any::<u8>(), FRAM_SIZE),
        positions in btree_set(0..FRAM_SIZE, 0..32),
    ) {
        let mut fram = Fram::new(EmulatedFram::with_data(&base));

        let mut image = base.clone();
        for &p in &positions {
            image[p] = !image[p];
        }

        let report = fram.verify_image(&image).unwrap();
        prop_assert_eq!(report.mismatch_count(), positions.len());

        let expected: Vec<Mismatch> = positions
            .iter()
            .map(|&p| Mismatch {
                address: p as u16,
                device: base[p],
                image: !base[p],
            })
            .collect();
        prop_assert_eq!(report.mismatches, expected);
    }
}
