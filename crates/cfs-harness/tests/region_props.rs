#![forbid(unsafe_code)]

use cfs_core::{CfsError, Context, HEADER_SIZE, RegionDescriptor};
use cfs_harness::ImageBuilder;
use proptest::prelude::*;

/// A valid image padded with a recognizable byte pattern before the root.
fn patterned_image(extra: usize) -> Vec<u8> {
    let mut b = ImageBuilder::new();
    let root = b.root();
    let filler = (0..extra).map(|i| (i % 251) as u8 + 1).collect::<Vec<u8>>();
    b.xattr(root, "user.filler", filler).expect("xattr");
    b.build().expect("build")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn region_reads_are_exact_or_rejected(
        extra in 0_usize..512,
        offset in 0_u64..1024,
        length in 0_u64..1024,
    ) {
        let image = patterned_image(extra);
        let len = image.len() as u64;
        let ctx = Context::from_bytes(image.clone()).expect("open");
        let desc = RegionDescriptor::new(offset, length);
        let mut buf = vec![0_u8; length as usize];

        let start = HEADER_SIZE + offset;
        let in_bounds = start < len && start + length <= len;
        match ctx.read_region(desc, &mut buf) {
            Ok(bytes) => {
                prop_assert!(in_bounds);
                prop_assert_eq!(bytes, &image[start as usize..(start + length) as usize]);
            }
            Err(err) => {
                prop_assert!(!in_bounds);
                prop_assert!(err.is_corruption(), "unexpected error {}", err);
            }
        }
        prop_assert_eq!(ctx.probe(desc).is_ok(), in_bounds);
    }

    #[test]
    fn extreme_descriptors_never_wrap(
        offset in prop_oneof![Just(u64::MAX), Just(u64::MAX - HEADER_SIZE), any::<u64>()],
        length in prop_oneof![Just(u64::MAX), Just(0_u64), any::<u64>()],
    ) {
        let ctx = Context::from_bytes(patterned_image(64)).expect("open");
        let desc = RegionDescriptor::new(offset, length);
        let len = ctx.len_bytes();
        let fits = HEADER_SIZE
            .checked_add(offset)
            .filter(|start| *start < len)
            .and_then(|start| start.checked_add(length))
            .is_some_and(|end| end <= len);
        match ctx.probe(desc) {
            Ok(range) => {
                prop_assert!(fits);
                prop_assert!(range.end <= len);
            }
            Err(err) => {
                prop_assert!(!fits);
                prop_assert!(matches!(err, CfsError::Corrupted { .. }), "unexpected error: {:?}", err);
            }
        }
    }

    #[test]
    fn short_destinations_are_caller_errors(
        offset in 0_u64..32,
        length in 1_u64..32,
        shortfall in 1_u64..32,
    ) {
        let ctx = Context::from_bytes(patterned_image(128)).expect("open");
        let mut buf = vec![0_u8; length.saturating_sub(shortfall) as usize];
        let err = ctx
            .read_region(RegionDescriptor::new(offset, length), &mut buf)
            .expect_err("destination too small");
        prop_assert!(matches!(err, CfsError::InvalidArgument(_)));
    }
}
