/// Rounds `val` up to the next multiple of `to`, which must be a power of
/// two.
pub fn align(val: u32, to: u32) -> u32 {
    debug_assert!(to.is_power_of_two());
    val.wrapping_add(to - 1) & !(to - 1)
}

/// Packs a four-component file version into the 64-bit ordering key that
/// patch version ranges compare against, most significant component first.
pub fn pack_version(major: u16, minor: u16, build: u16, revision: u16) -> u64 {
    u64::from(major) << 48 | u64::from(minor) << 32 | u64::from(build) << 16 | u64::from(revision)
}

#[test]
fn test_align() {
    assert_eq!(align(0, 4), 0);
    assert_eq!(align(1, 4), 4);
    assert_eq!(align(3, 4), 4);
    assert_eq!(align(4, 4), 4);
    assert_eq!(align(5, 4), 8);
    assert_eq!(align(15, 8), 16);
    assert_eq!(align(16, 8), 16);
}

#[test]
fn test_pack_version() {
    assert_eq!(pack_version(0, 0, 0, 0), 0);
    assert_eq!(pack_version(6, 1, 7600, 16385), 0x0006_0001_1DB0_4001);
    assert!(pack_version(6, 1, 7601, 0) > pack_version(6, 1, 7600, 16385));
}
