// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

/// Decode a VISIBLE_STRING object. Devices may pad with NULs or append a
/// terminator, everything from the first NUL on is dropped.
pub(crate) fn visible_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[test]
fn test_visible_string() {
    assert_eq!(visible_string(&[]), "");
    assert_eq!(visible_string(&[0; 16]), "");
    assert_eq!(visible_string(b"Product code"), "Product code");
    assert_eq!(visible_string(b"IclA D65\0\0\0junk"), "IclA D65");

    let mut data = [0u8; 80];
    data[..5].copy_from_slice(b"V1.07");
    assert_eq!(visible_string(&data), "V1.07");

    assert_eq!(visible_string(&[0x61, 0xFF, 0x62]), "a\u{FFFD}b");
}
