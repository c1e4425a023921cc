//! Big-endian field helpers. Reads return `None` past the end of the buffer.

pub(crate) fn read_u8(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub(crate) fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u16::from_be_bytes)
}

pub(crate) fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
}

pub(crate) fn read_u64_be(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
}

/// Read an unsigned big-endian field of 1, 2 or 4 bytes
pub(crate) fn read_uint_be(data: &[u8], offset: usize, width: usize) -> Option<u64> {
    match width {
        1 => read_u8(data, offset).map(u64::from),
        2 => read_u16_be(data, offset).map(u64::from),
        4 => read_u32_be(data, offset).map(u64::from),
        _ => None,
    }
}

pub(crate) fn write_u16_be(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32_be(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u64_be(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}
