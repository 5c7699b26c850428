use bytes::{BufMut, BytesMut};

/// Fields inside a payload are separated by a single NUL byte, without a terminator after
///  the last field
pub const FIELD_SEPARATOR: u8 = 0;

pub fn put_nul_joined<S: AsRef<str>>(buf: &mut BytesMut, fields: impl IntoIterator<Item = S>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            buf.put_u8(FIELD_SEPARATOR);
        }
        buf.put_slice(field.as_ref().as_bytes());
    }
}

/// Splits at most `max_fields - 1` times, so the last field keeps any separators it contains
pub fn split_nul(buf: &[u8], max_fields: usize) -> Vec<&[u8]> {
    buf.splitn(max_fields, |&b| b == FIELD_SEPARATOR)
        .collect()
}

pub fn try_get_string(buf: &[u8]) -> anyhow::Result<String> {
    let s = String::from_utf8(buf.to_vec())?;
    Ok(s)
}
