use bytes::{Buf, BufMut, Bytes, BytesMut};


pub fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

pub fn try_get_len_prefixed(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u16()? as usize;
    if buf.remaining() < len {
        anyhow::bail!("buffer truncated: {} bytes announced, {} available", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}
