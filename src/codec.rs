//! 패킷 인코딩 (length-encoded string, 고정 폭 little-endian 정수)
//!
//! 등록/덤프 명령 페이로드는 모두 이 writer로 만든다. 모든 쓰기는 한도(limit)
//! 안에서만 허용되며, 넘치면 버퍼를 건드리지 않고 에러를 반환한다.

use crate::error::{ReplError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// 단일 물리 패킷의 최대 페이로드 크기 (2^24 - 1)
pub const MAX_PACKET_PAYLOAD: usize = 0xFF_FFFF;

/// length-encoded 길이 prefix의 인코딩 크기
pub fn length_encoded_size(len: usize) -> usize {
    match len {
        0..=250 => 1,
        251..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 9,
    }
}

/// 한도가 있는 페이로드 writer
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
    limit: usize,
}

impl PacketWriter {
    pub fn with_limit(limit: usize) -> Self {
        PacketWriter {
            buf: BytesMut::with_capacity(limit.min(1024)),
            limit,
        }
    }

    /// 현재 쓰기 커서 (지금까지 쓴 바이트 수)
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    fn ensure_room(&self, additional: usize) -> Result<()> {
        let needed = self.buf.len() + additional;
        if needed > self.limit {
            return Err(ReplError::PayloadTooLarge {
                needed,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// `value`의 하위 `width` 바이트를 little-endian으로 기록
    pub fn store_fixed(&mut self, value: u64, width: usize) -> Result<usize> {
        if !(1..=8).contains(&width) {
            return Err(ReplError::Protocol(format!(
                "invalid fixed integer width: {}",
                width
            )));
        }
        self.ensure_room(width)?;
        self.buf.put_uint_le(value, width);
        Ok(self.position())
    }

    /// 길이 prefix + 원본 바이트 기록
    pub fn put_length_encoded(&mut self, bytes: &[u8]) -> Result<usize> {
        let len = bytes.len();
        self.ensure_room(length_encoded_size(len) + len)?;
        match len {
            0..=250 => self.buf.put_u8(len as u8),
            251..=0xFFFF => {
                self.buf.put_u8(0xfc);
                self.buf.put_u16_le(len as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.buf.put_u8(0xfd);
                self.buf.put_uint_le(len as u64, 3);
            }
            _ => {
                self.buf.put_u8(0xfe);
                self.buf.put_u64_le(len as u64);
            }
        }
        self.buf.put_slice(bytes);
        Ok(self.position())
    }

    /// prefix 없이 원본 바이트 기록 (필드 경계는 패킷 길이로 추론됨)
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure_room(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(self.position())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_encoded_size_boundaries() {
        assert_eq!(length_encoded_size(0), 1);
        assert_eq!(length_encoded_size(250), 1);
        assert_eq!(length_encoded_size(251), 3);
        assert_eq!(length_encoded_size(0xFFFF), 3);
        assert_eq!(length_encoded_size(0x1_0000), 4);
        assert_eq!(length_encoded_size(0xFF_FFFF), 4);
        assert_eq!(length_encoded_size(0x100_0000), 9);
    }

    #[test]
    fn test_store_fixed_little_endian() {
        let mut writer = PacketWriter::with_limit(16);
        assert_eq!(writer.store_fixed(1, 4).unwrap(), 4);
        assert_eq!(writer.store_fixed(3306, 2).unwrap(), 6);
        assert_eq!(&writer.freeze()[..], &[1, 0, 0, 0, 0xEA, 0x0C]);
    }

    #[test]
    fn test_store_fixed_rejects_bad_width() {
        let mut writer = PacketWriter::with_limit(16);
        assert!(writer.store_fixed(1, 0).is_err());
        assert!(writer.store_fixed(1, 9).is_err());
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn test_put_length_encoded_short() {
        let mut writer = PacketWriter::with_limit(64);
        let cursor = writer.put_length_encoded(b"bob").unwrap();
        assert_eq!(cursor, 4);
        assert_eq!(&writer.freeze()[..], &[3, b'b', b'o', b'b']);
    }

    #[test]
    fn test_put_length_encoded_two_byte_prefix() {
        let data = vec![b'x'; 300];
        let mut writer = PacketWriter::with_limit(1024);
        writer.put_length_encoded(&data).unwrap();
        let out = writer.freeze();
        assert_eq!(&out[..3], &[0xfc, 0x2c, 0x01]);
        assert_eq!(out.len(), 303);
    }

    #[test]
    fn test_put_length_encoded_three_byte_prefix() {
        let data = vec![b'y'; 0x1_0000];
        let mut writer = PacketWriter::with_limit(0x1_0000 + 4);
        assert_eq!(writer.put_length_encoded(&data).unwrap(), 0x1_0000 + 4);
        let out = writer.freeze();
        assert_eq!(&out[..4], &[0xfd, 0x00, 0x00, 0x01]);
        assert_eq!(out[4], b'y');
    }

    #[test]
    fn test_put_length_encoded_eight_byte_prefix() {
        let len = MAX_PACKET_PAYLOAD + 1;
        let data = vec![b'z'; len];
        let mut writer = PacketWriter::with_limit(len + 9);
        assert_eq!(writer.put_length_encoded(&data).unwrap(), len + 9);
        let out = writer.freeze();
        assert_eq!(&out[..9], &[0xfe, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(out.len(), len + 9);
    }

    #[test]
    fn test_put_length_encoded_empty() {
        let mut writer = PacketWriter::with_limit(8);
        writer.put_length_encoded(b"").unwrap();
        assert_eq!(&writer.freeze()[..], &[0]);
    }

    #[test]
    fn test_limit_is_enforced_without_partial_write() {
        let mut writer = PacketWriter::with_limit(5);
        writer.store_fixed(7, 4).unwrap();
        let err = writer.put_length_encoded(b"ab").unwrap_err();
        match err {
            ReplError::PayloadTooLarge { needed, limit } => {
                assert_eq!(needed, 7);
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(writer.position(), 4);
    }
}
