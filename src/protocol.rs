//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 bytes 길이 + 1 byte sequence + 페이로드.
//! 페이로드가 0xFFFFFF 바이트 이상이면 여러 물리 패킷으로 나뉘어 전송되며,
//! 길이가 0xFFFFFF 미만인 패킷이 마지막 조각이다.

use crate::codec::MAX_PACKET_PAYLOAD;
use crate::error::{ReplError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{Bytes, BytesMut};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const HEADER_SIZE: usize = 4;

/// 관리 명령어 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Query = 0x03,
    BinlogDump = 0x12,
    RegisterSlave = 0x15,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
    recv_buf: BytesMut,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ReplError::ConnectFailed(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel {
            stream,
            sequence: 0,
            recv_buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// 새 명령을 보내기 전에 sequence를 0으로 되돌린다
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 논리 패킷 하나 읽기 (여러 물리 패킷을 하나로 합침)
    ///
    /// 패킷 경계에서 소켓이 닫히면 `EndOfStream`, 그 외의 실패는 `Io`/`Protocol`.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        self.recv_buf.clear();
        let mut first = true;

        loop {
            let header = self.read_header(first).await?;
            first = false;

            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let sequence = header[3];
            if sequence != self.sequence {
                return Err(ReplError::Protocol(format!(
                    "Packets out of order: expected sequence {}, got {}",
                    self.sequence, sequence
                )));
            }
            self.sequence = sequence.wrapping_add(1);

            let start = self.recv_buf.len();
            self.recv_buf.resize(start + length, 0);
            self.stream
                .read_exact(&mut self.recv_buf[start..])
                .await
                .map_err(|e| ReplError::Io(format!("Failed to read packet body: {}", e)))?;

            trace!("Read physical packet: seq={}, len={}", sequence, length);

            if length < MAX_PACKET_PAYLOAD {
                break;
            }
        }

        // 수신 버퍼와 공유되지 않는 독립된 조각으로 넘긴다
        Ok(self.recv_buf.split().freeze())
    }

    async fn read_header(&mut self, at_boundary: bool) -> Result<[u8; HEADER_SIZE]> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self
                .stream
                .read(&mut header[filled..])
                .await
                .map_err(|e| ReplError::Io(format!("Failed to read packet header: {}", e)))?;
            if n == 0 {
                if filled == 0 && at_boundary {
                    debug!("Server closed the connection");
                    return Err(ReplError::EndOfStream);
                }
                return Err(ReplError::Io(
                    "Connection closed in the middle of a packet".to_string(),
                ));
            }
            filled += n;
        }
        Ok(header)
    }

    /// 패킷 쓰기 (필요하면 여러 물리 패킷으로 분할)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_PAYLOAD).peekable();
        let mut frame = BytesMut::with_capacity(data.len() + HEADER_SIZE);

        if chunks.peek().is_none() {
            self.push_physical(&mut frame, &[]);
        }
        while let Some(chunk) = chunks.next() {
            self.push_physical(&mut frame, chunk);
            // 정확히 최대 크기로 끝나면 빈 패킷으로 종료를 알린다
            if chunks.peek().is_none() && chunk.len() == MAX_PACKET_PAYLOAD {
                self.push_physical(&mut frame, &[]);
            }
        }

        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| ReplError::Io(format!("Failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ReplError::Io(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    fn push_physical(&mut self, frame: &mut BytesMut, chunk: &[u8]) {
        let len = chunk.len() as u32;
        frame.extend_from_slice(&len.to_le_bytes()[..3]);
        frame.extend_from_slice(&[self.sequence]);
        frame.extend_from_slice(chunk);
        self.sequence = self.sequence.wrapping_add(1);
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| ReplError::Io(format!("Failed to shut down socket: {}", e)))
    }
}

/// Greeting 패킷 파싱
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: Option<String>,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            let err = ErrPacket::parse(data)?;
            return Err(ReplError::Server {
                code: err.code,
                message: err.message,
            });
        }

        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read protocol version: {}", e)))?;
        if protocol_version != 10 {
            return Err(ReplError::Protocol(format!(
                "Unsupported protocol version: {}",
                protocol_version
            )));
        }

        let server_version = read_null_terminated_string(&mut cursor)?;

        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read thread ID: {}", e)))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble)
            .map_err(|e| ReplError::Protocol(format!("Failed to read scramble part 1: {}", e)))?;

        // Filler
        ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read filler: {}", e)))?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read capabilities: {}", e)))?;

        let server_collation = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read collation: {}", e)))?;

        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read status: {}", e)))?;

        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read capabilities upper: {}", e)))?;

        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| ReplError::Protocol(format!("Failed to read auth data length: {}", e)))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| ReplError::Protocol(format!("Failed to read reserved: {}", e)))?;

        // Auth plugin data part 2 (최소 13 bytes, 마지막은 null)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        Read::read_exact(&mut cursor, &mut part2)
            .map_err(|e| ReplError::Protocol(format!("Failed to read scramble part 2: {}", e)))?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin = if (cursor.position() as usize) < data.len() {
            Some(read_null_terminated_string(&mut cursor)?)
        } else {
            None
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// ERR 패킷 (0xFF)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return Err(ReplError::Protocol("Malformed ERR packet".to_string()));
        }

        let code = u16::from_le_bytes([data[1], data[2]]);
        let rest = &data[3..];
        let (sql_state, message) = if rest.len() >= 6 && rest[0] == b'#' {
            (
                Some(String::from_utf8_lossy(&rest[1..6]).to_string()),
                &rest[6..],
            )
        } else {
            (None, rest)
        };

        Ok(ErrPacket {
            code,
            sql_state,
            message: String::from_utf8_lossy(message).to_string(),
        })
    }

    pub fn into_error(self) -> ReplError {
        ReplError::Server {
            code: self.code,
            message: self.message,
        }
    }
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| ReplError::Protocol(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| ReplError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 9 bytes 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_test::io::Builder;

    /// 테스트용 물리 패킷 생성
    pub(crate) fn packet(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes()[..3].to_vec();
        out.push(sequence);
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn greeting_payload() -> Vec<u8> {
        let mut data = vec![10];
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data.push(0);
        data.extend_from_slice(&0xF7FFu16.to_le_bytes());
        data.push(33);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0x0008u16.to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        data.extend_from_slice(b"mysql_native_password\0");
        data
    }

    #[test]
    fn test_is_error_packet() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_is_ok_packet() {
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(!is_ok_packet(&[0xFF, 0x01, 0x02]));
    }

    #[test]
    fn test_is_eof_packet() {
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(!is_eof_packet(&[]));
    }

    #[test]
    fn test_err_packet_with_sql_state() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000Could not find first log file name in binary log index file");
        let err = ErrPacket::parse(&data).unwrap();
        assert_eq!(err.code, 1236);
        assert_eq!(err.sql_state.as_deref(), Some("HY000"));
        assert_eq!(
            err.message,
            "Could not find first log file name in binary log index file"
        );
    }

    #[test]
    fn test_err_packet_without_sql_state() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1045u16.to_le_bytes());
        data.extend_from_slice(b"Access denied");
        let err = ErrPacket::parse(&data).unwrap();
        assert_eq!(err.sql_state, None);
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_greeting_parse() {
        let greeting = GreetingPacket::parse(&greeting_payload()).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble.len(), 20);
        assert_eq!(greeting.scramble[8], 9);
        assert_eq!(greeting.auth_plugin.as_deref(), Some("mysql_native_password"));
    }

    #[tokio::test]
    async fn test_read_single_packet() {
        let stream = Builder::new().read(&packet(0, &[0x00, 1, 2, 3])).build();
        let mut channel = PacketChannel::new(stream);
        let data = channel.read_packet().await.unwrap();
        assert_eq!(&data[..], &[0x00, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_reassembles_multi_packet_payload() {
        let first = vec![0xAB; MAX_PACKET_PAYLOAD];
        let stream = Builder::new()
            .read(&packet(0, &first))
            .read(&packet(1, &[0xCD, 0xEF]))
            .build();
        let mut channel = PacketChannel::new(stream);
        let data = channel.read_packet().await.unwrap();
        assert_eq!(data.len(), MAX_PACKET_PAYLOAD + 2);
        assert_eq!(data[0], 0xAB);
        assert_eq!(&data[MAX_PACKET_PAYLOAD..], &[0xCD, 0xEF]);
    }

    #[tokio::test]
    async fn test_read_rejects_out_of_order_sequence() {
        // 헤더만 읽고 멈추므로 본문은 보내지 않는다
        let stream = Builder::new().read(&[0x01, 0x00, 0x00, 0x03]).build();
        let mut channel = PacketChannel::new(stream);
        let err = channel.read_packet().await.unwrap_err();
        assert!(matches!(err, ReplError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_max_payload_ends_with_empty_packet() {
        let full = vec![0x5A; MAX_PACKET_PAYLOAD];
        let stream = Builder::new()
            .read(&packet(0, &full))
            .read(&packet(1, &[]))
            .read(&packet(2, &[0x00, 0x07]))
            .build();
        let mut channel = PacketChannel::new(stream);

        let data = channel.read_packet().await.unwrap();
        assert_eq!(data.len(), MAX_PACKET_PAYLOAD);
        assert!(data.iter().all(|b| *b == 0x5A));

        // 다음 논리 패킷은 이어지는 sequence로 따로 읽힌다
        let next = channel.read_packet().await.unwrap();
        assert_eq!(&next[..], &[0x00, 0x07]);
    }

    #[tokio::test]
    async fn test_write_max_payload_appends_empty_packet() {
        let full = vec![0x5A; MAX_PACKET_PAYLOAD];
        let mut expected = packet(0, &full);
        expected.extend_from_slice(&packet(1, &[]));
        let stream = Builder::new().write(&expected).build();
        let mut channel = PacketChannel::new(stream);
        channel.write_packet(&full).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_is_end_of_stream() {
        let stream = Builder::new().build();
        let mut channel = PacketChannel::new(stream);
        let err = channel.read_packet().await.unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_close_mid_header_is_io_error() {
        let stream = Builder::new().read(&[0x05, 0x00]).build();
        let mut channel = PacketChannel::new(stream);
        let err = channel.read_packet().await.unwrap_err();
        assert!(matches!(err, ReplError::Io(_)));
    }

    #[tokio::test]
    async fn test_write_packet_header_and_sequence() {
        let stream = Builder::new()
            .write(&packet(0, &[0x15, 1, 2]))
            .write(&packet(1, &[0x03]))
            .build();
        let mut channel = PacketChannel::new(stream);
        channel.write_packet(&[0x15, 1, 2]).await.unwrap();
        channel.write_packet(&[0x03]).await.unwrap();
    }
}
