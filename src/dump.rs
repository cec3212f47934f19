//! Binlog dump 세션 (COM_BINLOG_DUMP)
//!
//! see https://dev.mysql.com/doc/internals/en/com-binlog-dump.html

use crate::admin::BinlogStatus;
use crate::codec::{PacketWriter, MAX_PACKET_PAYLOAD};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{ReplError, Result};
use crate::offset::BinlogPosition;
use crate::protocol::Command;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// binlog 매직 헤더 (4 bytes) 바로 다음의 첫 유효 위치
pub const DEFAULT_START_OFFSET: u32 = 4;

/// 더 읽을 이벤트가 없으면 서버가 EOF 패킷을 보내고 스트림을 끝낸다
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

/// 서버에게 이 replica가 체크섬을 처리할 수 있다고 알리는 쿼리
const CHECKSUM_ANNOUNCEMENT: &str = "SET @master_binlog_checksum = @@global.binlog_checksum";

/// ER_UNKNOWN_SYSTEM_VARIABLE. 5.6 이전 서버에는 binlog_checksum이 없다.
const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;

/// dump 시작 옵션
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    pub position: u32,
    /// 빈 문자열이면 서버의 현재 binlog 파일
    pub filename: String,
    pub non_blocking: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            position: DEFAULT_START_OFFSET,
            filename: String::new(),
            non_blocking: false,
        }
    }
}

impl DumpOptions {
    pub fn at(position: u32) -> Self {
        DumpOptions {
            position,
            ..Default::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// 저장해 둔 위치에서 이어 읽기
    pub fn resume_from(position: &BinlogPosition) -> Result<Self> {
        let offset = u32::try_from(position.position).map_err(|_| {
            ReplError::Protocol(format!(
                "Binlog position {} does not fit the 4-byte dump offset",
                position
            ))
        })?;
        Ok(DumpOptions::at(offset).with_filename(position.filename.clone()))
    }

    /// 서버의 현재 binlog 끝에서 시작
    pub fn at_end(status: &BinlogStatus) -> Result<Self> {
        Self::resume_from(&BinlogPosition::new(status.file.clone(), status.position))
    }
}

/// COM_BINLOG_DUMP 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest<'a> {
    pub position: u32,
    pub flags: u16,
    pub server_id: u32,
    pub filename: &'a str,
}

impl<'a> DumpRequest<'a> {
    pub fn new(options: &'a DumpOptions, server_id: u32) -> Self {
        DumpRequest {
            position: options.position,
            flags: if options.non_blocking {
                BINLOG_DUMP_NON_BLOCK
            } else {
                0
            },
            server_id,
            filename: &options.filename,
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + 2 + 4 + self.filename.len()
    }

    /// 파일명에는 길이 prefix가 없다. 서버가 패킷 길이로 경계를 안다.
    pub fn encode(&self) -> Result<Bytes> {
        // 명령 코드 1 byte를 제외한 단일 논리 패킷 한도
        let mut writer = PacketWriter::with_limit(MAX_PACKET_PAYLOAD - 1);
        writer.store_fixed(self.position as u64, 4)?;
        writer.store_fixed(self.flags as u64, 2)?;
        writer.store_fixed(self.server_id as u64, 4)?;
        writer.put_raw(self.filename.as_bytes())?;
        Ok(writer.freeze())
    }
}

impl<T: Transport> Connection<T> {
    /// binlog 스트리밍 시작 (Registered → Dumping)
    ///
    /// 실패하면 `DumpStartFailed`로 서버 메시지를 돌려주고 연결은 Closed가 된다.
    /// 서버에 binlog_checksum 변수가 없으면 체크섬 없이 진행한다.
    pub async fn begin_dump(&self, options: DumpOptions) -> Result<()> {
        self.expect_status("begin_dump", ConnectionStatus::Registered)?;
        if self.in_flight.load(Ordering::Acquire) {
            return Err(ReplError::FetchInFlight);
        }

        let request = DumpRequest::new(&options, self.config.server_id);
        let payload = request.encode()?;

        let sent = {
            let mut transport = self.transport.lock().await;
            // 잠금을 기다리는 동안 다른 호출이 먼저 dump를 시작했을 수 있다
            self.expect_status("begin_dump", ConnectionStatus::Registered)?;

            let mut result = Ok(());
            if self.config.checksum_aware {
                debug!("Announcing checksum awareness: {}", CHECKSUM_ANNOUNCEMENT);
                result = match transport
                    .send_command(Command::Query, CHECKSUM_ANNOUNCEMENT.as_bytes(), false)
                    .await
                {
                    Err(ReplError::Server {
                        code: ER_UNKNOWN_SYSTEM_VARIABLE,
                        message,
                    }) => {
                        warn!("Server has no binlog checksum ({}), continuing without it", message);
                        Ok(())
                    }
                    other => other,
                };
            }
            if result.is_ok() {
                // 이후 읽기가 쿼리 응답이 아니라 스트림 프레임으로 처리되도록
                transport.mark_ready();
                result = transport
                    .send_command(Command::BinlogDump, &payload, true)
                    .await;
            }
            if result.is_ok() {
                let mut state = self.state.lock();
                state.status = ConnectionStatus::Dumping;
                state.end_of_stream = false;
            }
            result
        };

        if let Err(e) = sent {
            let err = ReplError::DumpStartFailed(e.server_text());
            error!("Failed to start binlog dump: {}", e);
            self.abandon(&err).await;
            return Err(err);
        }

        info!(
            "Sent COM_BINLOG_DUMP: file={:?}, position={}, non_blocking={}",
            options.filename, options.position, options.non_blocking
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::transport::testing::ScriptedTransport;

    fn config(checksum_aware: bool) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("10.0.0.5", "bob").with_password("secret");
        config.checksum_aware = checksum_aware;
        config
    }

    #[test]
    fn test_default_dump_request_wire_shape() {
        let options = DumpOptions::default();
        let encoded = DumpRequest::new(&options, 1).encode().unwrap();
        assert_eq!(&encoded[..], &[4, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(encoded.len(), 10);
    }

    #[test]
    fn test_dump_request_with_filename_and_non_blocking() {
        let options = DumpOptions::at(4096)
            .with_filename("mysql-bin.000003")
            .non_blocking();
        let request = DumpRequest::new(&options, 7);
        let encoded = request.encode().unwrap();

        assert_eq!(&encoded[..4], &4096u32.to_le_bytes());
        assert_eq!(&encoded[4..6], &[1, 0]);
        assert_eq!(&encoded[6..10], &[7, 0, 0, 0]);
        assert_eq!(&encoded[10..], b"mysql-bin.000003");
        assert_eq!(encoded.len(), request.encoded_len());
    }

    #[test]
    fn test_resume_from_position() {
        let position = BinlogPosition::new("mysql-bin.000002".to_string(), 1234);
        let options = DumpOptions::resume_from(&position).unwrap();
        assert_eq!(options.position, 1234);
        assert_eq!(options.filename, "mysql-bin.000002");

        let too_far = BinlogPosition::new("mysql-bin.000002".to_string(), u64::from(u32::MAX) + 1);
        assert!(DumpOptions::resume_from(&too_far).is_err());
    }

    #[tokio::test]
    async fn test_begin_dump_before_register_is_invalid_state() {
        let transport = ScriptedTransport::new();
        let conn = Connection::with_transport(config(false), transport.clone());

        assert!(matches!(
            conn.begin_dump(DumpOptions::default()).await,
            Err(ReplError::InvalidState { status: ConnectionStatus::Idle, .. })
        ));
        assert_eq!(conn.status(), ConnectionStatus::Idle);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_dump_transitions_to_dumping() {
        let transport = ScriptedTransport::new();
        let conn = Connection::with_transport(config(false), transport.clone());

        assert_eq!(conn.status(), ConnectionStatus::Idle);
        conn.register_as_slave().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Registered);
        conn.begin_dump(DumpOptions::default()).await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Dumping);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].command, Command::BinlogDump);
        assert!(sent[1].expect_stream);
        assert_eq!(sent[1].payload, vec![4, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(transport.script.lock().ready_marks, 1);
    }

    #[tokio::test]
    async fn test_checksum_announcement_precedes_dump() {
        let transport = ScriptedTransport::new();
        let conn = Connection::with_transport(config(true), transport.clone());

        conn.register_as_slave().await.unwrap();
        conn.begin_dump(DumpOptions::default()).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].command, Command::Query);
        assert_eq!(sent[1].payload, CHECKSUM_ANNOUNCEMENT.as_bytes());
        assert!(!sent[1].expect_stream);
        assert_eq!(sent[2].command, Command::BinlogDump);
    }

    #[tokio::test]
    async fn test_checksum_rejection_closes_connection() {
        let transport = ScriptedTransport::new();
        transport.reply(Ok(())).reply(Err(ReplError::Server {
            code: 1227,
            message: "Access denied; you need (at least one of) the SUPER privilege(s) for this operation".to_string(),
        }));
        let conn = Connection::with_transport(config(true), transport.clone());

        conn.register_as_slave().await.unwrap();
        match conn.begin_dump(DumpOptions::default()).await {
            Err(ReplError::DumpStartFailed(text)) => assert_eq!(
                text,
                "Access denied; you need (at least one of) the SUPER privilege(s) for this operation"
            ),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        // dump 명령은 보내지 않았다
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_server_without_checksum_still_dumps() {
        let transport = ScriptedTransport::new();
        transport.reply(Ok(())).reply(Err(ReplError::Server {
            code: ER_UNKNOWN_SYSTEM_VARIABLE,
            message: "Unknown system variable 'binlog_checksum'".to_string(),
        }));
        let conn = Connection::with_transport(config(true), transport.clone());

        conn.register_as_slave().await.unwrap();
        conn.begin_dump(DumpOptions::default()).await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Dumping);

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].command, Command::Query);
        assert_eq!(sent[2].command, Command::BinlogDump);
        assert_eq!(transport.script.lock().ready_marks, 1);
    }

    #[tokio::test]
    async fn test_dump_rejection_closes_connection() {
        let transport = ScriptedTransport::new();
        transport.reply(Ok(())).reply(Err(ReplError::Io(
            "Connection reset by peer".to_string(),
        )));
        let conn = Connection::with_transport(config(false), transport.clone());

        conn.register_as_slave().await.unwrap();
        assert!(matches!(
            conn.begin_dump(DumpOptions::default()).await,
            Err(ReplError::DumpStartFailed(_))
        ));
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert!(transport.script.lock().shut_down);
    }

    #[tokio::test]
    async fn test_concurrent_begin_dump_sends_one_dump() {
        let transport = ScriptedTransport::new();
        let conn = Connection::with_transport(config(false), transport.clone());
        conn.register_as_slave().await.unwrap();

        let (a, b) = tokio::join!(
            conn.begin_dump(DumpOptions::default()),
            conn.begin_dump(DumpOptions::default())
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(ReplError::InvalidState { status: ConnectionStatus::Dumping, .. })
        ));
        assert_eq!(transport.sent().len(), 2);
    }
}
