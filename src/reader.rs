//! 이벤트 읽기 (dump 상태에서 프레임 하나씩)

use crate::error::{ReplError, Result};
use crate::events::BinlogFrame;
use crate::protocol::{self, ErrPacket};
use crate::transport::Transport;
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// 프레임 하나를 읽는다. 도착할 때까지 대기하며 자체 timeout은 없다.
///
/// 실패는 `EndOfStream`(서버가 스트림을 정상 종료) 또는 `ReadFailed`
/// 두 가지로만 나뉜다.
pub async fn next_event<T: Transport>(transport: &mut T) -> Result<BinlogFrame> {
    match transport.read_packet().await {
        Ok(packet) => classify(packet),
        Err(ReplError::EndOfStream) => Err(ReplError::EndOfStream),
        Err(ReplError::Server { message, .. }) => Err(ReplError::ReadFailed(message)),
        Err(ReplError::ReadFailed(text)) => Err(ReplError::ReadFailed(text)),
        Err(other) => {
            warn!("Binlog read failed: {}", other);
            Err(ReplError::ReadFailed(other.to_string()))
        }
    }
}

/// 읽은 패킷의 첫 바이트로 프레임/에러/EOF를 구분한다
pub fn classify(packet: Bytes) -> Result<BinlogFrame> {
    match packet.first() {
        None => Err(ReplError::ReadFailed("Received an empty packet".to_string())),
        Some(0x00) => {
            trace!("Received binlog frame: {} bytes", packet.len());
            Ok(BinlogFrame::new(packet))
        }
        Some(0xFF) => {
            let err = ErrPacket::parse(&packet)
                .map_err(|e| ReplError::ReadFailed(e.to_string()))?;
            warn!("Server sent error during binlog stream: {} ({})", err.message, err.code);
            Err(ReplError::ReadFailed(err.message))
        }
        Some(_) if protocol::is_eof_packet(&packet) => {
            debug!("Received EOF packet - stream ended");
            Err(ReplError::EndOfStream)
        }
        Some(marker) => Err(ReplError::ReadFailed(format!(
            "Unexpected packet marker 0x{:02x}",
            marker
        ))),
    }
}
