//! Binlog 처리 위치 추적
//!
//! Binlog 파일명 + 위치로 재시작 지점을 추적한다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치.
//! 저장은 호출자의 몫이며, 여기서는 직렬화 가능한 값만 제공한다.

use crate::dump::DEFAULT_START_OFFSET;
use crate::error::{ReplError, Result};
use crate::events::{BinlogFrame, EventType};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// binlog_checksum=CRC32일 때 이벤트 끝에 붙는 체크섬 크기
pub const CHECKSUM_SIZE: usize = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: String, position: u64) -> Self {
        BinlogPosition { filename, position }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// ROTATE 이벤트 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_binlog_name: String,
}

impl RotateEvent {
    /// ROTATE 이벤트 본문 파싱 (4)
    pub fn parse(body: &[u8], checksum: bool) -> Result<Self> {
        let trailer = if checksum { CHECKSUM_SIZE } else { 0 };
        if body.len() < 8 + trailer {
            return Err(ReplError::Protocol("Invalid rotate event".to_string()));
        }

        let mut cursor = Cursor::new(body);
        let position = cursor.read_u64::<LittleEndian>()?;
        let name_bytes = &body[8..body.len() - trailer];

        Ok(RotateEvent {
            position,
            next_binlog_name: String::from_utf8_lossy(name_bytes).to_string(),
        })
    }
}

/// 받은 프레임으로 현재 위치를 갱신한다
#[derive(Debug, Clone)]
pub struct PositionTracker {
    position: BinlogPosition,
    checksum: bool,
}

impl PositionTracker {
    pub fn new(start: BinlogPosition, checksum: bool) -> Self {
        PositionTracker {
            position: start,
            checksum,
        }
    }

    /// 파일명을 모르는 상태에서 시작 (서버가 첫 ROTATE로 알려준다)
    pub fn from_current(checksum: bool) -> Self {
        Self::new(
            BinlogPosition::new(String::new(), DEFAULT_START_OFFSET as u64),
            checksum,
        )
    }

    pub fn position(&self) -> &BinlogPosition {
        &self.position
    }

    pub fn observe(&mut self, frame: &BinlogFrame) -> Result<()> {
        let header = frame.header()?;

        if header.event_type == EventType::Rotate {
            let rotate = RotateEvent::parse(frame.body(), self.checksum)?;
            debug!(
                "Rotate to {}:{}",
                rotate.next_binlog_name, rotate.position
            );
            self.position = BinlogPosition::new(rotate.next_binlog_name, rotate.position);
            return Ok(());
        }

        // next_pos가 0인 이벤트(가짜 이벤트, heartbeat 등)는 위치를 바꾸지 않는다
        if header.next_pos > 0 {
            self.position.position = header.next_pos as u64;
        }
        Ok(())
    }
}
