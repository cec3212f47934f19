//! Binlog 이벤트 프레임과 헤더
//!
//! 프레임 = OK 마커 (1 byte, 0x00) + 이벤트 헤더 (19 bytes) + 이벤트 본문.
//! 본문(행 데이터 등)은 해석하지 않는다.

use crate::error::{ReplError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Cursor;

pub const EVENT_HEADER_SIZE: usize = 19;

/// 프레임 앞의 OK 마커 크기
const MARKER_SIZE: usize = 1;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0x00,
    StartV3 = 0x01,
    Query = 0x02,
    Stop = 0x03,
    Rotate = 0x04,
    Intvar = 0x05,
    Load = 0x06,
    Slave = 0x07,
    CreateFile = 0x08,
    AppendBlock = 0x09,
    ExecLoad = 0x0a,
    DeleteFile = 0x0b,
    NewLoad = 0x0c,
    Rand = 0x0d,
    UserVar = 0x0e,
    FormatDescription = 0x0f,
    Xid = 0x10,
    BeginLoadQuery = 0x11,
    ExecuteLoadQuery = 0x12,
    TableMap = 0x13,
    PreGaWriteRows = 0x14,
    PreGaUpdateRows = 0x15,
    PreGaDeleteRows = 0x16,
    WriteRowsV1 = 0x17,
    UpdateRowsV1 = 0x18,
    DeleteRowsV1 = 0x19,
    Incident = 0x1a,
    Heartbeat = 0x1b,
    Ignorable = 0x1c,
    RowsQuery = 0x1d,
    WriteRowsV2 = 0x1e,
    UpdateRowsV2 = 0x1f,
    DeleteRowsV2 = 0x20,
    Gtid = 0x21,
    AnonymousGtid = 0x22,
    PreviousGtids = 0x23,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        use EventType::*;
        match val {
            0x01 => StartV3,
            0x02 => Query,
            0x03 => Stop,
            0x04 => Rotate,
            0x05 => Intvar,
            0x06 => Load,
            0x07 => Slave,
            0x08 => CreateFile,
            0x09 => AppendBlock,
            0x0a => ExecLoad,
            0x0b => DeleteFile,
            0x0c => NewLoad,
            0x0d => Rand,
            0x0e => UserVar,
            0x0f => FormatDescription,
            0x10 => Xid,
            0x11 => BeginLoadQuery,
            0x12 => ExecuteLoadQuery,
            0x13 => TableMap,
            0x14 => PreGaWriteRows,
            0x15 => PreGaUpdateRows,
            0x16 => PreGaDeleteRows,
            0x17 => WriteRowsV1,
            0x18 => UpdateRowsV1,
            0x19 => DeleteRowsV1,
            0x1a => Incident,
            0x1b => Heartbeat,
            0x1c => Ignorable,
            0x1d => RowsQuery,
            0x1e => WriteRowsV2,
            0x1f => UpdateRowsV2,
            0x20 => DeleteRowsV2,
            0x21 => Gtid,
            0x22 => AnonymousGtid,
            0x23 => PreviousGtids,
            _ => Unknown,
        }
    }

    /// 서버 소스에서 쓰는 이벤트 이름
    pub fn name(self) -> &'static str {
        use EventType::*;
        match self {
            Unknown => "UNKNOWN_EVENT",
            StartV3 => "START_EVENT_V3",
            Query => "QUERY_EVENT",
            Stop => "STOP_EVENT",
            Rotate => "ROTATE_EVENT",
            Intvar => "INTVAR_EVENT",
            Load => "LOAD_EVENT",
            Slave => "SLAVE_EVENT",
            CreateFile => "CREATE_FILE_EVENT",
            AppendBlock => "APPEND_BLOCK_EVENT",
            ExecLoad => "EXEC_LOAD_EVENT",
            DeleteFile => "DELETE_FILE_EVENT",
            NewLoad => "NEW_LOAD_EVENT",
            Rand => "RAND_EVENT",
            UserVar => "USER_VAR_EVENT",
            FormatDescription => "FORMAT_DESCRIPTION_EVENT",
            Xid => "XID_EVENT",
            BeginLoadQuery => "BEGIN_LOAD_QUERY_EVENT",
            ExecuteLoadQuery => "EXECUTE_LOAD_QUERY_EVENT",
            TableMap => "TABLE_MAP_EVENT",
            PreGaWriteRows => "PRE_GA_WRITE_ROWS_EVENT",
            PreGaUpdateRows => "PRE_GA_UPDATE_ROWS_EVENT",
            PreGaDeleteRows => "PRE_GA_DELETE_ROWS_EVENT",
            WriteRowsV1 => "WRITE_ROWS_EVENT_V1",
            UpdateRowsV1 => "UPDATE_ROWS_EVENT_V1",
            DeleteRowsV1 => "DELETE_ROWS_EVENT_V1",
            Incident => "INCIDENT_EVENT",
            Heartbeat => "HEARTBEAT_LOG_EVENT",
            Ignorable => "IGNORABLE_LOG_EVENT",
            RowsQuery => "ROWS_QUERY_LOG_EVENT",
            WriteRowsV2 => "WRITE_ROWS_EVENT_V2",
            UpdateRowsV2 => "UPDATE_ROWS_EVENT_V2",
            DeleteRowsV2 => "DELETE_ROWS_EVENT_V2",
            Gtid => "GTID_LOG_EVENT",
            AnonymousGtid => "ANONYMOUS_GTID_LOG_EVENT",
            PreviousGtids => "PREVIOUS_GTIDS_LOG_EVENT",
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    pub event_type: EventType,
    /// 원래 이 이벤트를 기록한 서버
    pub server_id: u32,
    /// 헤더를 포함한 이벤트 전체 길이
    pub event_length: u32,
    /// 다음 이벤트 위치 (0이면 알 수 없음, 예: 가짜 ROTATE)
    pub next_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    /// 마커를 뺀 이벤트 바이트에서 헤더 파싱
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(ReplError::Protocol(format!(
                "Invalid event header: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(EventHeader {
            timestamp: cursor.read_u32::<LittleEndian>()?,
            event_type: EventType::from_u8(cursor.read_u8()?),
            server_id: cursor.read_u32::<LittleEndian>()?,
            event_length: cursor.read_u32::<LittleEndian>()?,
            next_pos: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp as i64, 0).single()
    }
}

/// 서버가 보낸 이벤트 프레임 하나 (여러 물리 패킷을 합친 결과)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogFrame {
    data: Bytes,
}

impl BinlogFrame {
    pub(crate) fn new(data: Bytes) -> Self {
        BinlogFrame { data }
    }

    /// 마커 바이트를 포함한 원본 바이트
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 마커를 뺀 이벤트 바이트 (헤더 + 본문)
    pub fn event_bytes(&self) -> &[u8] {
        &self.data[MARKER_SIZE.min(self.data.len())..]
    }

    pub fn header(&self) -> Result<EventHeader> {
        EventHeader::parse(self.event_bytes())
    }

    /// 헤더 뒤의 본문 바이트
    pub fn body(&self) -> &[u8] {
        let event = self.event_bytes();
        &event[EVENT_HEADER_SIZE.min(event.len())..]
    }
}

/// 이벤트 타입 필터 (include가 있으면 그 목록만, exclude는 항상 제외)
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    include: Option<HashSet<EventType>>,
    exclude: HashSet<EventType>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn include(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.include
            .get_or_insert_with(HashSet::new)
            .extend(types);
        self
    }

    pub fn exclude(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.exclude.extend(types);
        self
    }

    pub fn accepts(&self, event_type: EventType) -> bool {
        if self.exclude.contains(&event_type) {
            return false;
        }
        match &self.include {
            Some(include) => include.contains(&event_type),
            None => true,
        }
    }

    /// 헤더를 읽을 수 없는 프레임은 걸러내지 않는다
    pub fn accepts_frame(&self, frame: &BinlogFrame) -> bool {
        match frame.header() {
            Ok(header) => self.accepts(header.event_type),
            Err(_) => true,
        }
    }
}
