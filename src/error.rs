//! Replica 연결 관련 에러 타입

use crate::connection::ConnectionStatus;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplError {
    #[error("MySQL 연결 실패: {0}")]
    ConnectFailed(String),

    #[error("replica 등록 실패: {0}")]
    RegisterFailed(String),

    #[error("binlog dump 시작 실패: {0}")]
    DumpStartFailed(String),

    #[error("binlog 이벤트 읽기 실패: {0}")]
    ReadFailed(String),

    #[error("binlog 스트림이 종료되었습니다")]
    EndOfStream,

    /// 서버가 보낸 ERR 패킷
    #[error("서버 에러 {code}: {message}")]
    Server { code: u16, message: String },

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("I/O 에러: {0}")]
    Io(String),

    #[error("페이로드가 너무 큽니다: {needed} bytes (최대 {limit} bytes)")]
    PayloadTooLarge { needed: usize, limit: usize },

    #[error("{operation}: 현재 상태 {status:?}에서는 호출할 수 없습니다")]
    InvalidState {
        operation: &'static str,
        status: ConnectionStatus,
    },

    #[error("이미 진행 중인 이벤트 요청이 있습니다")]
    FetchInFlight,

    #[error("연결이 닫혔습니다")]
    Closed,

    #[error("쿼리 실행 에러: {0}")]
    Query(String),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReplError {
    /// 서버가 보낸 에러 메시지를 그대로 반환. 서버 에러가 아니면 Display 문자열.
    pub fn server_text(&self) -> String {
        match self {
            ReplError::Server { message, .. } => message.clone(),
            ReplError::ConnectFailed(text)
            | ReplError::RegisterFailed(text)
            | ReplError::DumpStartFailed(text)
            | ReplError::ReadFailed(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ReplError::EndOfStream)
    }
}

impl From<io::Error> for ReplError {
    fn from(err: io::Error) -> Self {
        ReplError::Io(err.to_string())
    }
}

impl From<mysql_async::Error> for ReplError {
    fn from(err: mysql_async::Error) -> Self {
        ReplError::Query(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplError>;
