//! MySQL replica 핸드셰이크 및 binlog 이벤트 스트림 클라이언트
//!
//! 프로세스를 MySQL master의 replica로 등록한 뒤, 같은 연결에서 binlog
//! 이벤트를 하나씩 받아온다.
//! 주요 기능:
//! - replica 등록 (COM_REGISTER_SLAVE)
//! - binlog dump 시작 (COM_BINLOG_DUMP)
//! - 여러 물리 패킷으로 나뉜 이벤트 프레임 재조립
//! - 연결당 하나의 비동기 이벤트 요청
//! - 위치 추적 (ROTATE 이벤트 포함)
//!
//! ```ignore
//! let conn = Connection::connect(ConnectionConfig::from_env()).await?;
//! conn.register_as_slave().await?;
//! conn.begin_dump(DumpOptions::default()).await?;
//! loop {
//!     let frame = conn.fetch_next_event()?.await?;
//!     println!("{:?}", frame.header()?);
//! }
//! ```

pub mod admin;
pub mod auth;
pub mod bridge;
pub mod codec;
pub mod connection;
pub mod dump;
pub mod error;
pub mod events;
pub mod offset;
pub mod protocol;
pub mod reader;
pub mod register;
pub mod transport;

pub use admin::{BinlogStatus, ServerInfo};
pub use bridge::{EventStream, PendingFetch};
pub use connection::{Connection, ConnectionConfig, ConnectionStatus};
pub use dump::DumpOptions;
pub use error::{ReplError, Result};
pub use events::{BinlogFrame, EventFilter, EventHeader, EventType};
pub use offset::{BinlogPosition, PositionTracker};
pub use transport::{MySqlTransport, Transport};
