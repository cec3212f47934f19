//! Replica 연결 관리
//!
//! 연결 상태는 한 방향으로만 진행된다:
//! Idle → Registered → Dumping, 그리고 어느 상태에서든 Closed (종료 상태).

use crate::bridge::Delivery;
use crate::error::{ReplError, Result};
use crate::transport::{MySqlTransport, Transport};
use parking_lot::Mutex;
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// replica로 등록할 때 사용하는 기본 server id
pub const DEFAULT_SERVER_ID: u32 = 1;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub server_id: u32,
    /// TCP 연결 + 인증 제한 시간. 이벤트 읽기에는 적용되지 않는다.
    pub timeout: Duration,
    /// dump 전에 `@master_binlog_checksum`을 설정할지 여부
    pub checksum_aware: bool,
    /// `into_stream` 채널 크기
    pub stream_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            server_id: DEFAULT_SERVER_ID,
            timeout: Duration::from_secs(30),
            checksum_aware: true,
            stream_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_SERVER_ID 환경 변수에서 읽기
    pub fn from_env() -> Self {
        let defaults = ConnectionConfig::default();
        ConnectionConfig {
            hostname: env::var("DB_HOST").unwrap_or(defaults.hostname),
            port: env::var("DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            username: env::var("DB_USER").unwrap_or(defaults.username),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
            server_id: env::var("DB_SERVER_ID")
                .ok()
                .and_then(|id| id.parse().ok())
                .unwrap_or(defaults.server_id),
            ..defaults
        }
    }
}

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Registered,
    Dumping,
    Closed,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    /// 서버가 스트림을 끝냈으면 이후 요청은 모두 EndOfStream
    pub end_of_stream: bool,
    pub shut_down: bool,
    /// 완료 전에 버려진 요청. 다음 요청이 이어받는다.
    pub orphaned: Option<oneshot::Receiver<Delivery>>,
}

/// Replica 연결
///
/// 전송 계층은 비동기 mutex 뒤에 있으며, 이벤트 읽기가 진행 중인 동안에는
/// 그 읽기 작업만 접근한다.
pub struct Connection<T: Transport = MySqlTransport> {
    pub(crate) config: ConnectionConfig,
    pub(crate) transport: Arc<tokio::sync::Mutex<T>>,
    pub(crate) state: Arc<Mutex<SessionState>>,
    pub(crate) in_flight: Arc<AtomicBool>,
    pub(crate) closed_tx: watch::Sender<bool>,
}

impl Connection<MySqlTransport> {
    /// MySQL 서버에 일반 클라이언트로 연결 (상태: Idle)
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        info!("Connecting to {}:{}", config.hostname, config.port);
        let transport = MySqlTransport::connect(&config).await.map_err(|e| {
            warn!("Connection to {}:{} failed: {}", config.hostname, config.port, e);
            e
        })?;
        Ok(Connection::with_transport(config, transport))
    }
}

impl<T: Transport> Connection<T> {
    /// 이미 인증된 전송 계층으로 연결 생성
    pub fn with_transport(config: ConnectionConfig, transport: T) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Connection {
            config,
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            state: Arc::new(Mutex::new(SessionState {
                status: ConnectionStatus::Idle,
                last_error: None,
                end_of_stream: false,
                shut_down: false,
                orphaned: None,
            })),
            in_flight: Arc::new(AtomicBool::new(false)),
            closed_tx,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub(crate) fn expect_status(
        &self,
        operation: &'static str,
        expected: ConnectionStatus,
    ) -> Result<()> {
        let status = self.status();
        if status == ConnectionStatus::Closed {
            return Err(ReplError::Closed);
        }
        if status != expected {
            return Err(ReplError::InvalidState { operation, status });
        }
        Ok(())
    }

    /// 실패를 기록하고 연결을 닫는다. 호출자는 새로 연결해야 한다.
    pub(crate) async fn abandon(&self, err: &ReplError) {
        self.state.lock().last_error = Some(err.server_text());
        if let Err(e) = self.close().await {
            warn!("Failed to shut down abandoned connection: {}", e);
        }
    }

    /// 연결 종료. 진행 중인 이벤트 요청은 `Closed`로 끝난다.
    pub async fn close(&self) -> Result<()> {
        let orphaned = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
            state.status = ConnectionStatus::Closed;
            state.orphaned.take()
        };
        self.closed_tx.send_replace(true);
        drop(orphaned);

        info!("Closing connection to {}:{}", self.config.hostname, self.config.port);
        self.transport.lock().await.shutdown().await
    }
}
