//! 클라이언트 프로토콜 전송 계층
//!
//! replica 로직이 사용하는 하위 연결: 인증을 마친 소켓 위에서 관리 명령을
//! 보내고, 논리 패킷을 하나씩 읽는다.

use crate::auth::{self, AuthSwitchRequest, NATIVE_PASSWORD_PLUGIN};
use crate::connection::ConnectionConfig;
use crate::error::{ReplError, Result};
use crate::protocol::{self, Command, ErrPacket, GreetingPacket, PacketChannel};
use bytes::Bytes;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// 전송 계층 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// 새 명령을 보낼 수 있음
    Ready,
    /// 서버가 이벤트를 연속으로 보내는 중
    Streaming,
}

/// replica 세션이 의존하는 전송 계층
pub trait Transport: Send + 'static {
    /// 관리 명령 전송. `expect_stream`이 false면 OK/ERR 응답까지 읽는다.
    fn send_command(
        &mut self,
        command: Command,
        payload: &[u8],
        expect_stream: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// 논리 패킷 하나 읽기 (여러 물리 패킷은 합쳐서 반환)
    fn read_packet(&mut self) -> impl Future<Output = Result<Bytes>> + Send;

    /// 다음 명령 전에 상태를 명시적으로 Ready로 설정
    fn mark_ready(&mut self);

    /// 서버가 마지막으로 보낸 에러 메시지
    fn last_error(&self) -> Option<&str>;

    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// 실제 MySQL 서버와의 전송 계층
pub struct MySqlTransport<S = TcpStream> {
    channel: PacketChannel<S>,
    status: TransportStatus,
    last_error: Option<String>,
    server_version: String,
}

impl MySqlTransport<TcpStream> {
    /// TCP 연결 + greeting + 인증. 실패는 모두 `ConnectFailed`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let attempt = async {
            let channel = PacketChannel::connect(&config.hostname, config.port).await?;
            Self::handshake(channel, &config.username, &config.password).await
        };

        match tokio::time::timeout(config.timeout, attempt).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(ReplError::ConnectFailed(e.server_text())),
            Err(_) => Err(ReplError::ConnectFailed(format!(
                "Timed out after {:?} connecting to {}:{}",
                config.timeout, config.hostname, config.port
            ))),
        }
    }
}

impl<S> MySqlTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// 이미 열린 스트림 위에서 greeting을 받고 인증한다
    pub async fn handshake(
        mut channel: PacketChannel<S>,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let greeting_packet = channel.read_packet().await?;
        let greeting = GreetingPacket::parse(&greeting_packet)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        if let Some(plugin) = greeting.auth_plugin.as_deref() {
            if plugin != NATIVE_PASSWORD_PLUGIN {
                debug!("Server default auth plugin is {}, requesting {}", plugin, NATIVE_PASSWORD_PLUGIN);
            }
        }

        let auth_response = auth::create_handshake_response(
            username,
            password,
            &greeting.scramble,
            greeting.server_collation,
        )?;
        channel.write_packet(&auth_response).await?;

        let mut reply = channel.read_packet().await?;
        if reply.first() == Some(&0xFE) {
            let switch = AuthSwitchRequest::parse(&reply)?;
            if switch.plugin != NATIVE_PASSWORD_PLUGIN {
                return Err(ReplError::Protocol(format!(
                    "Unsupported auth plugin requested by server: {}",
                    switch.plugin
                )));
            }
            debug!("Auth switch to {}", switch.plugin);
            channel
                .write_packet(&auth::create_auth_response(password, &switch.scramble))
                .await?;
            reply = channel.read_packet().await?;
        }

        if protocol::is_error_packet(&reply) {
            return Err(ErrPacket::parse(&reply)?.into_error());
        }
        if !protocol::is_ok_packet(&reply) {
            return Err(ReplError::Protocol(format!(
                "Unexpected authentication reply: 0x{:02x}",
                reply.first().copied().unwrap_or_default()
            )));
        }

        info!("Authentication successful");

        Ok(MySqlTransport {
            channel,
            status: TransportStatus::Ready,
            last_error: None,
            server_version: greeting.server_version,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn status(&self) -> TransportStatus {
        self.status
    }

    fn record(&mut self, err: ReplError) -> ReplError {
        self.last_error = Some(err.server_text());
        err
    }
}

impl<S> Transport for MySqlTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_command(
        &mut self,
        command: Command,
        payload: &[u8],
        expect_stream: bool,
    ) -> Result<()> {
        if self.status != TransportStatus::Ready {
            return Err(self.record(ReplError::Protocol(
                "Commands out of sync; you can't run this command now".to_string(),
            )));
        }

        let mut packet = Vec::with_capacity(payload.len() + 1);
        packet.push(command.code());
        packet.extend_from_slice(payload);

        self.channel.reset_sequence();
        if let Err(e) = self.channel.write_packet(&packet).await {
            return Err(self.record(e));
        }
        debug!("Sent command {:?} ({} bytes)", command, payload.len());

        if expect_stream {
            self.status = TransportStatus::Streaming;
            return Ok(());
        }

        let reply = match self.channel.read_packet().await {
            Ok(reply) => reply,
            Err(e) => return Err(self.record(e)),
        };
        if protocol::is_error_packet(&reply) {
            let err = ErrPacket::parse(&reply)?;
            warn!("Command {:?} rejected: {} ({})", command, err.message, err.code);
            return Err(self.record(err.into_error()));
        }
        if !protocol::is_ok_packet(&reply) {
            return Err(self.record(ReplError::Protocol(format!(
                "Unexpected reply to {:?}: 0x{:02x}",
                command,
                reply.first().copied().unwrap_or_default()
            ))));
        }

        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Bytes> {
        match self.channel.read_packet().await {
            Ok(packet) => Ok(packet),
            Err(e) => Err(self.record(e)),
        }
    }

    fn mark_ready(&mut self) {
        self.status = TransportStatus::Ready;
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.channel.shutdown().await
    }
}
