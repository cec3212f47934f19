//! Replica 등록 (COM_REGISTER_SLAVE)
//!
//! 일반 클라이언트 인증이 끝난 직후 이 연결을 replica로 등록한다.
//! 'REPLICATION SLAVE' 권한이 필요하다:
//!
//! ```sql
//! GRANT REPLICATION SLAVE ON *.* TO 'user'@'%';
//! ```

use crate::codec::{length_encoded_size, PacketWriter};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{ReplError, Result};
use crate::protocol::Command;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use tracing::{error, info};

/// 등록 페이로드 최대 크기
pub const MAX_REGISTRATION_PAYLOAD: usize = 1024;

/// 예전 서버가 기대하는 rpl_recovery_rank 자리. 항상 0.
const RPL_RECOVERY_RANK: u32 = 0;

/// master_id 자리. 서버가 채운다.
const MASTER_ID_PLACEHOLDER: u32 = 0;

/// COM_REGISTER_SLAVE 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest<'a> {
    pub server_id: u32,
    pub host: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub port: u16,
}

impl<'a> RegistrationRequest<'a> {
    /// 인코딩된 크기 (전송 전에 계산 가능)
    pub fn encoded_len(&self) -> usize {
        let field = |s: &str| length_encoded_size(s.len()) + s.len();
        4 + field(self.host) + field(self.user) + field(self.password) + 2 + 4 + 4
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = PacketWriter::with_limit(MAX_REGISTRATION_PAYLOAD);
        writer.store_fixed(self.server_id as u64, 4)?;
        writer.put_length_encoded(self.host.as_bytes())?;
        writer.put_length_encoded(self.user.as_bytes())?;
        writer.put_length_encoded(self.password.as_bytes())?;
        writer.store_fixed(self.port as u64, 2)?;
        writer.store_fixed(RPL_RECOVERY_RANK as u64, 4)?;
        writer.store_fixed(MASTER_ID_PLACEHOLDER as u64, 4)?;
        Ok(writer.freeze())
    }
}

impl<T: Transport> Connection<T> {
    /// 이 연결을 replica로 등록 (Idle → Registered)
    ///
    /// 서버가 거부하면 `RegisterFailed`로 서버 메시지를 그대로 돌려주고 연결은
    /// Closed가 된다. 재시도는 하지 않는다. 입력이 너무 길면 아무것도 보내지
    /// 않고 `PayloadTooLarge`를 반환하며 상태는 그대로다.
    pub async fn register_as_slave(&self) -> Result<()> {
        self.expect_status("register_as_slave", ConnectionStatus::Idle)?;
        if self.in_flight.load(Ordering::Acquire) {
            return Err(ReplError::FetchInFlight);
        }

        let request = RegistrationRequest {
            server_id: self.config.server_id,
            host: &self.config.hostname,
            user: &self.config.username,
            password: &self.config.password,
            port: self.config.port,
        };
        let payload = request.encode()?;

        let sent = {
            let mut transport = self.transport.lock().await;
            // 잠금을 기다리는 동안 다른 호출이 먼저 등록했을 수 있다
            self.expect_status("register_as_slave", ConnectionStatus::Idle)?;
            let sent = transport
                .send_command(Command::RegisterSlave, &payload, false)
                .await;
            if sent.is_ok() {
                self.state.lock().status = ConnectionStatus::Registered;
            }
            sent
        };

        if let Err(e) = sent {
            let err = ReplError::RegisterFailed(e.server_text());
            error!("Replica registration failed: {}", e);
            self.abandon(&err).await;
            return Err(err);
        }

        info!(
            "Registered as replica: server_id={}, host={}:{}",
            self.config.server_id, self.config.hostname, self.config.port
        );
        Ok(())
    }
}
