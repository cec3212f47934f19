//! 서버 정보 조회 (일반 SQL 연결)
//!
//! replica 연결과 별도로 mysql_async 연결을 열어 binlog 상태나 체크섬 설정을
//! 조회한다. 현재 binlog 끝에서 dump를 시작할 때 쓴다.

use crate::connection::ConnectionConfig;
use crate::error::{ReplError, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use tracing::{debug, info};

/// Binlog 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: Option<String>,
}

fn build_opts(config: &ConnectionConfig) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(config.hostname.clone())
        .tcp_port(config.port)
        .user(Some(config.username.clone()))
        .pass(Some(config.password.clone()))
        .into()
}

/// 서버 정보 조회용 연결
pub struct ServerInfo {
    conn: Conn,
}

impl ServerInfo {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = Conn::new(build_opts(config))
            .await
            .map_err(|e| ReplError::ConnectFailed(format!("Failed to connect to MySQL: {}", e)))?;
        debug!("Opened admin connection to {}:{}", config.hostname, config.port);
        Ok(ServerInfo { conn })
    }

    /// 현재 binlog 파일과 위치
    ///
    /// 8.4부터는 SHOW BINARY LOG STATUS, 이전 버전은 SHOW MASTER STATUS.
    pub async fn binlog_status(&mut self) -> Result<BinlogStatus> {
        let row: Option<Row> = match self.conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), trying SHOW MASTER STATUS", e);
                self.conn.query_first("SHOW MASTER STATUS").await?
            }
        };

        let row = row.ok_or_else(|| {
            ReplError::Query("No binlog status available; is log_bin enabled?".to_string())
        })?;

        let file: String = row
            .get(0)
            .ok_or_else(|| ReplError::Query("Binlog status has no File column".to_string()))?;
        let position: u64 = row
            .get(1)
            .ok_or_else(|| ReplError::Query("Binlog status has no Position column".to_string()))?;
        let executed_gtid_set = row
            .get::<Option<String>, _>(4)
            .flatten()
            .filter(|set| !set.is_empty());

        info!("Current binlog: {} at position {}", file, position);

        Ok(BinlogStatus {
            file,
            position,
            executed_gtid_set,
        })
    }

    /// binlog_checksum 설정 (NONE이면 None)
    pub async fn binlog_checksum(&mut self) -> Result<Option<String>> {
        let result: Option<(String, String)> = self
            .conn
            .query_first("SHOW GLOBAL VARIABLES LIKE 'binlog_checksum'")
            .await?;

        Ok(result
            .map(|(_, value)| value)
            .filter(|value| !value.eq_ignore_ascii_case("NONE")))
    }

    /// 서버에서 이벤트에 체크섬을 붙이는지 여부
    pub async fn uses_checksum(&mut self) -> Result<bool> {
        Ok(self.binlog_checksum().await?.is_some())
    }

    pub async fn server_id(&mut self) -> Result<u32> {
        let result: Option<u32> = self.conn.query_first("SELECT @@server_id").await?;
        result.ok_or_else(|| ReplError::Query("Failed to query server_id".to_string()))
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_opts() {
        let config = ConnectionConfig::new("10.0.0.5", "repl")
            .with_password("secret")
            .with_port(3307);
        let opts = build_opts(&config);
        assert_eq!(opts.ip_or_hostname(), "10.0.0.5");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("repl"));
        assert_eq!(opts.pass(), Some("secret"));
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_binlog_status_live() {
        let config = ConnectionConfig::from_env();
        let mut info = ServerInfo::connect(&config).await.unwrap();
        let status = info.binlog_status().await.unwrap();
        assert!(!status.file.is_empty());
        assert!(status.position >= 4);
        info.close().await.unwrap();
    }
}
