/// binlog 이벤트 헤더를 출력하는 replica 클라이언트
///
/// 환경 변수:
/// - DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_SERVER_ID: 연결 설정
/// - BINLOG_FILE, BINLOG_POS: 시작 위치 (없으면 현재 파일의 4번 위치)
/// - START_AT_END: 설정되어 있으면 서버의 현재 binlog 끝에서 시작
use binlog_replica::{
    BinlogPosition, Connection, ConnectionConfig, DumpOptions, EventFilter, PositionTracker,
    ServerInfo,
};
use std::env;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ConnectionConfig::from_env();

    let mut server = ServerInfo::connect(&config).await?;
    let checksum = server.uses_checksum().await?;
    let options = if env::var("START_AT_END").is_ok() {
        let status = server.binlog_status().await?;
        DumpOptions::at_end(&status)?
    } else {
        let position = env::var("BINLOG_POS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(binlog_replica::dump::DEFAULT_START_OFFSET);
        DumpOptions::at(position).with_filename(env::var("BINLOG_FILE").unwrap_or_default())
    };
    server.close().await?;

    info!(
        "Connecting to {}:{} as server_id {}",
        config.hostname, config.port, config.server_id
    );

    let conn = Connection::connect(config).await?;
    conn.register_as_slave().await?;

    let mut tracker = PositionTracker::new(
        BinlogPosition::new(options.filename.clone(), options.position as u64),
        checksum,
    );
    conn.begin_dump(options).await?;

    let mut stream = conn.into_stream(EventFilter::all());
    let mut count = 0u64;
    loop {
        match stream.recv().await {
            Ok(frame) => {
                count += 1;
                if let Err(e) = tracker.observe(&frame) {
                    warn!("Failed to track position: {}", e);
                }
                match frame.header() {
                    Ok(header) => info!(
                        "Event #{}: {} size={} pos={}",
                        count,
                        header.event_type.name(),
                        header.event_length,
                        tracker.position()
                    ),
                    Err(e) => warn!("Event #{}: unreadable header: {}", count, e),
                }
            }
            Err(e) if e.is_end_of_stream() => {
                info!("Binlog stream ended at {}", tracker.position());
                break;
            }
            Err(e) => {
                warn!("Binlog stream failed at {}: {}", tracker.position(), e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}
