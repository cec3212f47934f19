//! 비동기 이벤트 요청
//!
//! 대기하는 읽기는 별도 tokio task에서 실행하고, 결과는 oneshot 채널을 통해
//! 요청한 쪽으로 정확히 한 번 전달한다. 연결당 동시에 하나의 요청만 허용한다.
//!
//! 진행 중 표시(guard)는 결과와 함께 전달되고 결과를 받는 순간 해제된다.
//! 완료 전에 버려진 요청은 연결에 남아 다음 요청이 이어받으므로 읽은 프레임이
//! 사라지지 않는다.

use crate::connection::{Connection, ConnectionStatus, SessionState};
use crate::error::{ReplError, Result};
use crate::events::{BinlogFrame, EventFilter};
use crate::reader;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 읽기 결과 + 진행 중 표시
pub(crate) type Delivery = (Result<BinlogFrame>, InFlightGuard);

/// 진행 중인 요청 표시. drop되면 해제된다.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReplError::FetchInFlight)?;
        Ok(InFlightGuard {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 아직 완료되지 않은 이벤트 요청
///
/// 결과를 받기 전에 drop하면 (예: `tokio::time::timeout`) 결과는 버려지지 않고
/// 다음 `fetch_next_event`가 이어받는다.
#[must_use = "the fetch result is only delivered by awaiting it"]
pub struct PendingFetch {
    rx: Option<oneshot::Receiver<Delivery>>,
    state: Arc<Mutex<SessionState>>,
}

impl Future for PendingFetch {
    type Output = Result<BinlogFrame>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let rx = match this.rx.as_mut() {
            Some(rx) => rx,
            None => {
                return Poll::Ready(Err(ReplError::ReadFailed(
                    "Fetch result was already delivered".to_string(),
                )))
            }
        };

        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(delivered) => {
                this.rx = None;
                Poll::Ready(match delivered {
                    Ok((result, guard)) => {
                        // 결과를 돌려주기 전에 해제해야 바로 다음 요청을 할 수 있다
                        drop(guard);
                        result
                    }
                    Err(_) => Err(ReplError::ReadFailed(
                        "Fetch worker ended without a result".to_string(),
                    )),
                })
            }
        }
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Closed {
            debug!("Fetch dropped before completion; the next fetch takes over its result");
            state.orphaned = Some(rx);
        }
    }
}

async fn wait_closed(mut closed_rx: watch::Receiver<bool>) {
    // sender가 사라진 경우도 닫힌 것으로 본다
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

impl<T: Transport> Connection<T> {
    /// 다음 이벤트 요청. 호출한 쪽은 대기하지 않는다.
    ///
    /// 이전 요청이 끝나기 전에 다시 호출하면 `FetchInFlight`. 단, 이전 요청을
    /// 결과 없이 drop했다면 그 요청을 이어받는다. 읽기 실패 후에도 상태는
    /// Dumping으로 유지되므로 다시 요청할 수 있다. 스트림이 끝난 뒤에는 항상
    /// `EndOfStream`으로 완료된다.
    pub fn fetch_next_event(&self) -> Result<PendingFetch> {
        self.expect_status("fetch_next_event", ConnectionStatus::Dumping)?;

        let orphaned = self.state.lock().orphaned.take();
        if let Some(rx) = orphaned {
            debug!("Resuming a fetch dropped before completion");
            return Ok(self.pending(rx));
        }

        let guard = InFlightGuard::acquire(&self.in_flight)?;
        let (tx, rx) = oneshot::channel();

        if self.state.lock().end_of_stream {
            let _ = tx.send((Err(ReplError::EndOfStream), guard));
            return Ok(self.pending(rx));
        }

        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let closed_rx = self.closed_tx.subscribe();

        tokio::spawn(async move {
            let result = {
                let mut transport = transport.lock().await;
                tokio::select! {
                    biased;
                    _ = wait_closed(closed_rx) => Err(ReplError::Closed),
                    result = reader::next_event(&mut *transport) => result,
                }
            };

            record_outcome(&state, &result);

            if tx.send((result, guard)).is_err() {
                debug!("Fetch result dropped: the connection was closed");
            }
        });

        Ok(self.pending(rx))
    }

    fn pending(&self, rx: oneshot::Receiver<Delivery>) -> PendingFetch {
        PendingFetch {
            rx: Some(rx),
            state: Arc::clone(&self.state),
        }
    }

    /// `fetch_next_event` 후 결과까지 대기
    pub async fn next_event(&self) -> Result<BinlogFrame> {
        self.fetch_next_event()?.await
    }

    /// 이벤트를 계속 읽어 채널로 보내는 task 시작
    ///
    /// 순서는 서버가 보낸 그대로이며, 첫 에러 또는 스트림 종료 후 멈춘다.
    pub fn into_stream(self, filter: EventFilter) -> EventStream {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));

        let join = tokio::spawn(async move {
            let mut delivered = 0u64;
            loop {
                match self.next_event().await {
                    Ok(frame) => {
                        if !filter.accepts_frame(&frame) {
                            continue;
                        }
                        delivered += 1;
                        if tx.send(Ok(frame)).await.is_err() {
                            debug!("Event stream receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        if e.is_end_of_stream() {
                            info!("Binlog stream ended after {} events", delivered);
                        } else {
                            warn!("Binlog stream stopped: {}", e);
                        }
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            if let Err(e) = self.close().await {
                warn!("Failed to close connection after streaming: {}", e);
            }
        });

        EventStream { rx, join }
    }
}

fn record_outcome(state: &Mutex<SessionState>, result: &Result<BinlogFrame>) {
    if let Err(e) = result {
        let mut state = state.lock();
        state.last_error = Some(e.server_text());
        if e.is_end_of_stream() {
            state.end_of_stream = true;
        }
    }
}

/// `into_stream`이 돌려주는 이벤트 수신자
pub struct EventStream {
    rx: mpsc::Receiver<Result<BinlogFrame>>,
    join: JoinHandle<()>,
}

impl EventStream {
    /// 다음 프레임. 스트림이 끝나면 `EndOfStream`.
    pub async fn recv(&mut self) -> Result<BinlogFrame> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(ReplError::EndOfStream),
        }
    }

    /// 읽기 task 중단
    pub fn abort(&self) {
        self.join.abort();
    }
}
