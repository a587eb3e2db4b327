//! 전송 계층 추상화
//!
//! 두 종류의 외부 전송을 메시지 전달 방식으로 모델링한다.
//! - RelayLink: 방 단위로 연결된 릴레이 링크 (send / recv, recv가 None이면 연결 종료)
//! - DataChannel: 순서/신뢰성이 보장되는 직접 채널 + 송신 버퍼 저수위 알림
//!
//! 메모리 구현(`link_pair`, `memory_channel`)은 데모와 테스트에서 실제 전송 대신 쓰인다.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::message::WireMessage;
use crate::{Error, Result};

/// 릴레이 링크 (한쪽 끝점)
#[derive(Debug)]
pub struct RelayLink {
    outbound: mpsc::Sender<WireMessage>,
    inbound: mpsc::Receiver<WireMessage>,
}

impl RelayLink {
    pub fn new(outbound: mpsc::Sender<WireMessage>, inbound: mpsc::Receiver<WireMessage>) -> Self {
        Self { outbound, inbound }
    }

    /// 메시지 송신 (상대가 사라졌으면 ChannelClosed)
    pub async fn send(&self, message: impl Into<WireMessage>) -> Result<()> {
        self.outbound
            .send(message.into())
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 다음 메시지 수신 (None = 연결 종료)
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.inbound.recv().await
    }

    /// 송신측 핸들 복제
    pub fn sender(&self) -> mpsc::Sender<WireMessage> {
        self.outbound.clone()
    }

    pub fn into_parts(self) -> (mpsc::Sender<WireMessage>, mpsc::Receiver<WireMessage>) {
        (self.outbound, self.inbound)
    }
}

/// 서로 연결된 릴레이 링크 한 쌍
pub fn link_pair(capacity: usize) -> (RelayLink, RelayLink) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (RelayLink::new(a_tx, a_rx), RelayLink::new(b_tx, b_rx))
}

/// 직접 채널 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(text) => text.len(),
            ChannelPayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 직접 채널 수신 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelPayload),
    Closed,
}

/// 직접 데이터 채널 (송신측)
///
/// `send`는 즉시 버퍼에 쌓고 반환한다. 버퍼 점유량은 `buffered_amount`로 조회하며,
/// `buffered_amount_low`는 점유량이 임계값 이하로 내려가거나 채널이 닫히면 완료된다.
pub trait DataChannel: Send + Sync + 'static {
    fn send(&self, payload: ChannelPayload) -> Result<()>;

    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    fn buffered_amount_low_threshold(&self) -> usize;

    fn buffered_amount_low(&self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// 메모리 채널 옵션
#[derive(Debug, Clone)]
pub struct MemoryChannelOptions {
    /// 수신측 이벤트 큐 크기 (작을수록 송신 버퍼가 빨리 찬다)
    pub event_capacity: usize,

    /// 메시지당 전달 지연
    pub drain_delay: Option<Duration>,

    /// 바이너리 메시지 N개 전달 후 채널 종료 (장애 주입)
    pub close_after: Option<usize>,
}

impl Default for MemoryChannelOptions {
    fn default() -> Self {
        Self {
            event_capacity: 16,
            drain_delay: None,
            close_after: None,
        }
    }
}

enum PumpItem {
    Payload(ChannelPayload),
    Close,
}

#[derive(Debug, Default)]
struct ChannelShared {
    buffered: AtomicUsize,
    threshold: AtomicUsize,
    closed: AtomicBool,
    low: Notify,
    sends: AtomicUsize,
    sends_over_threshold: AtomicUsize,
    peak_buffered: AtomicUsize,
}

impl ChannelShared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.low.notify_waiters();
    }
}

/// 메모리 직접 채널 (송신측 핸들)
#[derive(Debug)]
pub struct MemoryDataChannel {
    shared: Arc<ChannelShared>,
    queue: mpsc::UnboundedSender<PumpItem>,
}

impl std::fmt::Debug for PumpItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpItem::Payload(p) => write!(f, "Payload({} bytes)", p.len()),
            PumpItem::Close => write!(f, "Close"),
        }
    }
}

/// 메모리 직접 채널 생성
///
/// 전달 태스크가 송신 버퍼를 비우며 수신측으로 이벤트를 흘려보낸다. tokio 런타임 안에서 호출해야 한다.
pub fn memory_channel(options: MemoryChannelOptions) -> (MemoryDataChannel, mpsc::Receiver<ChannelEvent>) {
    let shared = Arc::new(ChannelShared::default());
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<PumpItem>();
    let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(options.event_capacity.max(1));

    let pump_shared = shared.clone();
    tokio::spawn(async move {
        let shared = pump_shared;
        let mut delivered_binary = 0usize;

        if event_tx.send(ChannelEvent::Open).await.is_err() {
            shared.mark_closed();
            return;
        }

        while let Some(item) = queue_rx.recv().await {
            let payload = match item {
                PumpItem::Payload(payload) => payload,
                PumpItem::Close => break,
            };

            if let Some(delay) = options.drain_delay {
                tokio::time::sleep(delay).await;
            }

            let len = payload.len();
            let is_binary = matches!(payload, ChannelPayload::Binary(_));
            if event_tx.send(ChannelEvent::Message(payload)).await.is_err() {
                debug!("메모리 채널 수신측 종료");
                break;
            }

            let remaining = shared.buffered.fetch_sub(len, Ordering::SeqCst) - len;
            if remaining <= shared.threshold.load(Ordering::SeqCst) {
                shared.low.notify_waiters();
            }

            if is_binary {
                delivered_binary += 1;
                if options.close_after == Some(delivered_binary) {
                    debug!("메모리 채널 장애 주입: {}개 전달 후 종료", delivered_binary);
                    break;
                }
            }
        }

        shared.mark_closed();
        let _ = event_tx.send(ChannelEvent::Closed).await;
    });

    (MemoryDataChannel { shared, queue: queue_tx }, event_rx)
}

impl MemoryDataChannel {
    /// 총 송신 호출 수
    pub fn sends(&self) -> usize {
        self.shared.sends.load(Ordering::SeqCst)
    }

    /// 버퍼가 임계값을 넘은 상태에서 호출된 송신 수
    pub fn sends_over_threshold(&self) -> usize {
        self.shared.sends_over_threshold.load(Ordering::SeqCst)
    }

    /// 관측된 최대 버퍼 점유량
    pub fn peak_buffered(&self) -> usize {
        self.shared.peak_buffered.load(Ordering::SeqCst)
    }
}

impl DataChannel for MemoryDataChannel {
    fn send(&self, payload: ChannelPayload) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let len = payload.len();
        let before = self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        if before > self.shared.threshold.load(Ordering::SeqCst) {
            self.shared.sends_over_threshold.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.peak_buffered.fetch_max(before + len, Ordering::SeqCst);
        self.shared.sends.fetch_add(1, Ordering::SeqCst);
        trace!("메모리 채널 송신: {} bytes, buffered={}", len, before + len);

        self.queue.send(PumpItem::Payload(payload)).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            Error::ChannelClosed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.shared.threshold.store(threshold, Ordering::SeqCst);
        self.shared.low.notify_waiters();
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.shared.threshold.load(Ordering::SeqCst)
    }

    fn buffered_amount_low(&self) -> impl Future<Output = ()> + Send {
        let shared = self.shared.clone();
        async move {
            loop {
                let notified = shared.low.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if shared.closed.load(Ordering::SeqCst)
                    || shared.buffered.load(Ordering::SeqCst) <= shared.threshold.load(Ordering::SeqCst)
                {
                    return;
                }
                notified.await;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.queue.send(PumpItem::Close);
    }
}
