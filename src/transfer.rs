//! 전송 컨트롤러 공통부
//!
//! 전송 하나는 전용 태스크(송신 또는 수신)가 소유한다. 태스크는 `TransferCore`로 상태를 바꾸고,
//! 외부에는 `TransferHandle`(스냅샷 조회, 취소, 완료 대기)과 이벤트 채널만 노출한다.
//!
//! 상태는 앞으로만 진행한다: Pending → InProgress → {Complete | Failed | Cancelled}.
//! 종료 이벤트는 정확히 한 번 발생한다.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{ChunkIndex, TransferDescriptor};
use crate::error::ErrorKind;
use crate::stats::{estimate_eta, throughput, TransferStats};
use crate::{Config, Error, Result};

/// 전송 식별자 (프로세스 내 고유)
pub type TransferId = u64;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::InProgress => 1,
            _ => 2,
        }
    }

    /// 전이 가능 여부 (앞으로만, 종료 상태에서는 불가)
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

/// 청크 기록 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRecord {
    New,
    Duplicate,
}

/// 전송 하나의 청크 상태
///
/// 송신측은 ACK(또는 전달) 된 청크를, 수신측은 받은 청크를 기록한다.
#[derive(Debug, Clone)]
pub struct TransferState {
    descriptor: TransferDescriptor,
    received_mask: Vec<bool>,
    received_chunks: u32,
    received_bytes: u64,
    status: TransferStatus,
}

impl TransferState {
    pub fn new(descriptor: TransferDescriptor) -> Self {
        let total = descriptor.total_chunks() as usize;
        Self {
            descriptor,
            received_mask: vec![false; total],
            received_chunks: 0,
            received_bytes: 0,
            status: TransferStatus::Pending,
        }
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    pub fn is_received(&self, index: ChunkIndex) -> bool {
        self.received_mask
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// 모든 청크 수신 여부 (0청크 전송은 즉시 true)
    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.descriptor.total_chunks()
    }

    /// 상태 전이. 뒤로 가거나 종료 이후면 false
    pub fn advance(&mut self, next: TransferStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// 청크 하나 기록
    ///
    /// 길이가 디스크립터와 다르면 ChecksumOrSizeMismatch. 이미 받은 청크는 Duplicate
    /// (바이트를 다시 세지 않음).
    pub fn on_chunk(&mut self, index: ChunkIndex, len: u32) -> Result<ChunkRecord> {
        let expected = self.descriptor.expected_len(index).ok_or_else(|| {
            Error::Protocol(format!(
                "chunk index {} out of range (total {})",
                index,
                self.descriptor.total_chunks()
            ))
        })?;

        if len != expected {
            return Err(Error::ChecksumOrSizeMismatch {
                index,
                expected: expected as u64,
                got: len as u64,
            });
        }

        let slot = &mut self.received_mask[index as usize];
        if *slot {
            return Ok(ChunkRecord::Duplicate);
        }
        *slot = true;
        self.received_chunks += 1;
        self.received_bytes += len as u64;
        self.advance(TransferStatus::InProgress);
        Ok(ChunkRecord::New)
    }

    /// 진행률 스냅샷
    pub fn progress(&self, elapsed: Duration) -> Progress {
        Progress::new(self.received_bytes, self.descriptor.total_size, elapsed)
    }
}

/// 진행률 스냅샷
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    /// 0.0 ~ 100.0
    pub percent: f64,
    pub bytes_per_sec: f64,
    /// 남은 시간 추정 (속도를 아직 모르면 None)
    pub eta: Option<Duration>,
}

impl Progress {
    pub fn new(received_bytes: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let percent = if total_bytes == 0 {
            100.0
        } else {
            received_bytes as f64 * 100.0 / total_bytes as f64
        };
        Self {
            received_bytes,
            total_bytes,
            percent,
            bytes_per_sec: throughput(received_bytes, elapsed),
            eta: estimate_eta(received_bytes, total_bytes, elapsed),
        }
    }

    /// 메타데이터를 받기 전 (크기 미정)
    pub fn empty() -> Self {
        Self {
            received_bytes: 0,
            total_bytes: 0,
            percent: 0.0,
            bytes_per_sec: 0.0,
            eta: None,
        }
    }
}

/// 종료 실패 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub kind: ErrorKind,
    pub reason: String,
}

impl TransferFailure {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by user")
    }

    /// 종료 상태 (Cancelled 종류만 Cancelled, 나머지는 Failed)
    pub fn status(&self) -> TransferStatus {
        if self.kind == ErrorKind::Cancelled {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Failed
        }
    }
}

impl From<&Error> for TransferFailure {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<Error> for TransferFailure {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// 전송 최종 결과
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub id: TransferId,
    pub status: TransferStatus,
    pub progress: Progress,
    pub failure: Option<TransferFailure>,
}

impl TransferOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == TransferStatus::Complete
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// 전송 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// 진행률 (간격 제한)
    Progress(Progress),
    /// 종료 (전송당 정확히 한 번)
    Finished(TransferOutcome),
}

/// 진행률 이벤트 간격 제한
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// 지금 이벤트를 내보내도 되면 true (내보낸 것으로 기록)
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// 중단 신호 (첫 번째 요청만 유효)
pub(crate) type AbortSignal = watch::Receiver<Option<TransferFailure>>;

/// 중단 요청이 올 때까지 대기
///
/// 모든 핸들이 사라져 신호를 더 받을 수 없으면 영원히 대기한다.
pub(crate) async fn aborted(signal: &mut AbortSignal) -> TransferFailure {
    loop {
        if let Some(failure) = signal.borrow_and_update().clone() {
            return failure;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    descriptor: Option<TransferDescriptor>,
    status: TransferStatus,
    progress: Progress,
}

/// 전송 외부 핸들
///
/// 복제 가능. 조회는 스냅샷만 읽으며 전송 태스크의 상태를 직접 건드리지 않는다.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    direction: Direction,
    snapshot: Arc<RwLock<Snapshot>>,
    abort_tx: Arc<watch::Sender<Option<TransferFailure>>>,
    done_rx: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 디스크립터 (수신측은 메타데이터 수신 전 None)
    pub fn descriptor(&self) -> Option<TransferDescriptor> {
        self.snapshot.read().descriptor.clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.snapshot.read().status
    }

    pub fn progress(&self) -> Progress {
        self.snapshot.read().progress
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// 최종 결과 (아직 진행 중이면 None)
    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.done_rx.borrow().clone()
    }

    /// 취소 (진행 중인 송수신과 동시에 호출해도 안전)
    pub fn cancel(&self) {
        self.abort(TransferFailure::cancelled());
    }

    /// 지정한 사유로 중단. 이미 중단 요청이 있거나 끝났으면 무시
    pub fn abort(&self, failure: TransferFailure) {
        if self.is_finished() {
            return;
        }
        let accepted = self.abort_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(failure);
                true
            } else {
                false
            }
        });
        if accepted {
            debug!("전송 {} 중단 요청", self.id);
        }
    }

    /// 최종 결과 대기
    pub async fn wait(&self) -> TransferOutcome {
        let mut done = self.done_rx.clone();
        loop {
            if let Some(outcome) = done.borrow_and_update().clone() {
                return outcome;
            }
            if done.changed().await.is_err() {
                return done.borrow().clone().unwrap_or_else(|| TransferOutcome {
                    id: self.id,
                    status: TransferStatus::Failed,
                    progress: self.progress(),
                    failure: Some(TransferFailure::new(
                        ErrorKind::ChannelClosed,
                        "transfer task terminated",
                    )),
                });
            }
        }
    }
}

/// 시작된 전송 (핸들 + 이벤트 수신기)
#[derive(Debug)]
pub struct Transfer {
    pub handle: TransferHandle,
    pub events: mpsc::Receiver<TransferEvent>,
}

/// 전송 태스크 측 컨트롤러 (태스크 하나가 소유)
pub(crate) struct TransferCore {
    id: TransferId,
    direction: Direction,
    state: Option<TransferState>,
    stats: TransferStats,
    started_at: Instant,
    throttle: ProgressThrottle,
    snapshot: Arc<RwLock<Snapshot>>,
    events: mpsc::Sender<TransferEvent>,
    done_tx: watch::Sender<Option<TransferOutcome>>,
}

impl TransferCore {
    /// 새 전송 생성. 송신측은 디스크립터를 바로 넘기고, 수신측은 메타데이터 수신 후 `attach`
    pub(crate) fn new(
        config: &Config,
        direction: Direction,
        descriptor: Option<TransferDescriptor>,
    ) -> (Self, Transfer, AbortSignal) {
        let id = NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed);
        // 종료 이벤트 자리를 항상 하나 남겨두므로 최소 2
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(2));
        let (abort_tx, abort_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(None);

        let snapshot = Arc::new(RwLock::new(Snapshot {
            descriptor: None,
            status: TransferStatus::Pending,
            progress: Progress::empty(),
        }));

        let handle = TransferHandle {
            id,
            direction,
            snapshot: snapshot.clone(),
            abort_tx: Arc::new(abort_tx),
            done_rx,
        };

        let mut core = Self {
            id,
            direction,
            state: None,
            stats: TransferStats::new(),
            started_at: Instant::now(),
            throttle: ProgressThrottle::new(config.progress_interval()),
            snapshot,
            events: event_tx,
            done_tx,
        };
        if let Some(descriptor) = descriptor {
            core.attach(descriptor);
        }

        (
            core,
            Transfer {
                handle,
                events: event_rx,
            },
            abort_rx,
        )
    }

    /// 디스크립터 확정, InProgress로 전이
    pub(crate) fn attach(&mut self, descriptor: TransferDescriptor) {
        info!(
            "전송 {} 시작 ({:?}): {} ({} bytes, {} chunks)",
            self.id,
            self.direction,
            descriptor.file_name,
            descriptor.total_size,
            descriptor.total_chunks()
        );
        let mut state = TransferState::new(descriptor.clone());
        state.advance(TransferStatus::InProgress);
        self.state = Some(state);
        self.started_at = Instant::now();
        self.stats = TransferStats::new();

        let mut snapshot = self.snapshot.write();
        snapshot.descriptor = Some(descriptor);
        snapshot.status = TransferStatus::InProgress;
    }

    pub(crate) fn state(&self) -> Option<&TransferState> {
        self.state.as_ref()
    }

    pub(crate) fn descriptor(&self) -> Option<&TransferDescriptor> {
        self.state.as_ref().map(|s| s.descriptor())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_complete())
    }

    pub(crate) fn stats_mut(&mut self) -> &mut TransferStats {
        &mut self.stats
    }

    /// 청크 기록 후 스냅샷 갱신, 간격이 지났으면 진행률 이벤트
    pub(crate) fn record(&mut self, index: ChunkIndex, len: u32) -> Result<ChunkRecord> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::Protocol(format!("chunk {} before metadata", index)))?;

        let record = state.on_chunk(index, len)?;
        if record == ChunkRecord::New {
            self.stats.total_bytes += len as u64;
            self.publish();
        }
        Ok(record)
    }

    fn current_progress(&self) -> Progress {
        match &self.state {
            Some(state) => state.progress(self.started_at.elapsed()),
            None => Progress::empty(),
        }
    }

    fn publish(&mut self) {
        let progress = self.current_progress();
        self.snapshot.write().progress = progress;

        if !self.throttle.ready(Instant::now()) {
            return;
        }
        // 마지막 한 칸은 종료 이벤트용
        if self.events.capacity() > 1 {
            let _ = self.events.try_send(TransferEvent::Progress(progress));
        }
    }

    /// 전송 종료. 종료 이벤트는 여기서만, 한 번 발생한다
    pub(crate) fn finish(mut self, result: std::result::Result<(), TransferFailure>) -> TransferOutcome {
        let (status, failure) = match result {
            Ok(()) => (TransferStatus::Complete, None),
            Err(failure) => (failure.status(), Some(failure)),
        };

        if let Some(state) = self.state.as_mut() {
            state.advance(status);
        }
        let progress = self.current_progress();
        {
            let mut snapshot = self.snapshot.write();
            snapshot.status = status;
            snapshot.progress = progress;
        }

        match &failure {
            None => info!(
                "전송 {} 완료 ({:?}): {}",
                self.id,
                self.direction,
                self.stats.summary()
            ),
            Some(f) if f.kind == ErrorKind::Cancelled => {
                info!("전송 {} 취소 ({:?})", self.id, self.direction)
            }
            Some(f) => warn!("전송 {} 실패 ({:?}): {}", self.id, self.direction, f),
        }

        let outcome = TransferOutcome {
            id: self.id,
            status,
            progress,
            failure,
        };
        let _ = self
            .events
            .try_send(TransferEvent::Finished(outcome.clone()));
        self.done_tx.send_replace(Some(outcome.clone()));
        outcome
    }
}
