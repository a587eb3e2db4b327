//! 릴레이 방식 신뢰 전송 (청크별 ACK + 타임아웃 재전송)
//!
//! 송신자는 청크 하나를 보내고 ACK를 받아야 다음 청크로 넘어간다 (파이프라인 깊이 1).
//! ACK가 타임아웃 안에 오지 않으면 같은 청크를 다시 보내고, `max_attempts`를 넘기면
//! 전송 전체가 AckTimeoutExhausted로 실패한다.
//!
//! 수신자는 청크를 인덱스로 저장하고 즉시 ACK를 보낸다. 모든 청크를 받으면 싱크를 커밋한 뒤
//! transfer-complete 신호를 보낸다. 송신자는 마지막 ACK가 아니라 이 신호를 받아야 완료된다.

use bytes::Bytes;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::chunk::{Chunk, ChunkIndex, ChunkSplitter, Reassembler, TransferDescriptor};
use crate::frame;
use crate::message::{ControlMessage, WireMessage};
use crate::sink::{ChunkSink, ScopedSink};
use crate::transfer::{
    aborted, AbortSignal, ChunkRecord, Direction, Transfer, TransferCore, TransferFailure,
};
use crate::transport::RelayLink;
use crate::{Config, Error};

type TaskResult = std::result::Result<(), TransferFailure>;

/// 청크 하나의 전달 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Acked,
    /// ACK 대신 transfer-complete 수신 (수신자가 이미 전부 받음)
    ReceiverComplete,
}

/// ACK 대기 중인 청크
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub chunk_index: ChunkIndex,
    pub sent_at: Instant,
    /// 1부터 시작 (최초 전송 포함)
    pub attempt: u8,
}

fn room_closed(reason: Option<String>) -> TransferFailure {
    Error::RoomClosed {
        reason: reason.unwrap_or_else(|| "room closed".to_string()),
    }
    .into()
}

pub(crate) fn size_mismatch(descriptor: &TransferDescriptor, data: &Bytes) -> TransferFailure {
    Error::Protocol(format!(
        "data is {} bytes but descriptor declares {}",
        data.len(),
        descriptor.total_size
    ))
    .into()
}

fn link_closed() -> TransferFailure {
    TransferFailure::from(Error::ChannelClosed)
}

/// 릴레이 송신자
pub struct RelaySender;

impl RelaySender {
    /// 송신 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn start(config: &Config, descriptor: TransferDescriptor, data: Bytes, link: RelayLink) -> Transfer {
        let (core, transfer, abort) = TransferCore::new(config, Direction::Send, Some(descriptor.clone()));
        if data.len() as u64 != descriptor.total_size {
            core.finish(Err(size_mismatch(&descriptor, &data)));
            return transfer;
        }

        let task = RelaySenderTask {
            splitter: ChunkSplitter::new(data, descriptor.chunk_size as usize),
            descriptor,
            ack_timeout: config.ack_timeout(),
            completion_timeout: config.completion_timeout(),
            max_attempts: config.max_attempts.max(1),
            core,
            link,
            abort,
        };
        tokio::spawn(task.run());
        transfer
    }
}

/// 송신 태스크 상태 (단일 태스크에서만 접근)
struct RelaySenderTask {
    descriptor: TransferDescriptor,
    splitter: ChunkSplitter,
    ack_timeout: std::time::Duration,
    completion_timeout: std::time::Duration,
    max_attempts: u8,
    core: TransferCore,
    link: RelayLink,
    abort: AbortSignal,
}

impl RelaySenderTask {
    async fn run(mut self) {
        let result = self.send_all().await;
        self.core.finish(result);
    }

    async fn send_all(&mut self) -> TaskResult {
        self.link
            .send(ControlMessage::chunk_meta(&self.descriptor))
            .await?;

        if self.descriptor.total_chunks() == 0 {
            return Ok(());
        }

        while let Some(chunk) = self.splitter.next() {
            if self.deliver(chunk).await? == Delivery::ReceiverComplete {
                return self.confirm_remaining();
            }
        }

        self.await_completion().await
    }

    /// 수신자의 완료 신호로 아직 ACK 못 받은 청크를 모두 확인 처리
    fn confirm_remaining(&mut self) -> TaskResult {
        let unconfirmed: Vec<(ChunkIndex, u32)> = (0..self.descriptor.total_chunks())
            .filter(|index| !self.core.state().is_some_and(|s| s.is_received(*index)))
            .filter_map(|index| self.descriptor.expected_len(index).map(|len| (index, len)))
            .collect();
        debug!("ACK 전 transfer-complete 수신, 미확인 청크 {}개 확인 처리", unconfirmed.len());

        for (index, len) in unconfirmed {
            self.core.record(index, len)?;
        }
        Ok(())
    }

    async fn transmit(&mut self, framed: &Bytes) -> TaskResult {
        self.link.send(WireMessage::Binary(framed.clone())).await?;
        self.core.stats_mut().total_chunks += 1;
        Ok(())
    }

    /// 청크 하나를 ACK 받을 때까지 전송
    async fn deliver(&mut self, chunk: Chunk) -> std::result::Result<Delivery, TransferFailure> {
        let framed = frame::frame_chunk(&chunk)?;
        self.transmit(&framed).await?;

        let mut pending = PendingAck {
            chunk_index: chunk.index,
            sent_at: Instant::now(),
            attempt: 1,
        };
        trace!("청크 {} 전송 (attempt 1)", chunk.index);

        loop {
            let deadline = pending.sent_at + self.ack_timeout;
            tokio::select! {
                biased;

                failure = aborted(&mut self.abort) => return Err(failure),

                message = self.link.recv() => match message {
                    None => return Err(link_closed()),
                    Some(WireMessage::Control(ControlMessage::ChunkAck { index })) => {
                        if index == pending.chunk_index {
                            self.core.record(index, chunk.len())?;
                            trace!("청크 {} ACK (attempt {})", index, pending.attempt);
                            return Ok(Delivery::Acked);
                        }
                        // 이미 확인된 청크의 ACK
                        self.core.stats_mut().duplicate_acks += 1;
                        debug!("중복/예상 밖 ACK 무시: {} (대기 중: {})", index, pending.chunk_index);
                    }
                    // 마지막 ACK가 유실돼도 수신자는 다시 ACK하지 않는다
                    Some(WireMessage::Control(ControlMessage::TransferComplete)) => {
                        return Ok(Delivery::ReceiverComplete);
                    }
                    Some(WireMessage::Control(ControlMessage::RoomClosed { reason })) => {
                        return Err(room_closed(reason));
                    }
                    Some(other) => ignore(&other),
                },

                _ = sleep_until(deadline) => {
                    if pending.attempt >= self.max_attempts {
                        return Err(Error::AckTimeoutExhausted {
                            index: pending.chunk_index,
                            attempts: pending.attempt,
                        }
                        .into());
                    }
                    pending.attempt += 1;
                    pending.sent_at = Instant::now();
                    warn!(
                        "청크 {} ACK 타임아웃, 재전송 (attempt {}/{})",
                        pending.chunk_index, pending.attempt, self.max_attempts
                    );
                    self.link.send(WireMessage::Binary(framed.clone())).await?;
                    self.core.stats_mut().record_retransmit();
                }
            }
        }
    }

    /// 마지막 ACK 이후 transfer-complete 신호 대기
    async fn await_completion(&mut self) -> TaskResult {
        let deadline = Instant::now() + self.completion_timeout;
        loop {
            tokio::select! {
                biased;

                failure = aborted(&mut self.abort) => return Err(failure),

                message = self.link.recv() => match message {
                    None => return Err(link_closed()),
                    Some(WireMessage::Control(ControlMessage::TransferComplete)) => return Ok(()),
                    Some(WireMessage::Control(ControlMessage::ChunkAck { index })) => {
                        self.core.stats_mut().duplicate_acks += 1;
                        debug!("완료 대기 중 중복 ACK 무시: {}", index);
                    }
                    Some(WireMessage::Control(ControlMessage::RoomClosed { reason })) => {
                        return Err(room_closed(reason));
                    }
                    Some(other) => ignore(&other),
                },

                _ = sleep_until(deadline) => {
                    return Err(Error::CompletionTimeout {
                        waited_ms: self.completion_timeout.as_millis() as u64,
                    }
                    .into());
                }
            }
        }
    }
}

fn ignore(message: &WireMessage) {
    match message {
        WireMessage::Control(msg) => debug!("전송과 무관한 메시지 무시: {}", msg.type_name()),
        WireMessage::Binary(bytes) => debug!("예상 밖 바이너리 무시: {} bytes", bytes.len()),
    }
}

/// 릴레이 수신자
pub struct RelayReceiver;

impl RelayReceiver {
    /// 수신 태스크 시작. chunk-meta를 받으면 전송이 InProgress가 된다
    pub fn start<S: ChunkSink>(config: &Config, link: RelayLink, sink: S) -> Transfer {
        let (core, transfer, abort) = TransferCore::new(config, Direction::Receive, None);
        let task = RelayReceiverTask {
            core,
            link,
            sink: ScopedSink::new(sink),
            reassembler: None,
            abort,
        };
        tokio::spawn(task.run());
        transfer
    }
}

/// 수신 태스크 상태 (단일 태스크에서만 접근)
struct RelayReceiverTask<S: ChunkSink> {
    core: TransferCore,
    link: RelayLink,
    sink: ScopedSink<S>,
    reassembler: Option<Reassembler>,
    abort: AbortSignal,
}

impl<S: ChunkSink> RelayReceiverTask<S> {
    async fn run(mut self) {
        let mut result = self.receive_all().await;

        let Self { core, link, sink, .. } = self;
        if let Err(e) = sink.close(result.is_ok()).await {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        if result.is_ok() {
            // 송신자가 이미 떠났으면 신호는 버려져도 된다
            let _ = link.send(ControlMessage::TransferComplete).await;
        }
        core.finish(result);
    }

    async fn receive_all(&mut self) -> TaskResult {
        loop {
            tokio::select! {
                biased;

                failure = aborted(&mut self.abort) => return Err(failure),

                message = self.link.recv() => {
                    let Some(message) = message else {
                        return Err(link_closed());
                    };
                    if self.handle(message).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 메시지 처리. 전송이 끝났으면 true
    async fn handle(&mut self, message: WireMessage) -> std::result::Result<bool, TransferFailure> {
        match message {
            WireMessage::Control(meta @ ControlMessage::ChunkMeta { .. }) => self.handle_meta(&meta).await,
            WireMessage::Binary(bytes) => {
                let chunk = frame::unframe_chunk(&bytes)?;
                self.handle_chunk(chunk).await
            }
            WireMessage::Control(ControlMessage::ChunkData { index, bytes }) => {
                self.handle_chunk(Chunk::new(index, Bytes::from(bytes))).await
            }
            WireMessage::Control(ControlMessage::RoomClosed { reason }) => Err(room_closed(reason)),
            other => {
                ignore(&other);
                Ok(false)
            }
        }
    }

    async fn handle_meta(&mut self, meta: &ControlMessage) -> std::result::Result<bool, TransferFailure> {
        let Some(descriptor) = meta.to_descriptor() else {
            return Ok(false);
        };
        let descriptor = descriptor?;

        if let Some(current) = self.core.descriptor() {
            if *current == descriptor {
                debug!("중복 chunk-meta 무시");
                return Ok(false);
            }
            return Err(Error::Protocol("chunk-meta changed mid-transfer".into()).into());
        }

        self.sink.open(&descriptor).await?;
        self.reassembler = Some(Reassembler::new(descriptor.total_chunks()));
        self.core.attach(descriptor);
        Ok(self.core.is_complete())
    }

    async fn handle_chunk(&mut self, chunk: Chunk) -> std::result::Result<bool, TransferFailure> {
        let index = chunk.index;
        let record = self.core.record(index, chunk.len())?;

        // 중복이어도 다시 ACK (송신자의 ACK가 유실됐을 수 있음)
        self.link.send(ControlMessage::ChunkAck { index }).await?;

        match record {
            ChunkRecord::New => {
                self.core.stats_mut().total_chunks += 1;
                if let Some(reassembler) = self.reassembler.as_mut() {
                    reassembler.insert(chunk)?;
                    for ready in reassembler.drain_ready() {
                        self.sink.write_chunk(&ready).await?;
                    }
                }
            }
            ChunkRecord::Duplicate => {
                self.core.stats_mut().duplicate_chunks += 1;
                debug!("중복 청크 {} 버림", index);
            }
        }

        Ok(self.core.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::MemorySink;
    use crate::transfer::TransferStatus;
    use crate::transport::link_pair;

    const KIB: usize = 1024;

    fn test_config(chunk_size: usize) -> Config {
        Config {
            chunk_size,
            ack_timeout_ms: 1000,
            max_attempts: 3,
            completion_timeout_ms: 5000,
            ..Config::default()
        }
    }

    fn data(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn descriptor(len: usize, chunk_size: usize) -> TransferDescriptor {
        TransferDescriptor::new("data.bin", len as u64, "", chunk_size as u32).unwrap()
    }

    type Filter = Box<dyn FnMut(&WireMessage) -> bool + Send>;

    /// 송신자/수신자 사이 중계 (filter가 true면 버림)
    fn relay_through(mut to_receiver: Filter, mut to_sender: Filter) -> (RelayLink, RelayLink) {
        let (sender_end, sender_mid) = link_pair(64);
        let (receiver_mid, receiver_end) = link_pair(64);
        let (s_tx, mut s_rx) = sender_mid.into_parts();
        let (r_tx, mut r_rx) = receiver_mid.into_parts();

        tokio::spawn(async move {
            while let Some(msg) = s_rx.recv().await {
                if !to_receiver(&msg) && r_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(msg) = r_rx.recv().await {
                if !to_sender(&msg) && s_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        (sender_end, receiver_end)
    }

    fn count_binaries(counter: Arc<AtomicUsize>) -> Filter {
        Box::new(move |msg| {
            if matches!(msg, WireMessage::Binary(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            false
        })
    }

    fn pass() -> Filter {
        Box::new(|_| false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_chunk_file_takes_four_round_trips() {
        let config = test_config(256 * KIB);
        let payload = data(1024 * KIB);
        let sent = Arc::new(AtomicUsize::new(0));
        let acks = Arc::new(AtomicUsize::new(0));
        let acks_seen = acks.clone();
        let (sender_link, receiver_link) = relay_through(
            count_binaries(sent.clone()),
            Box::new(move |msg| {
                if matches!(msg, WireMessage::Control(ControlMessage::ChunkAck { .. })) {
                    acks_seen.fetch_add(1, Ordering::SeqCst);
                }
                false
            }),
        );

        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);
        let sender = RelaySender::start(&config, descriptor(payload.len(), 256 * KIB), payload.clone(), sender_link);

        let sent_outcome = sender.handle.wait().await;
        let recv_outcome = receiver.handle.wait().await;
        assert_eq!(sent_outcome.status, TransferStatus::Complete);
        assert_eq!(recv_outcome.status, TransferStatus::Complete);
        assert_eq!(sent.load(Ordering::SeqCst), 4);
        assert_eq!(acks.load(Ordering::SeqCst), 4);
        assert_eq!(output.take().unwrap(), payload);
        assert_eq!(receiver.handle.progress().percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_acks_fail_after_exactly_max_attempts() {
        let config = test_config(4);
        let sent = Arc::new(AtomicUsize::new(0));
        let (sender_link, receiver_link) = relay_through(
            count_binaries(sent.clone()),
            Box::new(|msg| matches!(msg, WireMessage::Control(ControlMessage::ChunkAck { .. }))),
        );

        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);
        let sender = RelaySender::start(&config, descriptor(10, 4), data(10), sender_link);

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AckTimeoutExhausted));
        assert_eq!(sent.load(Ordering::SeqCst), 3);

        // 송신자가 사라지면 수신자는 채널 종료로 실패
        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChannelClosed));
        assert!(output.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_budget_sends_once() {
        let config = Config {
            max_attempts: 1,
            ..test_config(4)
        };
        let sent = Arc::new(AtomicUsize::new(0));
        let (sender_link, receiver_link) = relay_through(
            count_binaries(sent.clone()),
            Box::new(|msg| matches!(msg, WireMessage::Control(ControlMessage::ChunkAck { .. }))),
        );

        let (sink, _output) = MemorySink::new();
        let _receiver = RelayReceiver::start(&config, receiver_link, sink);
        let sender = RelaySender::start(&config, descriptor(10, 4), data(10), sender_link);

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AckTimeoutExhausted));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_signal_covers_lost_last_ack() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(8, 4), data(8), sender_link);

        assert!(matches!(
            peer.recv().await,
            Some(WireMessage::Control(ControlMessage::ChunkMeta { .. }))
        ));
        assert!(matches!(peer.recv().await, Some(WireMessage::Binary(_))));
        peer.send(ControlMessage::ChunkAck { index: 0 }).await.unwrap();
        assert!(matches!(peer.recv().await, Some(WireMessage::Binary(_))));

        // 청크 1의 ACK는 유실, 완료 신호만 도착
        peer.send(ControlMessage::TransferComplete).await.unwrap();

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Complete);
        assert_eq!(outcome.progress.received_bytes, 8);
        assert_eq!(outcome.progress.percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_signal_before_first_ack() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(4, 4), data(4), sender_link);

        peer.recv().await;
        assert!(matches!(peer.recv().await, Some(WireMessage::Binary(_))));
        peer.send(ControlMessage::TransferComplete).await.unwrap();

        let outcome = sender.handle.wait().await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.progress.received_bytes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_data_is_rejected_before_sending() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(10, 4), data(8), sender_link);

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Protocol));
        // 메타데이터도 나가지 않음
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_link_completes_with_retransmits() {
        let config = test_config(4);
        let payload = data(22);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_filter = seen.clone();
        // 각 청크의 첫 전송을 버림
        let (sender_link, receiver_link) = relay_through(
            Box::new(move |msg| {
                if matches!(msg, WireMessage::Binary(_)) {
                    seen_in_filter.fetch_add(1, Ordering::SeqCst) % 2 == 0
                } else {
                    false
                }
            }),
            pass(),
        );

        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);
        let sender = RelaySender::start(&config, descriptor(payload.len(), 4), payload.clone(), sender_link);

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(seen.load(Ordering::SeqCst), 12);
        assert_eq!(output.take().unwrap(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ack_is_ignored() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(8, 4), data(8), sender_link);

        assert!(matches!(
            peer.recv().await,
            Some(WireMessage::Control(ControlMessage::ChunkMeta { .. }))
        ));
        for index in 0..2 {
            assert!(matches!(peer.recv().await, Some(WireMessage::Binary(_))));
            peer.send(ControlMessage::ChunkAck { index }).await.unwrap();
            peer.send(ControlMessage::ChunkAck { index }).await.unwrap();
        }

        // 마지막 ACK만으로는 완료되지 않음
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sender.handle.status(), TransferStatus::InProgress);

        peer.send(ControlMessage::TransferComplete).await.unwrap();
        let outcome = sender.handle.wait().await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.progress.received_bytes, 8);
        assert_eq!(outcome.progress.percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_completion_signal_fails() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(4, 4), data(4), sender_link);

        peer.recv().await;
        peer.recv().await;
        peer.send(ControlMessage::ChunkAck { index: 0 }).await.unwrap();

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AckTimeoutExhausted));
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_closed_mid_transfer() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(8, 4), data(8), sender_link);

        peer.recv().await;
        peer.send(ControlMessage::RoomClosed {
            reason: Some("host left".into()),
        })
        .await
        .unwrap();

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::RoomClosed));
        assert!(outcome.failure.unwrap().reason.contains("host left"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_pending_ack() {
        let config = test_config(4);
        let (sender_link, mut peer) = link_pair(64);
        let sender = RelaySender::start(&config, descriptor(8, 4), data(8), sender_link);

        peer.recv().await;
        peer.recv().await;
        sender.handle.cancel();

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Cancelled);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_queued_room_close() {
        for _ in 0..20 {
            let config = test_config(4);
            let (receiver_link, peer) = link_pair(64);
            let (sink, _output) = MemorySink::new();
            let receiver = RelayReceiver::start(&config, receiver_link, sink);

            // 태스크가 처음 폴링되기 전에 두 사건이 모두 준비됨
            receiver.handle.cancel();
            peer.send(ControlMessage::RoomClosed {
                reason: Some("service shutdown".into()),
            })
            .await
            .unwrap();

            let outcome = receiver.handle.wait().await;
            assert_eq!(outcome.status, TransferStatus::Cancelled);
            assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_file() {
        let config = test_config(4);
        let (sender_link, receiver_link) = link_pair(64);
        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);
        let sender = RelaySender::start(&config, descriptor(0, 4), Bytes::new(), sender_link);

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(output.take().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_reorders_and_acks_every_chunk() {
        let config = test_config(4);
        let (receiver_link, mut peer) = link_pair(64);
        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);
        let payload = data(10);

        peer.send(ControlMessage::chunk_meta(&descriptor(10, 4)))
            .await
            .unwrap();
        let chunks: Vec<Chunk> = crate::chunk::split(payload.clone(), 4).collect();

        peer.send(WireMessage::Binary(frame::frame_chunk(&chunks[2]).unwrap()))
            .await
            .unwrap();
        peer.send(ControlMessage::ChunkData {
            index: 0,
            bytes: chunks[0].payload.to_vec(),
        })
        .await
        .unwrap();
        peer.send(WireMessage::Binary(frame::frame_chunk(&chunks[0]).unwrap()))
            .await
            .unwrap();
        peer.send(WireMessage::Binary(frame::frame_chunk(&chunks[1]).unwrap()))
            .await
            .unwrap();

        let mut acked = Vec::new();
        loop {
            match peer.recv().await {
                Some(WireMessage::Control(ControlMessage::ChunkAck { index })) => acked.push(index),
                Some(WireMessage::Control(ControlMessage::TransferComplete)) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(acked, vec![2, 0, 0, 1]);
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(output.take().unwrap(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_fails_receiver() {
        let config = test_config(4);
        let (receiver_link, peer) = link_pair(64);
        let (sink, _output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, receiver_link, sink);

        peer.send(ControlMessage::chunk_meta(&descriptor(4, 4)))
            .await
            .unwrap();
        let framed = frame::frame_chunk(&Chunk::new(0, Bytes::from_static(b"abcd"))).unwrap();
        let mut corrupted = framed.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        peer.send(WireMessage::Binary(Bytes::from(corrupted)))
            .await
            .unwrap();

        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChecksumOrSizeMismatch));
    }
}
