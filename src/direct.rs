//! 직접 채널 방식 전송 (송신 버퍼 저수위 흐름 제어)
//!
//! 청크별 ACK가 없다. 채널이 순서와 신뢰성을 보장하므로 송신자는 버퍼 점유량만 본다:
//! `buffered_amount <= threshold`인 동안 다음 청크를 보내고, 넘으면 저수위 알림까지 멈춘다.
//! 메타데이터(JSON 텍스트)는 첫 청크 전에 한 번 보낸다.
//!
//! 수신자는 바이너리 메시지를 도착 순서대로 청크로 받고, 받은 바이트가 파일 크기와 같아지는
//! 순간 완료된다.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkSplitter, TransferDescriptor};
use crate::message::ControlMessage;
use crate::relay::size_mismatch;
use crate::sink::{ChunkSink, ScopedSink};
use crate::transfer::{aborted, AbortSignal, Direction, Transfer, TransferCore, TransferFailure};
use crate::transport::{ChannelEvent, ChannelPayload, DataChannel};
use crate::{Config, Error};

type TaskResult = std::result::Result<(), TransferFailure>;

/// 직접 채널 송신자
pub struct DirectSender;

impl DirectSender {
    /// 송신 태스크 시작. 채널의 저수위 임계값을 설정값으로 맞춘다
    pub fn start<C: DataChannel>(
        config: &Config,
        descriptor: TransferDescriptor,
        data: bytes::Bytes,
        channel: Arc<C>,
    ) -> Transfer {
        let (core, transfer, abort) = TransferCore::new(config, Direction::Send, Some(descriptor.clone()));
        if data.len() as u64 != descriptor.total_size {
            channel.close();
            core.finish(Err(size_mismatch(&descriptor, &data)));
            return transfer;
        }
        channel.set_buffered_amount_low_threshold(config.buffered_amount_low_threshold);

        let task = DirectSenderTask {
            splitter: ChunkSplitter::new(data, descriptor.chunk_size as usize),
            descriptor,
            threshold: config.buffered_amount_low_threshold,
            core,
            channel,
            abort,
        };
        tokio::spawn(task.run());
        transfer
    }
}

struct DirectSenderTask<C: DataChannel> {
    descriptor: TransferDescriptor,
    splitter: ChunkSplitter,
    threshold: usize,
    core: TransferCore,
    channel: Arc<C>,
    abort: AbortSignal,
}

impl<C: DataChannel> DirectSenderTask<C> {
    async fn run(mut self) {
        let result = self.send_all().await;
        if result.is_err() {
            // 수신자가 무한 대기하지 않도록
            self.channel.close();
        }
        self.core.finish(result);
    }

    fn check_abort(&self) -> TaskResult {
        match self.abort.borrow().clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    async fn send_all(&mut self) -> TaskResult {
        let meta = ControlMessage::chunk_meta(&self.descriptor).to_text()?;
        self.channel.send(ChannelPayload::Text(meta))?;

        while let Some(chunk) = self.splitter.next() {
            self.check_abort()?;
            if self.channel.buffered_amount() > self.threshold {
                self.wait_for_low_water().await?;
            }

            let len = chunk.len();
            self.channel.send(ChannelPayload::Binary(chunk.payload))?;
            self.core.stats_mut().total_chunks += 1;
            self.core.record(chunk.index, len)?;
            trace!(
                "청크 {} 전송, buffered={}",
                chunk.index,
                self.channel.buffered_amount()
            );
        }

        self.drain().await?;

        if !self.core.is_complete() {
            return Err(Error::Protocol("channel drained before every chunk was sent".into()).into());
        }
        Ok(())
    }

    /// 버퍼가 임계값 이하로 내려갈 때까지 대기
    async fn wait_for_low_water(&mut self) -> TaskResult {
        self.core.stats_mut().backpressure_waits += 1;
        debug!(
            "송신 버퍼 {} > {}, 저수위 대기",
            self.channel.buffered_amount(),
            self.threshold
        );

        tokio::select! {
            biased;
            failure = aborted(&mut self.abort) => return Err(failure),
            _ = self.channel.buffered_amount_low() => {}
        }

        if self.channel.is_closed() {
            return Err(Error::ChannelClosed.into());
        }
        Ok(())
    }

    /// 마지막 청크가 채널을 빠져나갈 때까지 대기
    async fn drain(&mut self) -> TaskResult {
        if self.channel.buffered_amount() == 0 {
            return Ok(());
        }

        self.channel.set_buffered_amount_low_threshold(0);
        let drained = tokio::select! {
            biased;
            failure = aborted(&mut self.abort) => Err(failure),
            _ = self.channel.buffered_amount_low() => Ok(()),
        };
        self.channel.set_buffered_amount_low_threshold(self.threshold);
        drained?;

        if self.channel.buffered_amount() > 0 {
            return Err(Error::ChannelClosed.into());
        }
        Ok(())
    }
}

/// 직접 채널 수신자
pub struct DirectReceiver;

impl DirectReceiver {
    /// 수신 태스크 시작. 첫 텍스트 메시지(chunk-meta)를 받으면 InProgress
    pub fn start<S: ChunkSink>(config: &Config, events: mpsc::Receiver<ChannelEvent>, sink: S) -> Transfer {
        let (core, transfer, abort) = TransferCore::new(config, Direction::Receive, None);
        let task = DirectReceiverTask {
            core,
            events,
            sink: ScopedSink::new(sink),
            abort,
        };
        tokio::spawn(task.run());
        transfer
    }
}

struct DirectReceiverTask<S: ChunkSink> {
    core: TransferCore,
    events: mpsc::Receiver<ChannelEvent>,
    sink: ScopedSink<S>,
    abort: AbortSignal,
}

impl<S: ChunkSink> DirectReceiverTask<S> {
    async fn run(mut self) {
        let mut result = self.receive_all().await;

        let Self { core, sink, .. } = self;
        if let Err(e) = sink.close(result.is_ok()).await {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        core.finish(result);
    }

    async fn receive_all(&mut self) -> TaskResult {
        loop {
            let event = tokio::select! {
                biased;
                failure = aborted(&mut self.abort) => return Err(failure),
                event = self.events.recv() => event,
            };

            match event {
                None | Some(ChannelEvent::Closed) => return Err(Error::ChannelClosed.into()),
                Some(ChannelEvent::Open) => debug!("직접 채널 열림"),
                Some(ChannelEvent::Message(ChannelPayload::Text(text))) => {
                    if self.handle_text(&text).await? {
                        return Ok(());
                    }
                }
                Some(ChannelEvent::Message(ChannelPayload::Binary(bytes))) => {
                    if self.handle_binary(bytes).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> std::result::Result<bool, TransferFailure> {
        let message = ControlMessage::from_text(text)?;
        let Some(descriptor) = message.to_descriptor() else {
            debug!("직접 채널 제어 메시지 무시: {}", message.type_name());
            return Ok(false);
        };
        let descriptor = descriptor?;

        if self.core.descriptor().is_some() {
            return Err(Error::Protocol("duplicate chunk-meta on direct channel".into()).into());
        }

        self.sink.open(&descriptor).await?;
        self.core.attach(descriptor);
        Ok(self.core.is_complete())
    }

    async fn handle_binary(&mut self, payload: bytes::Bytes) -> std::result::Result<bool, TransferFailure> {
        // 도착 순서 = 청크 순서
        let index = match self.core.state() {
            Some(state) => state.received_chunks(),
            None => return Err(Error::Protocol("binary chunk before chunk-meta".into()).into()),
        };

        let chunk = Chunk::new(index, payload);
        self.core.record(index, chunk.len())?;
        self.core.stats_mut().total_chunks += 1;
        self.sink.write_chunk(&chunk).await?;

        let done = self
            .core
            .state()
            .is_some_and(|s| s.received_bytes() == s.descriptor().total_size);
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::MemorySink;
    use crate::transfer::TransferStatus;
    use crate::transport::{memory_channel, MemoryChannelOptions};

    fn config(chunk_size: usize, threshold: usize) -> Config {
        Config {
            chunk_size,
            buffered_amount_low_threshold: threshold,
            ..Config::default()
        }
    }

    fn data(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
    }

    fn descriptor(len: usize, chunk_size: usize) -> TransferDescriptor {
        TransferDescriptor::new("photo.jpg", len as u64, "image/jpeg", chunk_size as u32).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_respects_low_water_mark() {
        let config = config(4, 8);
        let payload = data(64);
        let (channel, events) = memory_channel(MemoryChannelOptions {
            event_capacity: 1,
            drain_delay: Some(Duration::from_millis(5)),
            close_after: None,
        });
        let channel = Arc::new(channel);

        let (sink, output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events, sink);
        let sender = DirectSender::start(&config, descriptor(64, 4), payload.clone(), channel.clone());

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());

        assert_eq!(channel.sends_over_threshold(), 0);
        assert_eq!(channel.sends(), 17);
        // 메타데이터 이후로는 임계값 + 청크 하나를 넘지 않음
        let meta_len = ControlMessage::chunk_meta(&descriptor(64, 4)).to_text().unwrap().len();
        assert!(channel.peak_buffered() <= meta_len.max(8 + 4));
        assert_eq!(channel.buffered_amount(), 0);
        assert_eq!(output.take().unwrap(), payload);
        assert_eq!(receiver.handle.progress().received_bytes, 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_closed_mid_transfer() {
        let config = config(4, 8);
        let (channel, events) = memory_channel(MemoryChannelOptions {
            close_after: Some(5),
            ..Default::default()
        });

        let (sink, output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events, sink);
        let sender = DirectSender::start(&config, descriptor(40, 4), data(40), Arc::new(channel));

        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChannelClosed));
        assert_eq!(outcome.progress.received_bytes, 20);
        assert!(output.take().is_none());

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChannelClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_data_never_reports_complete() {
        let config = config(4, 8);
        let (channel, events) = memory_channel(MemoryChannelOptions::default());
        let channel = Arc::new(channel);

        let (sink, output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events, sink);
        let sender = DirectSender::start(&config, descriptor(10, 4), data(8), channel.clone());

        let outcome = sender.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Failed);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Protocol));
        assert_eq!(channel.sends(), 0);

        // 채널을 닫으므로 수신자도 기다리지 않고 끝난다
        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChannelClosed));
        assert!(output.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_direct_transfer() {
        let config = config(4, 8);
        let (channel, events) = memory_channel(MemoryChannelOptions::default());

        let (sink, output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events, sink);
        let sender = DirectSender::start(&config, descriptor(0, 4), Bytes::new(), Arc::new(channel));

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(output.take().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_cancel_discards_later_chunks() {
        let config = config(4, 1024);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (sink, output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events_rx, sink);

        let meta = ControlMessage::chunk_meta(&descriptor(8, 4)).to_text().unwrap();
        events_tx
            .send(ChannelEvent::Message(ChannelPayload::Text(meta)))
            .await
            .unwrap();
        events_tx
            .send(ChannelEvent::Message(ChannelPayload::Binary(data(4))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        receiver.handle.cancel();
        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Cancelled);

        // 취소 이후 도착분은 버려진다
        let _ = events_tx
            .send(ChannelEvent::Message(ChannelPayload::Binary(data(4))))
            .await;
        assert_eq!(receiver.handle.progress().received_bytes, 4);
        assert!(output.take().is_none());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_queued_close() {
        for _ in 0..20 {
            let config = config(4, 1024);
            let (events_tx, events_rx) = mpsc::channel(4);
            let (sink, _output) = MemorySink::new();
            let receiver = DirectReceiver::start(&config, events_rx, sink);

            receiver.handle.cancel();
            events_tx.send(ChannelEvent::Closed).await.unwrap();

            let outcome = receiver.handle.wait().await;
            assert_eq!(outcome.status, TransferStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_binary_before_meta_is_protocol_error() {
        let config = config(4, 1024);
        let (events_tx, events_rx) = mpsc::channel(4);
        let (sink, _output) = MemorySink::new();
        let receiver = DirectReceiver::start(&config, events_rx, sink);

        events_tx
            .send(ChannelEvent::Message(ChannelPayload::Binary(data(4))))
            .await
            .unwrap();

        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Protocol));
    }
}
