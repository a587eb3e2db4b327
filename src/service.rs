//! 프로세스 단위 공유 서비스
//!
//! 릴레이 허브, 진행 중인 전송 목록, 그룹 목록을 한 객체가 소유한다.
//! `init`으로 시작하고 `shutdown`으로 모든 전송을 취소한 뒤 허브를 멈춘다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::chunk::TransferDescriptor;
use crate::direct::{DirectReceiver, DirectSender};
use crate::group::GroupCoordinator;
use crate::hub::RelayHub;
use crate::relay::{RelayReceiver, RelaySender};
use crate::room::{MemberId, RoomId};
use crate::sink::ChunkSink;
use crate::transfer::{Transfer, TransferHandle, TransferId};
use crate::transport::{ChannelEvent, DataChannel, RelayLink};
use crate::{Config, Error, Result};

/// 공유 서비스
#[derive(Debug)]
pub struct ShareService {
    config: Config,
    hub: RelayHub,
    transfers: Arc<DashMap<TransferId, TransferHandle>>,
    groups: DashMap<RoomId, GroupCoordinator>,
    running: AtomicBool,
}

impl ShareService {
    /// 서비스 시작 (tokio 런타임 안에서 호출)
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let hub = RelayHub::spawn(&config);
        info!(
            "공유 서비스 시작: chunk_size={}, ack_timeout={}ms, max_attempts={}",
            config.chunk_size, config.ack_timeout_ms, config.max_attempts
        );

        Ok(Self {
            config,
            hub,
            transfers: Arc::new(DashMap::new()),
            groups: DashMap::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ServiceStopped)
        }
    }

    /// 파일 디스크립터 생성 (설정의 청크 크기 사용)
    pub fn describe(&self, file_name: impl Into<String>, data: &Bytes, mime_type: impl Into<String>) -> Result<TransferDescriptor> {
        TransferDescriptor::new(
            file_name,
            data.len() as u64,
            mime_type,
            self.config.chunk_size as u32,
        )
    }

    /// 허브에 새 연결
    pub async fn connect(&self) -> Result<(MemberId, RelayLink)> {
        self.ensure_running()?;
        self.hub.connect().await
    }

    /// 릴레이 송신 시작
    pub fn send_relay(&self, descriptor: TransferDescriptor, data: Bytes, link: RelayLink) -> Result<Transfer> {
        self.ensure_running()?;
        Ok(self.track(RelaySender::start(&self.config, descriptor, data, link)))
    }

    /// 릴레이 수신 시작
    pub fn receive_relay<S: ChunkSink>(&self, link: RelayLink, sink: S) -> Result<Transfer> {
        self.ensure_running()?;
        Ok(self.track(RelayReceiver::start(&self.config, link, sink)))
    }

    /// 직접 채널 송신 시작
    pub fn send_direct<C: DataChannel>(
        &self,
        descriptor: TransferDescriptor,
        data: Bytes,
        channel: Arc<C>,
    ) -> Result<Transfer> {
        self.ensure_running()?;
        Ok(self.track(DirectSender::start(&self.config, descriptor, data, channel)))
    }

    /// 직접 채널 수신 시작
    pub fn receive_direct<S: ChunkSink>(&self, events: mpsc::Receiver<ChannelEvent>, sink: S) -> Result<Transfer> {
        self.ensure_running()?;
        Ok(self.track(DirectReceiver::start(&self.config, events, sink)))
    }

    /// 방에 그룹 코디네이터 생성 (방마다 하나)
    pub fn open_group(&self, room_id: RoomId, host: MemberId) -> Result<GroupCoordinator> {
        self.ensure_running()?;
        let group = self
            .groups
            .entry(room_id)
            .or_insert_with(|| GroupCoordinator::new(self.config.clone(), room_id, host))
            .clone();
        if group.host() != host {
            return Err(Error::NotHost { member_id: host });
        }
        Ok(group)
    }

    /// 그룹 닫기
    pub fn close_group(&self, room_id: RoomId, reason: impl Into<String>) {
        if let Some((_, group)) = self.groups.remove(&room_id) {
            group.close(reason);
        }
    }

    /// 진행 중인 전송
    pub fn active_transfers(&self) -> Vec<TransferHandle> {
        self.transfers
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn track(&self, transfer: Transfer) -> Transfer {
        let handle = transfer.handle.clone();
        let id = handle.id();
        self.transfers.insert(id, handle.clone());

        let transfers = self.transfers.clone();
        tokio::spawn(async move {
            handle.wait().await;
            transfers.remove(&id);
            debug!("전송 {} 목록에서 제거", id);
        });
        transfer
    }

    /// 서비스 종료: 모든 전송 취소, 그룹 종료, 허브 정지
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let active = self.active_transfers();
        info!("공유 서비스 종료: 진행 중인 전송 {}개 취소", active.len());
        for handle in &active {
            handle.cancel();
        }

        let rooms: Vec<RoomId> = self.groups.iter().map(|entry| *entry.key()).collect();
        for room_id in rooms {
            self.close_group(room_id, "service shutdown");
        }

        self.hub.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::message::{ControlMessage, WireMessage};
    use crate::sink::MemorySink;
    use crate::transfer::TransferStatus;
    use crate::transport::{memory_channel, MemoryChannelOptions};

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        // 검증이 런타임보다 먼저
        assert!(matches!(ShareService::init(config), Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_direct_transfer_is_tracked() {
        let service = ShareService::init(Config::default().with_chunk_size(16)).unwrap();
        let data = Bytes::from(vec![9u8; 100]);
        let descriptor = service.describe("blob.bin", &data, "").unwrap();
        assert_eq!(descriptor.total_chunks(), 7);

        let (channel, events) = memory_channel(MemoryChannelOptions::default());
        let (sink, output) = MemorySink::new();
        let receiver = service.receive_direct(events, sink).unwrap();
        let sender = service.send_direct(descriptor, data.clone(), Arc::new(channel)).unwrap();

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(output.take().unwrap(), data);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_transfers() {
        let service = ShareService::init(Config::default()).unwrap();
        let (_, mut host) = service.connect().await.unwrap();
        host.send(ControlMessage::CreateRoom { capacity: None }).await.unwrap();
        let room_id = match host.recv().await {
            Some(WireMessage::Control(ControlMessage::RoomCreated { room_id, .. })) => room_id,
            other => panic!("unexpected {:?}", other),
        };
        let (_, peer) = service.connect().await.unwrap();
        peer.send(ControlMessage::JoinRoom { room_id }).await.unwrap();

        // 메타데이터를 기다리는 수신자
        let (sink, _output) = MemorySink::new();
        let receiver = service.receive_relay(peer, sink).unwrap();
        assert_eq!(service.active_transfers().len(), 1);

        let group = service.open_group(room_id, 1).unwrap();
        assert!(service.open_group(room_id, 2).is_err());

        service.shutdown().await.unwrap();
        let outcome = receiver.handle.wait().await;
        assert_eq!(outcome.status, TransferStatus::Cancelled);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
        assert!(group.is_closed());

        assert!(matches!(service.connect().await, Err(Error::ServiceStopped)));
        let (sink, _) = MemorySink::new();
        let (_, events) = memory_channel(MemoryChannelOptions::default());
        assert!(matches!(
            service.receive_direct(events, sink),
            Err(Error::ServiceStopped)
        ));
    }
}
