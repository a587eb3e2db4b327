//! 그룹 팬아웃 코디네이터
//!
//! 호스트가 아티팩트를 공개(publish)하면 각 피어가 독립적으로 구독(subscribe)해서 받아 간다.
//! 호스트가 피어마다 밀어주지 않는다. 피어 하나의 실패는 다른 피어의 전송에 영향을 주지 않는다.
//!
//! "전체 완료" 신호는 등록된 모든 멤버가 공개된 모든 아티팩트를 구독해서 Complete에 도달했을 때
//! 정확히 한 번 발생한다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chunk::TransferDescriptor;
use crate::direct::{DirectReceiver, DirectSender};
use crate::error::ErrorKind;
use crate::message::ControlMessage;
use crate::room::{MemberId, RoomId};
use crate::sink::ChunkSink;
use crate::transfer::{Transfer, TransferFailure, TransferHandle, TransferStatus};
use crate::transport::{ChannelEvent, DataChannel};
use crate::{Config, Error, Result};

/// 아티팩트 ID (그룹 내 고유)
pub type ArtifactId = u64;

#[derive(Debug, Clone)]
struct Artifact {
    descriptor: TransferDescriptor,
    data: Bytes,
    published_at: SystemTime,
}

/// 공개된 아티팩트 정보
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactInfo {
    pub id: ArtifactId,
    pub descriptor: TransferDescriptor,
    pub published_at: SystemTime,
}

#[derive(Debug)]
struct Subscription {
    sender: TransferHandle,
    receiver: TransferHandle,
}

/// 멤버별 집계
#[derive(Debug, Clone, PartialEq)]
pub struct MemberReport {
    pub status: TransferStatus,
    /// 첫 번째 실패 (있으면)
    pub failure: Option<TransferFailure>,
    /// 구독한 아티팩트 수
    pub subscribed: usize,
}

impl MemberReport {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// 그룹 집계
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub members: BTreeMap<MemberId, MemberReport>,
    pub fully_complete: bool,
}

#[derive(Debug, Default)]
struct GroupInner {
    closed: Option<String>,
    members: BTreeSet<MemberId>,
    artifacts: BTreeMap<ArtifactId, Artifact>,
    subscriptions: HashMap<(MemberId, ArtifactId), Subscription>,
    next_artifact_id: ArtifactId,
    all_complete_fired: bool,
}

impl GroupInner {
    fn member_report(&self, member: MemberId) -> MemberReport {
        let mut statuses = Vec::new();
        let mut failure = None;

        for artifact_id in self.artifacts.keys() {
            let Some(sub) = self.subscriptions.get(&(member, *artifact_id)) else {
                continue;
            };
            let outcome = sub.receiver.outcome();
            let status = outcome
                .as_ref()
                .map(|o| o.status)
                .unwrap_or_else(|| sub.receiver.status());
            if failure.is_none() {
                failure = outcome.and_then(|o| o.failure);
            }
            statuses.push(status);
        }

        let subscribed = statuses.len();
        let status = if statuses.contains(&TransferStatus::Failed) {
            TransferStatus::Failed
        } else if statuses.contains(&TransferStatus::Cancelled) {
            TransferStatus::Cancelled
        } else if subscribed > 0
            && subscribed == self.artifacts.len()
            && statuses.iter().all(|s| *s == TransferStatus::Complete)
        {
            TransferStatus::Complete
        } else if statuses.iter().all(|s| *s == TransferStatus::Pending) {
            TransferStatus::Pending
        } else {
            TransferStatus::InProgress
        };

        MemberReport {
            status,
            failure,
            subscribed,
        }
    }

    fn report(&self) -> GroupReport {
        let members: BTreeMap<_, _> = self
            .members
            .iter()
            .map(|m| (*m, self.member_report(*m)))
            .collect();
        let fully_complete = !members.is_empty()
            && !self.artifacts.is_empty()
            && members.values().all(|r| r.status == TransferStatus::Complete);
        GroupReport {
            members,
            fully_complete,
        }
    }
}

/// 그룹 팬아웃 코디네이터
///
/// 복제 가능. 내부 상태는 잠금으로 보호되며 조회는 스냅샷을 만든다.
#[derive(Debug, Clone)]
pub struct GroupCoordinator {
    config: Config,
    room_id: RoomId,
    host: MemberId,
    inner: Arc<Mutex<GroupInner>>,
    all_complete: Arc<watch::Sender<bool>>,
}

impl GroupCoordinator {
    pub fn new(config: Config, room_id: RoomId, host: MemberId) -> Self {
        let (all_complete, _) = watch::channel(false);
        Self {
            config,
            room_id,
            host,
            inner: Arc::new(Mutex::new(GroupInner {
                next_artifact_id: 1,
                ..Default::default()
            })),
            all_complete: Arc::new(all_complete),
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn host(&self) -> MemberId {
        self.host
    }

    /// 수신 멤버 등록 (호스트 제외)
    pub fn add_member(&self, member: MemberId) -> Result<()> {
        if member == self.host {
            return Err(Error::Protocol("host cannot be a group receiver".into()));
        }
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::RoomClosed {
                reason: reason.clone(),
            });
        }
        if inner.members.insert(member) {
            debug!("그룹 {:06} 멤버 등록: {}", self.room_id, member);
        }
        Ok(())
    }

    /// 멤버 제거. 진행 중인 구독은 취소된다
    pub fn remove_member(&self, member: MemberId) {
        let mut inner = self.inner.lock();
        inner.members.remove(&member);
        let keys: Vec<_> = inner
            .subscriptions
            .keys()
            .filter(|(m, _)| *m == member)
            .copied()
            .collect();
        for key in keys {
            if let Some(sub) = inner.subscriptions.remove(&key) {
                sub.receiver.cancel();
                sub.sender.cancel();
            }
        }
        drop(inner);
        self.check_all_complete();
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.inner.lock().members.iter().copied().collect()
    }

    /// 아티팩트 공개 (호스트 전용)
    pub fn publish(&self, by: MemberId, descriptor: TransferDescriptor, data: Bytes) -> Result<ArtifactId> {
        if by != self.host {
            return Err(Error::NotHost { member_id: by });
        }
        if descriptor.total_size != data.len() as u64 {
            return Err(Error::Protocol(format!(
                "descriptor size {} does not match data length {}",
                descriptor.total_size,
                data.len()
            )));
        }

        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::RoomClosed {
                reason: reason.clone(),
            });
        }
        let id = inner.next_artifact_id;
        inner.next_artifact_id += 1;
        info!(
            "그룹 {:06} 아티팩트 공개: id={}, {} ({} bytes)",
            self.room_id, id, descriptor.file_name, descriptor.total_size
        );
        inner.artifacts.insert(
            id,
            Artifact {
                descriptor,
                data,
                published_at: SystemTime::now(),
            },
        );
        Ok(id)
    }

    /// 피어에게 보낼 공개 알림 메시지
    pub fn announcement(&self, artifact_id: ArtifactId) -> Result<ControlMessage> {
        let inner = self.inner.lock();
        let artifact = inner
            .artifacts
            .get(&artifact_id)
            .ok_or(Error::UnknownArtifact { artifact_id })?;
        Ok(ControlMessage::ArtifactPublished {
            artifact_id,
            descriptor: artifact.descriptor.clone(),
        })
    }

    /// 공개된 아티팩트 목록 (늦게 들어온 멤버는 전부 구독해야 한다)
    pub fn artifacts(&self) -> Vec<ArtifactInfo> {
        self.inner
            .lock()
            .artifacts
            .iter()
            .map(|(id, a)| ArtifactInfo {
                id: *id,
                descriptor: a.descriptor.clone(),
                published_at: a.published_at,
            })
            .collect()
    }

    /// 아티팩트 구독: 멤버 전용 직접 채널로 송신/수신 전송을 시작하고 수신측 전송을 반환
    ///
    /// 실패한 구독은 다시 구독할 수 있다. 진행 중이거나 완료된 구독을 다시 요청하면 에러.
    pub fn subscribe<C, S>(
        &self,
        artifact_id: ArtifactId,
        member: MemberId,
        channel: Arc<C>,
        events: mpsc::Receiver<ChannelEvent>,
        sink: S,
    ) -> Result<Transfer>
    where
        C: DataChannel,
        S: ChunkSink,
    {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::RoomClosed {
                reason: reason.clone(),
            });
        }
        if !inner.members.contains(&member) {
            return Err(Error::Protocol(format!("member {} is not in the group", member)));
        }
        let artifact = inner
            .artifacts
            .get(&artifact_id)
            .cloned()
            .ok_or(Error::UnknownArtifact { artifact_id })?;

        if let Some(existing) = inner.subscriptions.get(&(member, artifact_id)) {
            let status = existing.receiver.status();
            if !matches!(status, TransferStatus::Failed | TransferStatus::Cancelled) {
                return Err(Error::Protocol(format!(
                    "member {} already subscribed to artifact {} ({:?})",
                    member, artifact_id, status
                )));
            }
            debug!("멤버 {} 아티팩트 {} 재구독", member, artifact_id);
        }

        let receiver = DirectReceiver::start(&self.config, events, sink);
        let sender = DirectSender::start(&self.config, artifact.descriptor, artifact.data, channel);
        inner.subscriptions.insert(
            (member, artifact_id),
            Subscription {
                sender: sender.handle.clone(),
                receiver: receiver.handle.clone(),
            },
        );
        drop(inner);

        info!(
            "그룹 {:06} 구독: member={}, artifact={}",
            self.room_id, member, artifact_id
        );

        let coordinator = self.clone();
        let watched = receiver.handle.clone();
        tokio::spawn(async move {
            let outcome = watched.wait().await;
            if let Some(failure) = &outcome.failure {
                warn!(
                    "그룹 {:06} member={} artifact={} 실패: {}",
                    coordinator.room_id, member, artifact_id, failure
                );
            }
            coordinator.check_all_complete();
        });

        Ok(receiver)
    }

    /// 현재 집계
    pub fn report(&self) -> GroupReport {
        self.inner.lock().report()
    }

    /// 전체 완료 신호가 이미 발생했는지
    pub fn is_all_complete(&self) -> bool {
        *self.all_complete.borrow()
    }

    /// 전체 완료 대기
    pub async fn all_complete(&self) {
        let mut rx = self.all_complete.subscribe();
        // 송신측을 self가 들고 있으므로 닫히지 않는다
        let _ = rx.wait_for(|done| *done).await;
    }

    fn check_all_complete(&self) {
        let mut inner = self.inner.lock();
        if inner.all_complete_fired || inner.closed.is_some() {
            return;
        }
        if inner.report().fully_complete {
            inner.all_complete_fired = true;
            drop(inner);
            info!("그룹 {:06} 전체 완료", self.room_id);
            self.all_complete.send_replace(true);
        }
    }

    /// 그룹 종료. 진행 중인 모든 전송을 RoomClosed로 중단
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return;
        }
        info!("그룹 {:06} 종료: {}", self.room_id, reason);

        let failure = TransferFailure::new(ErrorKind::RoomClosed, reason.clone());
        for sub in inner.subscriptions.values() {
            sub.receiver.abort(failure.clone());
            sub.sender.abort(failure.clone());
        }
        inner.closed = Some(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}
