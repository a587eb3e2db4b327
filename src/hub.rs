//! 릴레이 허브
//!
//! 허브 태스크 하나가 방 레지스트리와 연결 목록을 소유한다. 연결마다 읽기 태스크가 있어서
//! 들어온 메시지를 명령 채널로 허브에 넘긴다.
//!
//! - 방 관련 요청(create/join/close/leave)은 허브가 직접 처리하고 응답한다
//! - 그 밖의 메시지(메타데이터, 청크, ACK, 채팅 등)는 같은 방의 다른 멤버에게 그대로 전달한다
//! - 호스트 연결이 끊기면 방을 닫고 "host left"를 알린다

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::message::{ControlMessage, WireMessage};
use crate::room::{LeaveOutcome, MemberId, MemberRef, RoomId, RoomRegistry};
use crate::transport::RelayLink;
use crate::{Config, Error, Result};

/// 허브 내부 명령
enum HubCmd {
    Connect {
        member: MemberId,
        outbound: mpsc::Sender<WireMessage>,
    },
    Message {
        member: MemberId,
        message: WireMessage,
    },
    Disconnect {
        member: MemberId,
    },
    OpenRooms {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 허브 핸들 (복제 가능)
#[derive(Debug, Clone)]
pub struct RelayHub {
    cmd_tx: mpsc::Sender<HubCmd>,
    next_member: Arc<AtomicU64>,
    link_buffer: usize,
}

impl std::fmt::Debug for HubCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubCmd::Connect { member, .. } => write!(f, "Connect({})", member),
            HubCmd::Message { member, .. } => write!(f, "Message({})", member),
            HubCmd::Disconnect { member } => write!(f, "Disconnect({})", member),
            HubCmd::OpenRooms { .. } => write!(f, "OpenRooms"),
            HubCmd::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl RelayHub {
    /// 허브 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn spawn(config: &Config) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.link_buffer.max(1));
        let inner = HubInner {
            registry: RoomRegistry::new(config),
            connections: HashMap::new(),
        };
        tokio::spawn(inner.run(cmd_rx));

        Self {
            cmd_tx,
            next_member: Arc::new(AtomicU64::new(1)),
            link_buffer: config.link_buffer.max(1),
        }
    }

    /// 새 연결. 멤버 ID와 클라이언트측 링크 반환
    pub async fn connect(&self) -> Result<(MemberId, RelayLink)> {
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (to_client_tx, to_client_rx) = mpsc::channel(self.link_buffer);
        let (from_client_tx, mut from_client_rx) = mpsc::channel::<WireMessage>(self.link_buffer);

        self.cmd_tx
            .send(HubCmd::Connect {
                member,
                outbound: to_client_tx,
            })
            .await
            .map_err(|_| Error::ServiceStopped)?;

        // 연결별 읽기 태스크
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client_rx.recv().await {
                if cmd_tx.send(HubCmd::Message { member, message }).await.is_err() {
                    return;
                }
            }
            let _ = cmd_tx.send(HubCmd::Disconnect { member }).await;
        });

        debug!("허브 연결: member={}", member);
        Ok((member, RelayLink::new(from_client_tx, to_client_rx)))
    }

    /// 열린 방 수
    pub async fn open_rooms(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCmd::OpenRooms { reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// 모든 방을 닫고 허브 종료
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCmd::Shutdown { reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }
}

/// 허브 내부 상태 (단일 태스크에서만 접근)
struct HubInner {
    registry: RoomRegistry,
    connections: HashMap<MemberId, mpsc::Sender<WireMessage>>,
}

impl HubInner {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HubCmd>) {
        info!("릴레이 허브 시작");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCmd::Connect { member, outbound } => {
                    self.connections.insert(member, outbound);
                }
                HubCmd::Message { member, message } => self.handle_message(member, message),
                HubCmd::Disconnect { member } => {
                    debug!("허브 연결 종료: member={}", member);
                    self.handle_leave(member);
                    self.connections.remove(&member);
                }
                HubCmd::OpenRooms { reply } => {
                    let _ = reply.send(self.registry.open_rooms());
                }
                HubCmd::Shutdown { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        info!("릴레이 허브 종료");
    }

    fn deliver(&self, member: MemberId, message: WireMessage) {
        let Some(outbound) = self.connections.get(&member) else {
            return;
        };
        match outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                // 릴레이 전송은 ACK 재전송으로 복구된다
                warn!("member {} 수신 큐 가득 참, 메시지 버림: {:?}", member, kind_of(&message));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("member {} 이미 연결 종료", member);
            }
        }
    }

    fn broadcast(&self, targets: &[MemberRef], message: &ControlMessage) {
        for target in targets {
            self.deliver(target.id, WireMessage::Control(message.clone()));
        }
    }

    fn reply_error(&self, member: MemberId, room_id: Option<RoomId>, err: Error) {
        debug!("member {} 요청 실패: {}", member, err);
        self.deliver(
            member,
            ControlMessage::RoomError {
                room_id,
                reason: err.to_string(),
            }
            .into(),
        );
    }

    fn handle_message(&mut self, member: MemberId, message: WireMessage) {
        let control = match message {
            WireMessage::Control(control) => control,
            binary @ WireMessage::Binary(_) => {
                self.forward(member, binary);
                return;
            }
        };

        match control {
            ControlMessage::CreateRoom { capacity } => match self.registry.create(member, capacity) {
                Ok(room_id) => self.deliver(
                    member,
                    ControlMessage::RoomCreated {
                        room_id,
                        member_id: member,
                    }
                    .into(),
                ),
                Err(e) => self.reply_error(member, None, e),
            },

            ControlMessage::JoinRoom { room_id } => match self.registry.join(room_id, member) {
                Ok(existing) => {
                    self.deliver(
                        member,
                        ControlMessage::RoomJoined {
                            room_id,
                            member_id: member,
                            members: existing.len() + 1,
                        }
                        .into(),
                    );
                    self.broadcast(&existing, &ControlMessage::PeerJoined { member_id: member });
                }
                Err(e) => self.reply_error(member, Some(room_id), e),
            },

            ControlMessage::CloseRoom { reason } => {
                let Some(room_id) = self.registry.room_of(member).map(|r| r.id()) else {
                    self.reply_error(member, None, Error::Protocol("not in a room".into()));
                    return;
                };
                match self.registry.close(room_id, member, reason.clone()) {
                    Ok(room) => {
                        let members = room.members().to_vec();
                        self.broadcast(&members, &ControlMessage::RoomClosed { reason });
                    }
                    Err(e) => self.reply_error(member, Some(room_id), e),
                }
            }

            ControlMessage::LeaveRoom => self.handle_leave(member),

            other => self.forward(member, WireMessage::Control(other)),
        }
    }

    fn handle_leave(&mut self, member: MemberId) {
        let Some((room_id, outcome)) = self.registry.leave(member) else {
            return;
        };
        match outcome {
            LeaveOutcome::PeerLeft { remaining } => {
                debug!("방 {:06} 피어 이탈: {}", room_id, member);
                self.broadcast(&remaining, &ControlMessage::PeerLeft { member_id: member });
            }
            LeaveOutcome::RoomClosed { notify } => {
                self.broadcast(
                    &notify,
                    &ControlMessage::RoomClosed {
                        reason: Some("host left".to_string()),
                    },
                );
            }
        }
    }

    /// 같은 방의 다른 멤버에게 전달
    fn forward(&mut self, member: MemberId, message: WireMessage) {
        let Some(room) = self.registry.room_of(member) else {
            self.reply_error(member, None, Error::Protocol("not in a room".into()));
            return;
        };
        let targets = room.others(member);
        trace!(
            "방 {:06} 전달: {} from {} to {} members",
            room.id(),
            kind_of(&message),
            member,
            targets.len()
        );
        for target in targets {
            self.deliver(target.id, message.clone());
        }
    }

    fn shutdown(&mut self) {
        let rooms = self.registry.drain();
        for room in &rooms {
            let members = room.members().to_vec();
            self.broadcast(
                &members,
                &ControlMessage::RoomClosed {
                    reason: room.close_reason().map(str::to_string),
                },
            );
        }
        info!("허브 종료: {}개 방 닫음", rooms.len());
        self.connections.clear();
    }
}

fn kind_of(message: &WireMessage) -> &'static str {
    match message {
        WireMessage::Control(control) => control.type_name(),
        WireMessage::Binary(_) => "binary",
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::chunk::TransferDescriptor;
    use crate::relay::{RelayReceiver, RelaySender};
    use crate::sink::MemorySink;

    async fn expect(link: &mut RelayLink) -> ControlMessage {
        match link.recv().await {
            Some(WireMessage::Control(msg)) => msg,
            other => panic!("expected control message, got {:?}", other),
        }
    }

    async fn open_room(hub: &RelayHub, capacity: Option<usize>) -> (RoomId, RelayLink) {
        let (_, mut host) = hub.connect().await.unwrap();
        host.send(ControlMessage::CreateRoom { capacity }).await.unwrap();
        match expect(&mut host).await {
            ControlMessage::RoomCreated { room_id, .. } => (room_id, host),
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn join(hub: &RelayHub, room_id: RoomId) -> (MemberId, RelayLink, ControlMessage) {
        let (member, mut link) = hub.connect().await.unwrap();
        link.send(ControlMessage::JoinRoom { room_id }).await.unwrap();
        let reply = expect(&mut link).await;
        (member, link, reply)
    }

    #[tokio::test]
    async fn test_create_join_and_forward() {
        let hub = RelayHub::spawn(&Config::default());
        let (room_id, mut host) = open_room(&hub, None).await;
        assert!((100_000..=999_999).contains(&room_id));

        let (peer_id, mut peer, reply) = join(&hub, room_id).await;
        assert_eq!(
            reply,
            ControlMessage::RoomJoined {
                room_id,
                member_id: peer_id,
                members: 2
            }
        );
        assert_eq!(
            expect(&mut host).await,
            ControlMessage::PeerJoined { member_id: peer_id }
        );

        host.send(ControlMessage::Chat {
            sender: "host".into(),
            text: "hello".into(),
        })
        .await
        .unwrap();
        assert!(matches!(expect(&mut peer).await, ControlMessage::Chat { .. }));

        peer.send(WireMessage::Binary(Bytes::from_static(b"raw")))
            .await
            .unwrap();
        assert_eq!(
            host.recv().await,
            Some(WireMessage::Binary(Bytes::from_static(b"raw")))
        );
        assert_eq!(hub.open_rooms().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_join_unavailable_rooms() {
        let hub = RelayHub::spawn(&Config::default());
        let (room_id, _host) = open_room(&hub, Some(2)).await;

        let (_, _peer, reply) = join(&hub, room_id).await;
        assert!(matches!(reply, ControlMessage::RoomJoined { .. }));

        // 가득 찬 방
        let (_, _late, reply) = join(&hub, room_id).await;
        assert!(matches!(reply, ControlMessage::RoomError { room_id: Some(id), .. } if id == room_id));

        // 없는 방
        let missing = if room_id == 999_999 { 100_000 } else { room_id + 1 };
        let (_, _lost, reply) = join(&hub, missing).await;
        assert!(matches!(reply, ControlMessage::RoomError { .. }));
    }

    #[tokio::test]
    async fn test_only_host_closes_room() {
        let hub = RelayHub::spawn(&Config::default());
        let (room_id, mut host) = open_room(&hub, Some(3)).await;
        let (_, mut peer, _) = join(&hub, room_id).await;
        expect(&mut host).await; // peer-joined

        peer.send(ControlMessage::CloseRoom { reason: None }).await.unwrap();
        assert!(matches!(expect(&mut peer).await, ControlMessage::RoomError { .. }));

        host.send(ControlMessage::CloseRoom {
            reason: Some("done".into()),
        })
        .await
        .unwrap();
        let closed = ControlMessage::RoomClosed {
            reason: Some("done".into()),
        };
        assert_eq!(expect(&mut host).await, closed);
        assert_eq!(expect(&mut peer).await, closed);
        assert_eq!(hub.open_rooms().await.unwrap(), 0);

        // 닫힌 방에는 참가 불가
        let (_, _late, reply) = join(&hub, room_id).await;
        assert!(matches!(reply, ControlMessage::RoomError { .. }));
    }

    #[tokio::test]
    async fn test_host_disconnect_closes_room() {
        let hub = RelayHub::spawn(&Config::default());
        let (room_id, mut host) = open_room(&hub, Some(3)).await;
        let (peer_id, mut peer, _) = join(&hub, room_id).await;
        expect(&mut host).await;

        let (_, mut third, _) = join(&hub, room_id).await;
        expect(&mut host).await;
        expect(&mut peer).await;

        third.send(ControlMessage::LeaveRoom).await.unwrap();
        assert!(matches!(expect(&mut host).await, ControlMessage::PeerLeft { .. }));
        assert!(matches!(expect(&mut peer).await, ControlMessage::PeerLeft { .. }));

        drop(host);
        assert_eq!(
            expect(&mut peer).await,
            ControlMessage::RoomClosed {
                reason: Some("host left".into())
            }
        );
        assert_eq!(hub.open_rooms().await.unwrap(), 0);
        let _ = peer_id;
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_transfer_through_hub() {
        let config = Config::default().with_chunk_size(1024);
        let hub = RelayHub::spawn(&config);
        let (room_id, mut host) = open_room(&hub, None).await;
        let (_, peer, _) = join(&hub, room_id).await;
        expect(&mut host).await;

        let payload = Bytes::from((0..5000u32).map(|i| (i % 256) as u8).collect::<Vec<u8>>());
        let descriptor = TransferDescriptor::new("notes.txt", 5000, "text/plain", 1024).unwrap();

        let (sink, output) = MemorySink::new();
        let receiver = RelayReceiver::start(&config, peer, sink);
        let sender = RelaySender::start(&config, descriptor, payload.clone(), host);

        assert!(sender.handle.wait().await.is_complete());
        assert!(receiver.handle.wait().await.is_complete());
        assert_eq!(output.take().unwrap(), payload);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_room() {
        let hub = RelayHub::spawn(&Config::default());
        let (room_id, mut host) = open_room(&hub, None).await;
        let (_, mut peer, _) = join(&hub, room_id).await;
        expect(&mut host).await;

        hub.shutdown().await.unwrap();
        let closed = ControlMessage::RoomClosed {
            reason: Some("service shutdown".into()),
        };
        assert_eq!(expect(&mut host).await, closed);
        assert_eq!(expect(&mut peer).await, closed);
        assert_eq!(peer.recv().await, None);

        assert!(matches!(hub.connect().await, Err(Error::ServiceStopped)));
    }
}
