//! 방(Room) 상태 머신과 레지스트리
//!
//! NoRoom → Created(Open, 호스트 1명) → Joined(Open, 2..capacity명) → Closed
//!
//! 이 모듈은 순수 상태만 다룬다. 메시지 브로드캐스트는 hub 태스크가 담당한다.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Config, Error, Result};

/// 6자리 방 코드
pub type RoomId = u32;

/// 멤버 ID (연결 단위)
pub type MemberId = u64;

/// 방 코드 범위 (항상 6자리)
const ROOM_ID_MIN: RoomId = 100_000;
const ROOM_ID_MAX: RoomId = 999_999;

/// 방 코드 생성 최대 시도 횟수
const MAX_ID_ATTEMPTS: usize = 64;

/// 멤버 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Peer,
}

/// 방 멤버
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: MemberId,
    pub role: Role,
}

/// 방 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Open,
    Closed,
}

/// 방 단계 (상태 + 인원으로 유도)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Created,
    Joined,
    Closed,
}

/// 멤버 이탈 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// 피어가 나감, 남은 멤버
    PeerLeft { remaining: Vec<MemberRef> },
    /// 호스트가 나가서 방이 닫힘, 알림 대상 멤버
    RoomClosed { notify: Vec<MemberRef> },
}

/// 방
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    capacity_max: usize,
    members: Vec<MemberRef>,
    state: RoomState,
    close_reason: Option<String>,
}

impl Room {
    /// 새 방 생성 (생성자가 호스트)
    pub fn new(id: RoomId, capacity_max: usize, host: MemberId) -> Self {
        Self {
            id,
            capacity_max,
            members: vec![MemberRef {
                id: host,
                role: Role::Host,
            }],
            state: RoomState::Open,
            close_reason: None,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn capacity_max(&self) -> usize {
        self.capacity_max
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// 참가 순서대로 정렬된 멤버
    pub fn members(&self) -> &[MemberRef] {
        &self.members
    }

    /// 호스트 (방 수명 동안 불변)
    pub fn host(&self) -> MemberId {
        self.members[0].id
    }

    pub fn is_open(&self) -> bool {
        self.state == RoomState::Open
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity_max
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.members.iter().any(|m| m.id == member)
    }

    pub fn phase(&self) -> RoomPhase {
        match (self.state, self.members.len()) {
            (RoomState::Closed, _) => RoomPhase::Closed,
            (RoomState::Open, 1) => RoomPhase::Created,
            (RoomState::Open, _) => RoomPhase::Joined,
        }
    }

    /// 자신을 제외한 멤버
    pub fn others(&self, member: MemberId) -> Vec<MemberRef> {
        self.members.iter().filter(|m| m.id != member).copied().collect()
    }

    /// 피어 참가
    ///
    /// 닫혔거나 가득 찬 방이면 멤버를 바꾸지 않고 RoomUnavailable. 성공 시 기존 멤버 목록 반환.
    pub fn join(&mut self, member: MemberId) -> Result<Vec<MemberRef>> {
        if !self.is_open() {
            return Err(self.unavailable("방이 닫힘"));
        }
        if self.contains(member) {
            return Err(Error::Protocol(format!("이미 참가한 멤버: {}", member)));
        }
        if self.is_full() {
            return Err(self.unavailable(&format!("정원 초과 ({})", self.capacity_max)));
        }

        let existing = self.members.clone();
        self.members.push(MemberRef {
            id: member,
            role: Role::Peer,
        });
        Ok(existing)
    }

    /// 방 닫기 (호스트 전용). 닫힌 시점의 멤버 목록 반환
    pub fn close(&mut self, by: MemberId, reason: Option<String>) -> Result<Vec<MemberRef>> {
        if by != self.host() {
            return Err(Error::NotHost { member_id: by });
        }
        if !self.is_open() {
            return Err(self.unavailable("이미 닫힌 방"));
        }
        self.state = RoomState::Closed;
        self.close_reason = reason;
        Ok(self.members.clone())
    }

    /// 멤버 이탈
    pub fn leave(&mut self, member: MemberId) -> Result<LeaveOutcome> {
        if !self.contains(member) {
            return Err(Error::Protocol(format!("방에 없는 멤버: {}", member)));
        }

        if member == self.host() {
            let notify = self.others(member);
            self.state = RoomState::Closed;
            self.close_reason = Some("host left".to_string());
            return Ok(LeaveOutcome::RoomClosed { notify });
        }

        self.members.retain(|m| m.id != member);
        Ok(LeaveOutcome::PeerLeft {
            remaining: self.members.clone(),
        })
    }

    fn unavailable(&self, reason: &str) -> Error {
        Error::RoomUnavailable {
            room_id: self.id,
            reason: reason.to_string(),
        }
    }
}

/// 열린 방 레지스트리
///
/// 소유 태스크 하나만 변경한다 (hub 참고).
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    member_rooms: HashMap<MemberId, RoomId>,
    default_capacity: usize,
    max_capacity: usize,
}

impl RoomRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            rooms: HashMap::new(),
            member_rooms: HashMap::new(),
            default_capacity: config.default_room_capacity,
            max_capacity: config.max_room_capacity,
        }
    }

    /// 방 생성
    pub fn create(&mut self, host: MemberId, capacity: Option<usize>) -> Result<RoomId> {
        if let Some(room_id) = self.member_rooms.get(&host) {
            return Err(Error::Protocol(format!(
                "이미 방 {}에 속한 멤버: {}",
                room_id, host
            )));
        }

        let capacity = capacity.unwrap_or(self.default_capacity);
        if capacity == 0 || capacity > self.max_capacity {
            return Err(Error::InvalidConfig(format!(
                "방 정원 범위 밖: {} (1..={})",
                capacity, self.max_capacity
            )));
        }

        let id = self.generate_id()?;
        self.rooms.insert(id, Room::new(id, capacity, host));
        self.member_rooms.insert(host, id);

        info!("방 생성: room={:06}, host={}, capacity={}", id, host, capacity);
        Ok(id)
    }

    /// 방 참가. 성공 시 기존 멤버(알림 대상) 반환
    pub fn join(&mut self, room_id: RoomId, member: MemberId) -> Result<Vec<MemberRef>> {
        if let Some(current) = self.member_rooms.get(&member) {
            return Err(Error::Protocol(format!(
                "이미 방 {}에 속한 멤버: {}",
                current, member
            )));
        }

        let room = self.rooms.get_mut(&room_id).ok_or_else(|| Error::RoomUnavailable {
            room_id,
            reason: "존재하지 않는 방".to_string(),
        })?;

        let existing = room.join(member)?;
        self.member_rooms.insert(member, room_id);

        debug!(
            "방 참가: room={:06}, member={}, members={}/{}",
            room_id,
            member,
            room.members().len(),
            room.capacity_max()
        );
        Ok(existing)
    }

    /// 방 닫기 (호스트 전용). 닫힌 방은 레지스트리에서 제거되어 반환된다
    pub fn close(&mut self, room_id: RoomId, by: MemberId, reason: Option<String>) -> Result<Room> {
        let room = self.rooms.get_mut(&room_id).ok_or_else(|| Error::RoomUnavailable {
            room_id,
            reason: "존재하지 않는 방".to_string(),
        })?;
        room.close(by, reason)?;

        let room = self.remove(room_id);
        info!(
            "방 종료: room={:06}, reason={}",
            room_id,
            room.as_ref().and_then(|r| r.close_reason()).unwrap_or("-")
        );
        room.ok_or(Error::RoomUnavailable {
            room_id,
            reason: "존재하지 않는 방".to_string(),
        })
    }

    /// 멤버 이탈 (연결 종료 포함)
    pub fn leave(&mut self, member: MemberId) -> Option<(RoomId, LeaveOutcome)> {
        let room_id = self.member_rooms.get(&member).copied()?;
        let outcome = self.rooms.get_mut(&room_id)?.leave(member).ok()?;

        match &outcome {
            LeaveOutcome::PeerLeft { .. } => {
                self.member_rooms.remove(&member);
            }
            LeaveOutcome::RoomClosed { .. } => {
                self.remove(room_id);
                info!("호스트 이탈로 방 종료: room={:06}", room_id);
            }
        }
        Some((room_id, outcome))
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn room_of(&self, member: MemberId) -> Option<&Room> {
        self.member_rooms
            .get(&member)
            .and_then(|room_id| self.rooms.get(room_id))
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// 모든 방을 닫고 반환 (종료 처리용)
    pub fn drain(&mut self) -> Vec<Room> {
        self.member_rooms.clear();
        self.rooms
            .drain()
            .map(|(_, mut room)| {
                room.state = RoomState::Closed;
                room.close_reason = Some("service shutdown".to_string());
                room
            })
            .collect()
    }

    fn remove(&mut self, room_id: RoomId) -> Option<Room> {
        let room = self.rooms.remove(&room_id)?;
        for member in room.members() {
            self.member_rooms.remove(&member.id);
        }
        Some(room)
    }

    fn generate_id(&self) -> Result<RoomId> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = rng.gen_range(ROOM_ID_MIN..=ROOM_ID_MAX);
            if !self.rooms.contains_key(&id) {
                return Ok(id);
            }
        }
        // 무작위 시도가 계속 충돌하면 순차 탐색
        (ROOM_ID_MIN..=ROOM_ID_MAX)
            .find(|id| !self.rooms.contains_key(id))
            .ok_or_else(|| Error::Protocol("사용 가능한 방 코드 없음".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> RoomRegistry {
        let mut config = Config::default();
        config.default_room_capacity = capacity;
        RoomRegistry::new(&config)
    }

    #[test]
    fn test_room_lifecycle() {
        let mut rooms = registry(3);
        let id = rooms.create(1, None).unwrap();
        assert!((100_000..=999_999).contains(&id));

        let room = rooms.room(id).unwrap();
        assert_eq!(room.phase(), RoomPhase::Created);
        assert_eq!(room.host(), 1);

        let existing = rooms.join(id, 2).unwrap();
        assert_eq!(existing, vec![MemberRef { id: 1, role: Role::Host }]);
        assert_eq!(rooms.room(id).unwrap().phase(), RoomPhase::Joined);

        let closed = rooms.close(id, 1, Some("done".into())).unwrap();
        assert_eq!(closed.phase(), RoomPhase::Closed);
        assert_eq!(closed.close_reason(), Some("done"));
        assert_eq!(rooms.open_rooms(), 0);
        assert!(rooms.room_of(2).is_none());
    }

    #[test]
    fn test_join_full_room_does_not_mutate() {
        let mut rooms = registry(2);
        let id = rooms.create(1, None).unwrap();
        rooms.join(id, 2).unwrap();

        let before = rooms.room(id).unwrap().members().to_vec();
        let err = rooms.join(id, 3).unwrap_err();
        assert!(matches!(err, Error::RoomUnavailable { .. }));
        assert_eq!(rooms.room(id).unwrap().members(), before.as_slice());
        assert!(rooms.room_of(3).is_none());
    }

    #[test]
    fn test_join_missing_or_closed_room() {
        let mut rooms = registry(2);
        assert!(matches!(rooms.join(123_456, 9), Err(Error::RoomUnavailable { .. })));

        let mut room = Room::new(111_111, 4, 1);
        room.close(1, None).unwrap();
        assert!(matches!(room.join(2), Err(Error::RoomUnavailable { .. })));
        assert_eq!(room.members().len(), 1);
    }

    #[test]
    fn test_only_host_can_close() {
        let mut rooms = registry(2);
        let id = rooms.create(1, None).unwrap();
        rooms.join(id, 2).unwrap();

        assert!(matches!(rooms.close(id, 2, None), Err(Error::NotHost { member_id: 2 })));
        assert!(rooms.room(id).unwrap().is_open());
    }

    #[test]
    fn test_host_leave_closes_room() {
        let mut rooms = registry(3);
        let id = rooms.create(1, None).unwrap();
        rooms.join(id, 2).unwrap();
        rooms.join(id, 3).unwrap();

        let (_, outcome) = rooms.leave(3).unwrap();
        assert!(matches!(outcome, LeaveOutcome::PeerLeft { ref remaining } if remaining.len() == 2));

        let (room_id, outcome) = rooms.leave(1).unwrap();
        assert_eq!(room_id, id);
        assert_eq!(
            outcome,
            LeaveOutcome::RoomClosed {
                notify: vec![MemberRef { id: 2, role: Role::Peer }]
            }
        );
        assert_eq!(rooms.open_rooms(), 0);
    }

    #[test]
    fn test_capacity_bounds() {
        let mut rooms = registry(2);
        assert!(rooms.create(1, Some(0)).is_err());
        assert!(rooms.create(1, Some(51)).is_err());
        assert!(rooms.create(1, Some(50)).is_ok());
        assert!(rooms.create(1, None).is_err(), "한 멤버는 한 방에만");
    }

    #[test]
    fn test_ids_unique_among_open_rooms() {
        let mut rooms = registry(2);
        let ids: std::collections::HashSet<RoomId> =
            (0..200).map(|host| rooms.create(host, None).unwrap()).collect();
        assert_eq!(ids.len(), 200);
    }
}
