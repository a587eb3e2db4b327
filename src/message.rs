//! 프로토콜 메시지 정의
//!
//! 제어/메타데이터는 UTF-8 JSON 객체(`type` 필드로 구분), 청크 데이터는 바이너리 프레임.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkIndex, TransferDescriptor};
use crate::group::ArtifactId;
use crate::room::{MemberId, RoomId};
use crate::Result;

/// JSON 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// 방 생성 요청 (정원 생략 시 서버 기본값)
    CreateRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },

    /// 방 생성 응답
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_id: RoomId, member_id: MemberId },

    /// 방 참가 요청
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },

    /// 방 참가 응답 (참가자 본인에게)
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        member_id: MemberId,
        members: usize,
    },

    /// 새 멤버 참가 알림 (기존 멤버에게)
    #[serde(rename_all = "camelCase")]
    PeerJoined { member_id: MemberId },

    /// 멤버 이탈 알림
    #[serde(rename_all = "camelCase")]
    PeerLeft { member_id: MemberId },

    /// 방 나가기
    LeaveRoom,

    /// 방 닫기 (호스트 전용)
    CloseRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// 방 종료 알림
    RoomClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// 방 요청 실패
    #[serde(rename_all = "camelCase")]
    RoomError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        reason: String,
    },

    /// 파일 메타데이터 (첫 청크 전에 한 번)
    #[serde(rename_all = "camelCase")]
    ChunkMeta {
        file_name: String,
        file_size: u64,
        mime_type: String,
        total_chunks: u32,
        chunk_size: u32,
    },

    /// JSON 청크 (바이트 배열)
    ChunkData { index: ChunkIndex, bytes: Vec<u8> },

    /// 청크 수신 확인
    ChunkAck { index: ChunkIndex },

    /// 수신측 재조립 완료 신호
    TransferComplete,

    /// 그룹 아티팩트 공개
    #[serde(rename_all = "camelCase")]
    ArtifactPublished {
        artifact_id: ArtifactId,
        descriptor: TransferDescriptor,
    },

    /// 그룹 채팅
    Chat { sender: String, text: String },
}

impl ControlMessage {
    /// 디스크립터로부터 chunk-meta 생성
    pub fn chunk_meta(descriptor: &TransferDescriptor) -> Self {
        ControlMessage::ChunkMeta {
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.total_size,
            mime_type: descriptor.mime_type.clone(),
            total_chunks: descriptor.total_chunks(),
            chunk_size: descriptor.chunk_size,
        }
    }

    /// chunk-meta를 검증된 디스크립터로 변환 (다른 메시지면 None)
    pub fn to_descriptor(&self) -> Option<Result<TransferDescriptor>> {
        match self {
            ControlMessage::ChunkMeta {
                file_name,
                file_size,
                mime_type,
                total_chunks,
                chunk_size,
            } => Some(TransferDescriptor::from_declared(
                file_name.clone(),
                *file_size,
                mime_type.clone(),
                *chunk_size,
                *total_chunks,
            )),
            _ => None,
        }
    }

    /// 로그용 메시지 타입 이름
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::CreateRoom { .. } => "create-room",
            ControlMessage::RoomCreated { .. } => "room-created",
            ControlMessage::JoinRoom { .. } => "join-room",
            ControlMessage::RoomJoined { .. } => "room-joined",
            ControlMessage::PeerJoined { .. } => "peer-joined",
            ControlMessage::PeerLeft { .. } => "peer-left",
            ControlMessage::LeaveRoom => "leave-room",
            ControlMessage::CloseRoom { .. } => "close-room",
            ControlMessage::RoomClosed { .. } => "room-closed",
            ControlMessage::RoomError { .. } => "room-error",
            ControlMessage::ChunkMeta { .. } => "chunk-meta",
            ControlMessage::ChunkData { .. } => "chunk-data",
            ControlMessage::ChunkAck { .. } => "chunk-ack",
            ControlMessage::TransferComplete => "transfer-complete",
            ControlMessage::ArtifactPublished { .. } => "artifact-published",
            ControlMessage::Chat { .. } => "chat",
        }
    }

    /// JSON 텍스트로 직렬화
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// JSON 텍스트에서 역직렬화
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 전송 계층이 주고받는 메시지 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// JSON 제어 메시지
    Control(ControlMessage),

    /// 바이너리 (결합 프레임 또는 원시 청크)
    Binary(Bytes),
}

impl WireMessage {
    /// 전송 크기 (버퍼 계산용)
    pub fn wire_len(&self) -> usize {
        match self {
            WireMessage::Control(msg) => msg.to_text().map(|t| t.len()).unwrap_or(0),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    /// 텍스트 프레임 파싱
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(WireMessage::Control(ControlMessage::from_text(text)?))
    }
}

impl From<ControlMessage> for WireMessage {
    fn from(msg: ControlMessage) -> Self {
        WireMessage::Control(msg)
    }
}
