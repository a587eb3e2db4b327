//! 에러 타입 정의

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::ChunkIndex;
use crate::room::RoomId;

/// ChunkDrop 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("방 사용 불가: room={room_id}, {reason}")]
    RoomUnavailable { room_id: RoomId, reason: String },

    #[error("방 종료됨: {reason}")]
    RoomClosed { reason: String },

    #[error("프레임 에러: {0}")]
    Frame(String),

    #[error("청크 검증 실패: index={index}, expected={expected}, got={got}")]
    ChecksumOrSizeMismatch { index: ChunkIndex, expected: u64, got: u64 },

    #[error("ACK 재시도 초과: index={index}, attempts={attempts}")]
    AckTimeoutExhausted { index: ChunkIndex, attempts: u8 },

    #[error("완료 신호 대기 초과: {waited_ms}ms")]
    CompletionTimeout { waited_ms: u64 },

    #[error("채널 종료")]
    ChannelClosed,

    #[error("사용자 취소")]
    Cancelled,

    #[error("호스트 권한 필요: member={member_id}")]
    NotHost { member_id: u64 },

    #[error("알 수 없는 아티팩트: {artifact_id}")]
    UnknownArtifact { artifact_id: u64 },

    #[error("프로토콜 위반: {0}")]
    Protocol(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("서비스 종료됨")]
    ServiceStopped,
}

/// 전송 종료 사유 분류
///
/// 호출자에게 전달되는 종료 알림은 이 분류와 사람이 읽을 수 있는 사유 문자열을 함께 담는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RoomUnavailable,
    RoomClosed,
    FrameError,
    ChecksumOrSizeMismatch,
    AckTimeoutExhausted,
    ChannelClosed,
    Cancelled,
    /// 싱크 쓰기 실패
    Io,
    /// 상대방의 프로토콜 위반 (잘못된 메타데이터, 범위 밖 인덱스 등)
    Protocol,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::RoomUnavailable => "RoomUnavailable",
            ErrorKind::RoomClosed => "RoomClosed",
            ErrorKind::FrameError => "FrameError",
            ErrorKind::ChecksumOrSizeMismatch => "ChecksumOrSizeMismatch",
            ErrorKind::AckTimeoutExhausted => "AckTimeoutExhausted",
            ErrorKind::ChannelClosed => "ChannelClosed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "Io",
            ErrorKind::Protocol => "Protocol",
        };
        f.write_str(name)
    }
}

impl Error {
    /// 에러 분류 반환
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) | Error::Json(_) | Error::Frame(_) => ErrorKind::FrameError,
            Error::RoomUnavailable { .. } => ErrorKind::RoomUnavailable,
            Error::RoomClosed { .. } | Error::ServiceStopped => ErrorKind::RoomClosed,
            Error::ChecksumOrSizeMismatch { .. } => ErrorKind::ChecksumOrSizeMismatch,
            Error::AckTimeoutExhausted { .. } | Error::CompletionTimeout { .. } => {
                ErrorKind::AckTimeoutExhausted
            }
            Error::ChannelClosed => ErrorKind::ChannelClosed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NotHost { .. }
            | Error::UnknownArtifact { .. }
            | Error::Protocol(_)
            | Error::InvalidConfig(_) => ErrorKind::Protocol,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
