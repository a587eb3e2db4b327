//! # ChunkDrop
//!
//! 서버에 파일을 저장하지 않는 청크 단위 파일 전송 엔진
//!
//! ## 핵심 특징
//! - **청크 분할/재조립**: 고정 크기 청크, 임의 오프셋에서 재시작 가능한 분할
//! - **릴레이 전송**: 청크별 ACK, 타임아웃 재전송, 명시적 완료 신호
//! - **직접 채널 전송**: 송신 버퍼 저수위 기반 흐름 제어
//! - **방(Room) 상태 머신**: 6자리 코드, 정원, 호스트 전용 종료
//! - **그룹 팬아웃**: 피어별 독립 다운로드와 전체 완료 집계
//! - **취소/종료 보장**: 전송당 종료 이벤트 한 번, 싱크는 정확히 한 번 닫힘

pub mod chunk;
pub mod config;
pub mod direct;
pub mod error;
pub mod frame;
pub mod group;
pub mod hub;
pub mod message;
pub mod relay;
pub mod room;
pub mod service;
pub mod sink;
pub mod stats;
pub mod transfer;
pub mod transport;

pub use chunk::{Chunk, ChunkIndex, ChunkSplitter, Reassembler, TransferDescriptor};
pub use config::Config;
pub use direct::{DirectReceiver, DirectSender};
pub use error::{Error, ErrorKind, Result};
pub use group::{ArtifactId, ArtifactInfo, GroupCoordinator, GroupReport, MemberReport};
pub use hub::RelayHub;
pub use message::{ControlMessage, WireMessage};
pub use relay::{PendingAck, RelayReceiver, RelaySender};
pub use room::{MemberId, Role, Room, RoomId, RoomRegistry, RoomState};
pub use service::ShareService;
pub use sink::{ChunkSink, FileSink, MemoryOutput, MemorySink, ScopedSink};
pub use stats::TransferStats;
pub use transfer::{
    Progress, Transfer, TransferEvent, TransferFailure, TransferHandle, TransferOutcome,
    TransferState, TransferStatus,
};
pub use transport::{ChannelEvent, ChannelPayload, DataChannel, RelayLink};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// 직접 채널 송신 버퍼 기본 임계값 (바이트)
pub const DEFAULT_LOW_WATER_MARK: usize = 1024 * 1024; // 1MB

/// 결합 프레임 구분자 (헤더와 페이로드 사이)
pub const FRAME_SEPARATOR: [u8; 4] = [0xCD, 0x5A, 0xA5, 0xDC];
