//! 전송 엔진 설정

use std::time::Duration;

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_LOW_WATER_MARK};

/// ChunkDrop 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 청크 ACK 대기 타임아웃 (밀리초, 릴레이 방식)
    pub ack_timeout_ms: u64,

    /// 청크당 최대 전송 시도 횟수 (최초 전송 포함)
    pub max_attempts: u8,

    /// 마지막 ACK 이후 transfer-complete 신호 대기 타임아웃 (밀리초)
    pub completion_timeout_ms: u64,

    /// 직접 채널 송신 버퍼 임계값 (바이트)
    /// bufferedAmount가 이 값을 넘으면 송신을 멈춘다
    pub buffered_amount_low_threshold: usize,

    /// 진행률 이벤트 최소 간격 (밀리초)
    pub progress_interval_ms: u64,

    /// 방 생성 시 기본 정원
    pub default_room_capacity: usize,

    /// 방 정원 상한
    pub max_room_capacity: usize,

    /// 전송 이벤트 채널 크기
    pub event_buffer: usize,

    /// 릴레이 링크 / 내부 명령 채널 크기
    pub link_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout_ms: 5000,                         // 5초
            max_attempts: 5,
            completion_timeout_ms: 30_000,                // 30초
            buffered_amount_low_threshold: DEFAULT_LOW_WATER_MARK,
            progress_interval_ms: 100,                    // 100ms마다 최대 1회
            default_room_capacity: 2,                     // 1:1 전송
            max_room_capacity: 50,
            event_buffer: 64,
            link_buffer: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 크기 지정
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "chunk_size 범위 밖: {}",
                self.chunk_size
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts는 1 이상이어야 함".into()));
        }
        if self.default_room_capacity == 0 || self.max_room_capacity == 0 {
            return Err(Error::InvalidConfig("방 정원은 1 이상이어야 함".into()));
        }
        if self.default_room_capacity > self.max_room_capacity {
            return Err(Error::InvalidConfig(format!(
                "기본 정원 {}이 상한 {}을 초과",
                self.default_room_capacity, self.max_room_capacity
            )));
        }
        if self.event_buffer == 0 || self.link_buffer == 0 {
            return Err(Error::InvalidConfig("채널 크기는 1 이상이어야 함".into()));
        }
        Ok(())
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            chunk_size: 64 * 1024,                        // 64KB
            ack_timeout_ms: 10_000,
            max_attempts: 5,
            completion_timeout_ms: 60_000,
            buffered_amount_low_threshold: 256 * 1024,    // 256KB
            progress_interval_ms: 250,
            default_room_capacity: 2,
            max_room_capacity: 10,
            event_buffer: 16,
            link_buffer: 256,
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 1024 * 1024,                      // 1MB
            ack_timeout_ms: 3000,
            max_attempts: 3,
            completion_timeout_ms: 15_000,
            buffered_amount_low_threshold: 8 * 1024 * 1024, // 8MB
            progress_interval_ms: 50,
            default_room_capacity: 2,
            max_room_capacity: 50,
            event_buffer: 256,
            link_buffer: 4096,
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            chunk_size: 32 * 1024,                        // 작은 청크
            ack_timeout_ms: 8000,
            max_attempts: 10,
            completion_timeout_ms: 60_000,
            buffered_amount_low_threshold: 512 * 1024,
            progress_interval_ms: 200,
            default_room_capacity: 2,
            max_room_capacity: 20,
            event_buffer: 64,
            link_buffer: 1024,
        }
    }
}
