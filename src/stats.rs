//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 통계 (전송 태스크 하나가 소유)
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 확정된 페이로드 바이트 (송신: ACK/전달, 수신: 수신)
    pub total_bytes: u64,

    /// 청크 전송/수신 횟수 (재전송 포함)
    pub total_chunks: u64,

    /// 재전송 청크 수
    pub retransmitted_chunks: u64,

    /// 무시된 중복 ACK 수
    pub duplicate_acks: u64,

    /// 버려진 중복 청크 수
    pub duplicate_chunks: u64,

    /// 송신 버퍼 저수위 대기 횟수
    pub backpressure_waits: u64,

    /// 마지막 재전송 시간
    pub last_retransmit_time: Option<Instant>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
            total_chunks: 0,
            retransmitted_chunks: 0,
            duplicate_acks: 0,
            duplicate_chunks: 0,
            backpressure_waits: 0,
            last_retransmit_time: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 기록
    pub fn record_retransmit(&mut self) {
        self.retransmitted_chunks += 1;
        self.total_chunks += 1;
        self.last_retransmit_time = Some(Instant::now());
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        throughput(self.total_bytes, self.elapsed())
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.retransmitted_chunks as f64 / self.total_chunks as f64
    }

    /// 남은 시간 추정
    pub fn eta(&self, total_bytes: u64) -> Option<Duration> {
        estimate_eta(self.total_bytes, total_bytes, self.elapsed())
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {} | Chunks: {} | Throughput: {:.2} MB/s | Retransmit: {} ({:.2}%) | Dup acks: {} | Dup chunks: {} | Backpressure: {}",
            self.elapsed().as_secs_f64(),
            self.total_bytes,
            self.total_chunks,
            self.overall_throughput() / 1_000_000.0,
            self.retransmitted_chunks,
            self.retransmit_ratio() * 100.0,
            self.duplicate_acks,
            self.duplicate_chunks,
            self.backpressure_waits,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 처리율 (bytes/sec)
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}

/// 평균 속도 기반 남은 시간 추정
///
/// 아직 전송된 바이트가 없거나 경과 시간이 0이면 None.
pub fn estimate_eta(done: u64, total: u64, elapsed: Duration) -> Option<Duration> {
    if done >= total {
        return Some(Duration::ZERO);
    }
    let speed = throughput(done, elapsed);
    if speed <= 0.0 {
        return None;
    }
    let remaining = (total - done) as f64 / speed;
    Some(Duration::from_secs_f64(remaining.ceil()))
}
