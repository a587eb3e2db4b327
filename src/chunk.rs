//! 청크 분할과 재조립
//!
//! - TransferDescriptor: 전송 대상 파일의 불변 메타데이터
//! - Chunk: 고정 크기로 잘린 파일 조각 (마지막 조각만 짧을 수 있음)
//! - ChunkSplitter: 지연 분할기, 임의 오프셋에서 재시작 가능
//! - Reassembler: 순서가 뒤섞인 청크를 인덱스 순서대로 방출

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 청크 인덱스 (32비트)
pub type ChunkIndex = u32;

/// 기본 MIME 타입
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 전송 디스크립터
///
/// 생성 후 변경되지 않는다. `total_chunks`는 항상 `total_size`와 `chunk_size`에서 유도된다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub file_name: String,
    pub total_size: u64,
    pub mime_type: String,
    pub chunk_size: u32,
}

impl TransferDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        total_size: u64,
        mime_type: impl Into<String>,
        chunk_size: u32,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0일 수 없음".into()));
        }
        let mime_type = mime_type.into();
        let descriptor = Self {
            file_name: file_name.into(),
            total_size,
            mime_type: if mime_type.is_empty() {
                DEFAULT_MIME_TYPE.to_string()
            } else {
                mime_type
            },
            chunk_size,
        };
        if descriptor.total_chunks_u64() > ChunkIndex::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "청크 수 초과: size={}, chunk_size={}",
                total_size, chunk_size
            )));
        }
        Ok(descriptor)
    }

    /// 원격에서 받은 메타데이터 검증
    ///
    /// 선언된 청크 수가 크기와 청크 크기로부터 유도한 값과 다르면 거부한다.
    pub fn from_declared(
        file_name: String,
        total_size: u64,
        mime_type: String,
        chunk_size: u32,
        declared_chunks: u32,
    ) -> Result<Self> {
        let descriptor = Self::new(file_name, total_size, mime_type, chunk_size)?;
        if descriptor.total_chunks() != declared_chunks {
            return Err(Error::Protocol(format!(
                "totalChunks 불일치: declared={}, derived={}",
                declared_chunks,
                descriptor.total_chunks()
            )));
        }
        Ok(descriptor)
    }

    fn total_chunks_u64(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size as u64)
    }

    /// 총 청크 수 = ceil(total_size / chunk_size)
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks_u64() as u32
    }

    /// 인덱스별 기대 길이 (범위 밖이면 None)
    pub fn expected_len(&self, index: ChunkIndex) -> Option<u32> {
        if index >= self.total_chunks() {
            return None;
        }
        let offset = index as u64 * self.chunk_size as u64;
        let remaining = self.total_size - offset;
        Some(remaining.min(self.chunk_size as u64) as u32)
    }

    /// 인덱스의 파일 내 바이트 오프셋
    pub fn offset_of(&self, index: ChunkIndex) -> u64 {
        index as u64 * self.chunk_size as u64
    }
}

/// 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: ChunkIndex,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(index: ChunkIndex, payload: Bytes) -> Self {
        Self { index, payload }
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 페이로드 CRC32
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }
}

/// 지연 청크 분할기
///
/// 원본을 복사하지 않고 `Bytes::slice`로 잘라낸다.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    data: Bytes,
    chunk_size: usize,
    next_index: ChunkIndex,
    total_chunks: ChunkIndex,
}

impl ChunkSplitter {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let total_chunks = data.len().div_ceil(chunk_size) as ChunkIndex;
        Self {
            data,
            chunk_size,
            next_index: 0,
            total_chunks,
        }
    }

    /// 바이트 오프셋에서 재시작
    ///
    /// 오프셋이 청크 경계가 아니면 그 오프셋을 포함하는 청크부터 다시 만든다.
    pub fn starting_at(mut self, byte_offset: u64) -> Self {
        let index = (byte_offset / self.chunk_size as u64).min(self.total_chunks as u64);
        self.next_index = index as ChunkIndex;
        self
    }

    /// 다음에 만들 청크 인덱스
    pub fn position(&self) -> ChunkIndex {
        self.next_index
    }

    pub fn total_chunks(&self) -> ChunkIndex {
        self.total_chunks
    }

    /// 특정 인덱스의 청크 (재전송용)
    pub fn chunk_at(&self, index: ChunkIndex) -> Option<Chunk> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        Some(Chunk::new(index, self.data.slice(start..end)))
    }
}

impl Iterator for ChunkSplitter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.chunk_at(self.next_index)?;
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_chunks - self.next_index) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkSplitter {}

/// 데이터를 청크들로 분할
pub fn split(data: Bytes, chunk_size: usize) -> ChunkSplitter {
    ChunkSplitter::new(data, chunk_size)
}

/// 인덱스 순서대로 청크를 이어붙임
pub fn reassemble<I>(chunks: I) -> Bytes
where
    I: IntoIterator<Item = Chunk>,
{
    let mut ordered: Vec<Chunk> = chunks.into_iter().collect();
    ordered.sort_by_key(|chunk| chunk.index);

    let total: usize = ordered.iter().map(|c| c.payload.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in ordered {
        buf.extend_from_slice(&chunk.payload);
    }
    buf.freeze()
}

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// 새 청크
    Accepted,
    /// 이미 받은 청크
    Duplicate,
}

/// 순서 보장 재조립기
///
/// 청크를 인덱스로 보관하고, `next_release`부터 연속된 청크만 꺼내준다.
#[derive(Debug)]
pub struct Reassembler {
    total_chunks: ChunkIndex,
    next_release: ChunkIndex,
    pending: BTreeMap<ChunkIndex, Chunk>,
}

impl Reassembler {
    pub fn new(total_chunks: ChunkIndex) -> Self {
        Self {
            total_chunks,
            next_release: 0,
            pending: BTreeMap::new(),
        }
    }

    /// 청크 보관
    pub fn insert(&mut self, chunk: Chunk) -> Result<Insert> {
        if chunk.index >= self.total_chunks {
            return Err(Error::Protocol(format!(
                "청크 인덱스 범위 밖: {} >= {}",
                chunk.index, self.total_chunks
            )));
        }
        if chunk.index < self.next_release || self.pending.contains_key(&chunk.index) {
            return Ok(Insert::Duplicate);
        }
        self.pending.insert(chunk.index, chunk);
        Ok(Insert::Accepted)
    }

    /// 방출 가능한 연속 청크들
    pub fn drain_ready(&mut self) -> Vec<Chunk> {
        let mut ready = Vec::new();
        while let Some(chunk) = self.pending.remove(&self.next_release) {
            self.next_release += 1;
            ready.push(chunk);
        }
        ready
    }

    /// 아직 방출되지 않은 (순서 대기 중인) 청크 수
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn next_release(&self) -> ChunkIndex {
        self.next_release
    }

    pub fn is_complete(&self) -> bool {
        self.next_release >= self.total_chunks
    }
}
