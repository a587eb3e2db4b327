//! 메타데이터 + 바이너리 결합 프레임
//!
//! 하나의 바이너리 메시지에 청크 헤더와 페이로드를 함께 싣는다.
//!
//! ```text
//! +-------------+---------------------+------------------+-----------+
//! | meta_len u32| FrameHeader(bincode)| FRAME_SEPARATOR  | payload   |
//! | little-end. | meta_len bytes      | 4 bytes          | N bytes   |
//! +-------------+---------------------+------------------+-----------+
//! ```
//!
//! 헤더는 길이 접두어로 구분되므로 구분자는 항상 고정 위치에서만 검사한다.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkIndex};
use crate::{Error, Result, FRAME_SEPARATOR, PROTOCOL_VERSION};

/// 길이 접두어 크기
const LEN_PREFIX: usize = 4;

/// 헤더 최대 크기 (비정상 길이 방어)
const MAX_HEADER_LEN: usize = 1024;

/// 프레임 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// 프로토콜 버전
    pub version: u8,

    /// 청크 인덱스
    pub index: ChunkIndex,

    /// 선언된 페이로드 길이
    pub payload_len: u32,

    /// 페이로드 CRC32
    pub crc32: u32,
}

impl FrameHeader {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            index: chunk.index,
            payload_len: chunk.len(),
            crc32: chunk.crc32(),
        }
    }
}

/// 헤더와 페이로드를 하나의 메시지로 결합
pub fn frame(header: &FrameHeader, payload: &[u8]) -> Result<Bytes> {
    let header_bytes = bincode::serialize(header)?;

    let mut buf =
        BytesMut::with_capacity(LEN_PREFIX + header_bytes.len() + FRAME_SEPARATOR.len() + payload.len());
    buf.put_u32_le(header_bytes.len() as u32);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&FRAME_SEPARATOR);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// 청크를 프레임으로 인코딩
pub fn frame_chunk(chunk: &Chunk) -> Result<Bytes> {
    frame(&FrameHeader::for_chunk(chunk), &chunk.payload)
}

/// 프레임 분리
///
/// 구분자가 없거나, 헤더가 깨졌거나, 페이로드 길이가 선언과 다르면 `Error::Frame`.
pub fn unframe(message: &Bytes) -> Result<(FrameHeader, Bytes)> {
    if message.len() < LEN_PREFIX {
        return Err(Error::Frame(format!("프레임이 너무 짧음: {} bytes", message.len())));
    }

    let header_len =
        u32::from_le_bytes([message[0], message[1], message[2], message[3]]) as usize;
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(Error::Frame(format!("헤더 길이 비정상: {}", header_len)));
    }

    let sep_start = LEN_PREFIX + header_len;
    let payload_start = sep_start + FRAME_SEPARATOR.len();
    if message.len() < payload_start || message[sep_start..payload_start] != FRAME_SEPARATOR {
        return Err(Error::Frame("구분자 없음".into()));
    }

    let header: FrameHeader = bincode::deserialize(&message[LEN_PREFIX..sep_start])
        .map_err(|e| Error::Frame(format!("헤더 디코딩 실패: {}", e)))?;

    if header.version != PROTOCOL_VERSION {
        return Err(Error::Frame(format!(
            "프로토콜 버전 불일치: expected {}, got {}",
            PROTOCOL_VERSION, header.version
        )));
    }

    let payload = message.slice(payload_start..);
    if payload.len() != header.payload_len as usize {
        return Err(Error::Frame(format!(
            "페이로드 길이 불일치: declared={}, actual={}",
            header.payload_len,
            payload.len()
        )));
    }

    Ok((header, payload))
}

/// 프레임을 청크로 디코딩하고 CRC 검증
pub fn unframe_chunk(message: &Bytes) -> Result<Chunk> {
    let (header, payload) = unframe(message)?;
    let chunk = Chunk::new(header.index, payload);

    let actual = chunk.crc32();
    if actual != header.crc32 {
        return Err(Error::ChecksumOrSizeMismatch {
            index: header.index,
            expected: header.crc32 as u64,
            got: actual as u64,
        });
    }
    Ok(chunk)
}
