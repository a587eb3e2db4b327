//! 수신측 저장소 (싱크)
//!
//! 청크는 도착 순서(= 인덱스 순서)대로 기록된다. `ScopedSink`는 성공/취소/에러 어느 경로에서든
//! 싱크를 정확히 한 번 닫는다. `close`가 `self`를 소비하므로 두 번 닫을 수 없다.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::chunk::{Chunk, TransferDescriptor};
use crate::Result;

/// 청크 싱크
pub trait ChunkSink: Send + 'static {
    /// 메타데이터 수신 후 한 번 호출
    fn open(&mut self, descriptor: &TransferDescriptor) -> impl Future<Output = Result<()>> + Send;

    /// 순서대로 청크 기록
    fn write_chunk(&mut self, chunk: &Chunk) -> impl Future<Output = Result<()>> + Send;

    /// 성공 종료
    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// 실패/취소 종료
    fn abort(&mut self) -> impl Future<Output = ()> + Send;
}

/// 정확히 한 번 닫히는 싱크 핸들
pub struct ScopedSink<S: ChunkSink> {
    sink: Option<S>,
    written_bytes: u64,
}

impl<S: ChunkSink> ScopedSink<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Some(sink),
            written_bytes: 0,
        }
    }

    pub async fn open(&mut self, descriptor: &TransferDescriptor) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.open(descriptor).await,
            None => Ok(()),
        }
    }

    pub async fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write_chunk(chunk).await?;
            self.written_bytes += chunk.len() as u64;
        }
        Ok(())
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    /// 싱크 닫기. 성공이면 commit, 아니면 abort
    pub async fn close(mut self, success: bool) -> Result<()> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        if success {
            if let Err(e) = sink.commit().await {
                sink.abort().await;
                return Err(e);
            }
            Ok(())
        } else {
            sink.abort().await;
            Ok(())
        }
    }
}

impl<S: ChunkSink> Drop for ScopedSink<S> {
    fn drop(&mut self) {
        if self.sink.is_some() {
            warn!("싱크가 닫히지 않은 채 해제됨 ({} bytes 기록)", self.written_bytes);
        }
    }
}

/// 메모리 싱크 결과 핸들
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    inner: Arc<Mutex<Option<Bytes>>>,
}

impl MemoryOutput {
    /// 커밋된 데이터 (커밋 전이면 None)
    pub fn take(&self) -> Option<Bytes> {
        self.inner.lock().take()
    }

    pub fn is_committed(&self) -> bool {
        self.inner.lock().is_some()
    }
}

/// 메모리 싱크
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: BytesMut,
    output: MemoryOutput,
}

impl MemorySink {
    pub fn new() -> (Self, MemoryOutput) {
        let sink = Self::default();
        let output = sink.output.clone();
        (sink, output)
    }
}

impl ChunkSink for MemorySink {
    fn open(&mut self, descriptor: &TransferDescriptor) -> impl Future<Output = Result<()>> + Send {
        self.buf = BytesMut::with_capacity(descriptor.total_size.min(64 * 1024 * 1024) as usize);
        async { Ok(()) }
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> impl Future<Output = Result<()>> + Send {
        self.buf.extend_from_slice(&chunk.payload);
        async { Ok(()) }
    }

    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send {
        let data = std::mem::take(&mut self.buf).freeze();
        *self.output.inner.lock() = Some(data);
        async { Ok(()) }
    }

    fn abort(&mut self) -> impl Future<Output = ()> + Send {
        self.buf.clear();
        async {}
    }
}

/// 파일 싱크
///
/// 실패/취소 시 부분 파일을 지운다.
#[derive(Debug)]
pub struct FileSink {
    target: SinkTarget,
    path: Option<PathBuf>,
    file: Option<tokio::fs::File>,
}

#[derive(Debug)]
enum SinkTarget {
    /// 정확한 경로
    Path(PathBuf),
    /// 디렉터리 + 원격 파일명
    Directory(PathBuf),
}

impl FileSink {
    /// 지정 경로에 기록
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self {
            target: SinkTarget::Path(path.into()),
            path: None,
            file: None,
        }
    }

    /// 디렉터리에 원격 파일명으로 기록
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            target: SinkTarget::Directory(dir.into()),
            path: None,
            file: None,
        }
    }

    /// 실제 기록 경로 (open 이후)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn resolve(&self, descriptor: &TransferDescriptor) -> PathBuf {
        match &self.target {
            SinkTarget::Path(path) => path.clone(),
            SinkTarget::Directory(dir) => dir.join(sanitize_file_name(&descriptor.file_name)),
        }
    }
}

/// 원격 파일명에서 경로 구성요소 제거
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "downloaded_file".to_string()
    } else {
        base.to_string()
    }
}

impl ChunkSink for FileSink {
    fn open(&mut self, descriptor: &TransferDescriptor) -> impl Future<Output = Result<()>> + Send {
        let path = self.resolve(descriptor);
        async move {
            let file = tokio::fs::File::create(&path).await?;
            debug!("파일 싱크 열림: {:?}", path);
            self.file = Some(file);
            self.path = Some(path);
            Ok(())
        }
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> impl Future<Output = Result<()>> + Send {
        let payload = chunk.payload.clone();
        async move {
            if let Some(file) = self.file.as_mut() {
                file.write_all(&payload).await?;
            }
            Ok(())
        }
    }

    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send {
        async move {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
                file.sync_all().await?;
            }
            Ok(())
        }
    }

    fn abort(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            drop(self.file.take());
            if let Some(path) = self.path.take() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("부분 파일 삭제 실패: {:?}: {}", path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(size: u64) -> TransferDescriptor {
        TransferDescriptor::new("../../etc/report.txt", size, "text/plain", 4).unwrap()
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\tmp\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".."), "downloaded_file");
        assert_eq!(sanitize_file_name(""), "downloaded_file");
    }

    #[tokio::test]
    async fn test_memory_sink_commit() {
        let (sink, output) = MemorySink::new();
        let mut scoped = ScopedSink::new(sink);
        scoped.open(&descriptor(6)).await.unwrap();
        scoped.write_chunk(&Chunk::new(0, Bytes::from_static(b"abcd"))).await.unwrap();
        scoped.write_chunk(&Chunk::new(1, Bytes::from_static(b"ef"))).await.unwrap();
        assert_eq!(scoped.written_bytes(), 6);
        assert!(!output.is_committed());

        scoped.close(true).await.unwrap();
        assert_eq!(output.take().unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_file_sink_commit_and_abort() {
        let dir = tempfile::tempdir().unwrap();

        let mut scoped = ScopedSink::new(FileSink::in_directory(dir.path()));
        scoped.open(&descriptor(4)).await.unwrap();
        scoped.write_chunk(&Chunk::new(0, Bytes::from_static(b"data"))).await.unwrap();
        scoped.close(true).await.unwrap();

        let written = std::fs::read(dir.path().join("report.txt")).unwrap();
        assert_eq!(written, b"data");

        let partial = dir.path().join("partial.bin");
        let mut scoped = ScopedSink::new(FileSink::to_path(&partial));
        scoped.open(&descriptor(8)).await.unwrap();
        scoped.write_chunk(&Chunk::new(0, Bytes::from_static(b"half"))).await.unwrap();
        scoped.close(false).await.unwrap();
        assert!(!partial.exists());
    }
}
