//! ChunkDrop 데모 - 프로세스 내 루프백 전송
//!
//! 파일 하나를 릴레이 허브 / 직접 채널 / 그룹 팬아웃 중 한 방식으로 보내고
//! 받은 파일을 출력 디렉터리에 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin chunkdrop-demo -- --input <PATH> [OPTIONS]
//!
//! 예시:
//!   # 릴레이 방식 (기본)
//!   cargo run --release --bin chunkdrop-demo -- -i video.mp4 -o received
//!
//!   # 직접 채널 + 불안정 네트워크 프리셋
//!   cargo run --release --bin chunkdrop-demo -- -i video.mp4 --mode direct --preset unstable

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chunkdrop::message::{ControlMessage, WireMessage};
use chunkdrop::transport::{memory_channel, MemoryChannelOptions};
use chunkdrop::{Config, FileSink, RelayLink, RoomId, ShareService, Transfer, TransferEvent, TransferOutcome};

/// 전송 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Relay,
    Direct,
    Group,
}

/// 데모 설정
struct DemoConfig {
    input: Option<PathBuf>,
    output_dir: PathBuf,
    mode: Mode,
    peers: usize,
    verbose: bool,
    config: Config,
    /// 알 수 없는 옵션 (로거 설치 후 경고)
    ignored: Vec<String>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            input: None,
            output_dir: PathBuf::from("received"),
            mode: Mode::Relay,
            peers: 3,
            verbose: false,
            config: Config::default(),
            ignored: Vec::new(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 옵션에 값이 필요함", flag))
}

fn parse_args(args: &[String]) -> Result<DemoConfig, String> {
    let mut demo = DemoConfig::default();
    // 프리셋 순서와 무관하게 적용
    let mut chunk_size = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--input" | "-i" => {
                demo.input = Some(PathBuf::from(value(args, i, flag)?));
                i += 1;
            }
            "--output" | "-o" => {
                demo.output_dir = PathBuf::from(value(args, i, flag)?);
                i += 1;
            }
            "--mode" | "-m" => {
                demo.mode = match value(args, i, flag)? {
                    "relay" => Mode::Relay,
                    "direct" => Mode::Direct,
                    "group" => Mode::Group,
                    other => return Err(format!("알 수 없는 전송 방식: {}", other)),
                };
                i += 1;
            }
            "--preset" => {
                demo.config = match value(args, i, flag)? {
                    "low" => Config::low_spec(),
                    "high" => Config::high_performance(),
                    "unstable" => Config::unstable_network(),
                    other => return Err(format!("알 수 없는 프리셋: {}", other)),
                };
                i += 1;
            }
            "--chunk-size" | "-c" => {
                chunk_size = Some(
                    value(args, i, flag)?
                        .parse()
                        .map_err(|_| "유효한 숫자 필요".to_string())?,
                );
                i += 1;
            }
            "--peers" | "-p" => {
                demo.peers = value(args, i, flag)?
                    .parse()
                    .map_err(|_| "유효한 숫자 필요".to_string())?;
                i += 1;
            }
            "--verbose" | "-v" => demo.verbose = true,
            "--help" | "-h" => {
                println!(
                    r#"ChunkDrop Demo - 청크 전송 엔진 루프백 데모

사용법:
  cargo run --release --bin chunkdrop-demo -- --input <PATH> [OPTIONS]

옵션:
  -i, --input <PATH>       보낼 파일 (필수)
  -o, --output <DIR>       수신 파일 저장 디렉터리 (기본: received)
  -m, --mode <MODE>        relay | direct | group (기본: relay)
  --preset <NAME>          low | high | unstable
  -c, --chunk-size <BYTES> 청크 크기 (기본: 262144)
  -p, --peers <N>          그룹 모드 피어 수 (기본: 3)
  -v, --verbose            청크 단위 로그 출력
  -h, --help               이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => demo.ignored.push(other.to_string()),
        }
        i += 1;
    }

    if let Some(chunk_size) = chunk_size {
        demo.config.chunk_size = chunk_size;
    }
    Ok(demo)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let demo = parse_args(&args)?;

    // 로깅 설정 (RUST_LOG가 있으면 우선)
    let level = if demo.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    for option in &demo.ignored {
        warn!("알 수 없는 옵션 무시: {}", option);
    }

    let input = demo.input.clone().ok_or("--input 필요 (--help 참고)")?;
    let data = Bytes::from(tokio::fs::read(&input).await?);
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input.bin".to_string());
    tokio::fs::create_dir_all(&demo.output_dir).await?;

    let service = ShareService::init(demo.config.clone())?;
    let descriptor = service.describe(file_name.clone(), &data, "")?;

    info!("ChunkDrop demo starting...");
    info!(
        "Input: {:?} ({} bytes, {} chunks of {} bytes), mode: {:?}",
        input,
        data.len(),
        descriptor.total_chunks(),
        descriptor.chunk_size,
        demo.mode
    );

    let start = Instant::now();
    let outcomes = match demo.mode {
        Mode::Relay => run_relay(&service, &demo.output_dir, descriptor, data).await?,
        Mode::Direct => run_direct(&service, &demo.output_dir, descriptor, data).await?,
        Mode::Group => run_group(&service, &demo, descriptor, data, &file_name).await?,
    };
    let elapsed = start.elapsed();

    let mut failed = 0;
    for (label, outcome) in &outcomes {
        match &outcome.failure {
            None => info!(
                "[{}] {:?}: {} bytes, {:.2} MB/s",
                label,
                outcome.status,
                outcome.progress.received_bytes,
                outcome.progress.bytes_per_sec / 1_000_000.0
            ),
            Some(failure) => {
                failed += 1;
                warn!("[{}] {:?}: {}", label, outcome.status, failure);
            }
        }
    }
    info!(
        "완료: {}개 전송, 실패 {}개, {:.2}s, 출력 디렉터리 {:?}",
        outcomes.len(),
        failed,
        elapsed.as_secs_f64(),
        demo.output_dir
    );

    service.shutdown().await?;
    if failed > 0 {
        return Err(format!("{}개 전송 실패", failed).into());
    }
    Ok(())
}

/// 진행률 이벤트를 로그로 출력하고 최종 결과 반환
async fn follow(label: String, transfer: Transfer) -> (String, TransferOutcome) {
    let Transfer { handle, mut events } = transfer;
    let mut last_logged = -10.0;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress(p) if p.percent - last_logged >= 10.0 => {
                last_logged = p.percent;
                let eta = p
                    .eta
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    "[{}] {:5.1}% ({}/{} bytes), ETA {}",
                    label, p.percent, p.received_bytes, p.total_bytes, eta
                );
            }
            TransferEvent::Progress(_) => {}
            TransferEvent::Finished(outcome) => return (label, outcome),
        }
    }
    let outcome = handle.wait().await;
    (label, outcome)
}

async fn expect_control(link: &mut RelayLink) -> Result<ControlMessage, Box<dyn std::error::Error>> {
    loop {
        match link.recv().await {
            Some(WireMessage::Control(msg)) => return Ok(msg),
            Some(WireMessage::Binary(_)) => continue,
            None => return Err("허브 연결 종료".into()),
        }
    }
}

async fn run_relay(
    service: &ShareService,
    output_dir: &Path,
    descriptor: chunkdrop::TransferDescriptor,
    data: Bytes,
) -> Result<Vec<(String, TransferOutcome)>, Box<dyn std::error::Error>> {
    let (host_id, mut host) = service.connect().await?;
    host.send(ControlMessage::CreateRoom { capacity: None }).await?;
    let room_id: RoomId = match expect_control(&mut host).await? {
        ControlMessage::RoomCreated { room_id, .. } => room_id,
        other => return Err(format!("방 생성 실패: {:?}", other).into()),
    };
    info!("방 {:06} 생성 (host={})", room_id, host_id);

    let (peer_id, mut peer) = service.connect().await?;
    peer.send(ControlMessage::JoinRoom { room_id }).await?;
    match expect_control(&mut peer).await? {
        ControlMessage::RoomJoined { .. } => {}
        other => return Err(format!("방 참가 실패: {:?}", other).into()),
    }
    expect_control(&mut host).await?; // peer-joined
    info!("피어 {} 참가", peer_id);

    let receiver = service.receive_relay(peer, FileSink::in_directory(output_dir))?;
    let sender = service.send_relay(descriptor, data, host)?;

    let (received, sent) = tokio::join!(
        follow("relay-recv".to_string(), receiver),
        follow("relay-send".to_string(), sender)
    );
    Ok(vec![sent, received])
}

async fn run_direct(
    service: &ShareService,
    output_dir: &Path,
    descriptor: chunkdrop::TransferDescriptor,
    data: Bytes,
) -> Result<Vec<(String, TransferOutcome)>, Box<dyn std::error::Error>> {
    let (channel, events) = memory_channel(MemoryChannelOptions::default());
    let channel = Arc::new(channel);

    let receiver = service.receive_direct(events, FileSink::in_directory(output_dir))?;
    let sender = service.send_direct(descriptor, data, channel.clone())?;

    let (received, sent) = tokio::join!(
        follow("direct-recv".to_string(), receiver),
        follow("direct-send".to_string(), sender)
    );
    info!(
        "직접 채널: {}회 송신, 최대 버퍼 {} bytes",
        channel.sends(),
        channel.peak_buffered()
    );
    Ok(vec![sent, received])
}

async fn run_group(
    service: &ShareService,
    demo: &DemoConfig,
    descriptor: chunkdrop::TransferDescriptor,
    data: Bytes,
    file_name: &str,
) -> Result<Vec<(String, TransferOutcome)>, Box<dyn std::error::Error>> {
    let (host_id, mut host) = service.connect().await?;
    host.send(ControlMessage::CreateRoom {
        capacity: Some(demo.peers + 1),
    })
    .await?;
    let room_id: RoomId = match expect_control(&mut host).await? {
        ControlMessage::RoomCreated { room_id, .. } => room_id,
        other => return Err(format!("방 생성 실패: {:?}", other).into()),
    };

    let group = service.open_group(room_id, host_id)?;
    let artifact_id = group.publish(host_id, descriptor, data)?;
    let announcement = group.announcement(artifact_id)?;

    let mut links = Vec::new();
    let mut followers = Vec::new();
    for n in 1..=demo.peers {
        let (peer_id, mut peer) = service.connect().await?;
        peer.send(ControlMessage::JoinRoom { room_id }).await?;
        match expect_control(&mut peer).await? {
            ControlMessage::RoomJoined { .. } => {}
            other => return Err(format!("방 참가 실패: {:?}", other).into()),
        }
        group.add_member(peer_id)?;
        host.send(announcement.clone()).await?;

        let (channel, events) = memory_channel(MemoryChannelOptions::default());
        let path = demo.output_dir.join(format!("peer{}-{}", n, file_name));
        let transfer = group.subscribe(artifact_id, peer_id, Arc::new(channel), events, FileSink::to_path(path))?;
        followers.push(tokio::spawn(follow(format!("peer{}", n), transfer)));
        links.push(peer);
    }

    let mut outcomes = Vec::new();
    for follower in followers {
        outcomes.push(follower.await?);
    }

    let report = group.report();
    info!(
        "그룹 {:06}: 멤버 {}명, 전체 완료 = {}",
        room_id,
        report.members.len(),
        report.fully_complete
    );
    drop(links);
    Ok(outcomes)
}
