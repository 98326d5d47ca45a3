#![cfg(unix)]

mod common;

use agent_manager::dispatcher::{run_session, AgentStatus, CloseReason, DispatcherOptions};
use agent_manager::ipc::layout::{AgentType, LatSample, Timespec};
use agent_manager::ipc::protocol::{MsgHeader, ReportKind, Reply, Request, HEADER_LEN};
use agent_manager::ipc::shared_memory::ThreadStats;
use agent_manager::metrics::Counters;
use agent_manager::ReportLog;
use anyhow::Result;
use common::{RecordingShaper, StubAgent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal controller: one request out, one reply back.
struct Controller {
    stream: TcpStream,
}

impl Controller {
    async fn send(&mut self, request: Request) -> Result<()> {
        self.stream.write_all(&request.encode()?).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Reply> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let payload_len = match MsgHeader::decode(&header)?.message_length {
            36 => 44,
            140 => 250,
            _ => 4,
        };
        let mut message = header.to_vec();
        message.resize(HEADER_LEN + payload_len, 0);
        self.stream.read_exact(&mut message[HEADER_LEN..]).await?;
        Ok(Reply::decode(&message)?)
    }

    async fn call(&mut self, request: Request) -> Result<Reply> {
        self.send(request).await?;
        self.recv().await
    }
}

async fn listen() -> Result<(TcpListener, std::net::SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

#[tokio::test]
async fn throughput_session_end_to_end() -> Result<()> {
    let stub = StubAgent::new(AgentType::Throughput, 2);
    let shaper = RecordingShaper::default();
    let (listener, addr) = listen().await?;

    let config = stub.config.clone();
    let session_shaper = shaper.clone();
    let session = tokio::spawn(async move {
        run_session(listener, &config, session_shaper, DispatcherOptions::default()).await
    });

    let mut controller = Controller {
        stream: TcpStream::connect(addr).await?,
    };

    assert_eq!(controller.call(Request::StartLoad { load: 2000 }).await?, Reply::Ack);
    assert_eq!(shaper.recorded(), vec![1000.0]);

    let measure = Request::StartMeasure {
        sample_count: 100,
        sampling_rate: 100.0,
    };
    assert_eq!(controller.call(measure).await?, Reply::Ack);
    assert!(stub.control.should_measure());

    stub.stats[0].set_counters(Counters {
        rx_bytes: 1000,
        rx_reqs: 10,
        tx_bytes: 800,
        tx_reqs: 10,
    });
    stub.stats[1].set_counters(Counters {
        rx_bytes: 500,
        rx_reqs: 5,
        tx_bytes: 400,
        tx_reqs: 5,
    });

    match controller.call(Request::Report(ReportKind::Throughput)).await? {
        Reply::Throughput(reply) => {
            assert_eq!(reply.rx_bytes, 1500);
            assert_eq!(reply.tx_bytes, 1200);
            assert_eq!(reply.req_count, 15);
            assert!(reply.duration < 60_000_000);
            assert_eq!(reply.correct_iad, 0);
        }
        other => panic!("expected a throughput reply, got {:?}", other),
    }
    assert!(!stub.control.should_measure());

    stub.control.set_conn_open(4);
    assert_eq!(controller.call(Request::ConnOpen).await?, Reply::Value(4));

    drop(controller);
    let summary = session.await??;
    assert_eq!(summary.requests, 4);
    assert_eq!(summary.reports, 1);
    assert_eq!(summary.close_reason, CloseReason::ClientClosed);
    assert_eq!(summary.agent_status, AgentStatus::Running);
    Ok(())
}

#[tokio::test]
async fn latency_session_reports_and_logs() -> Result<()> {
    let stub = StubAgent::new(AgentType::LatencyClosed, 1);
    let (listener, addr) = listen().await?;
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("reports.jsonl");

    let config = stub.config.clone();
    let options = DispatcherOptions {
        close_on_empty_report: false,
        report_log: Some(ReportLog::create(&log_path)?),
    };
    let session = tokio::spawn(async move {
        run_session(listener, &config, RecordingShaper::default(), options).await
    });

    let mut controller = Controller {
        stream: TcpStream::connect(addr).await?,
    };
    let measure = Request::StartMeasure {
        sample_count: 100,
        sampling_rate: 10.0,
    };
    assert_eq!(controller.call(measure).await?, Reply::Ack);
    assert_eq!(stub.control.sample_count(), 100);

    let ThreadStats::Latency(view) = &stub.stats[0] else {
        panic!("latency agents use latency records");
    };
    for i in 1..=100u64 {
        view.push_latency_sample(LatSample::new(i * 1000, Timespec::new(5, i)));
    }

    match controller.call(Request::Report(ReportKind::Latency)).await? {
        Reply::Latency(reply) => {
            assert_eq!(reply.avg_latency, 50_500);
            assert_eq!(reply.percentiles[0].value, 50_500);
            assert!(reply.percentiles[0].lower <= 50_500);
            assert!(reply.percentiles[0].upper >= 50_500);
        }
        other => panic!("expected a latency reply, got {:?}", other),
    }

    drop(controller);
    let summary = session.await??;
    assert_eq!(summary.reports, 1);

    let contents = std::fs::read_to_string(&log_path)?;
    let entry: serde_json::Value = serde_json::from_str(contents.trim())?;
    assert_eq!(entry["window"], 1);
    assert_eq!(entry["report"]["kind"], "latency");
    assert_eq!(entry["report"]["sample_count"], 100);
    Ok(())
}

#[tokio::test]
async fn malformed_request_ends_session() -> Result<()> {
    let stub = StubAgent::new(AgentType::Throughput, 1);
    let (listener, addr) = listen().await?;

    let config = stub.config.clone();
    let session = tokio::spawn(async move {
        run_session(listener, &config, RecordingShaper::default(), DispatcherOptions::default()).await
    });

    let mut stream = TcpStream::connect(addr).await?;
    // REPORT_REQ with an unknown report kind.
    let header = MsgHeader {
        message_type: 2,
        message_length: 4,
    };
    stream.write_all(&header.encode()?).await?;
    stream.write_all(&9u32.to_ne_bytes()).await?;

    let summary = session.await??;
    assert!(matches!(summary.close_reason, CloseReason::ProtocolViolation(_)));
    assert_eq!(summary.requests, 0);
    Ok(())
}
