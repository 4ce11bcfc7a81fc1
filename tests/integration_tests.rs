//! Integration tests for the RTT session manager

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use rtt_link::error::{transport_codes, ErrorKind};
use rtt_link::rtt::{Direction, ReadResult, SessionSlot};
use rtt_link::transport::simulated::{ChannelSpec, SimulatedProbe, SimulatedTarget, CONTROL_BLOCK_ADDRESS};
use rtt_link::{ErrorCode, Operation, RttError, RttSession, SessionOptions, StartOptions, Status};

const SERIAL: u32 = 683_123_456;

fn fast_options() -> SessionOptions {
    SessionOptions {
        control_block_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        queue_timeout: None,
    }
}

fn loopback_probe() -> SimulatedProbe {
    SimulatedProbe::new().with_target(
        SERIAL,
        SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 256), ChannelSpec::new("Data", 64)]),
    )
}

fn session_for(probe: SimulatedProbe) -> RttSession<SimulatedProbe> {
    RttSession::with_slot(probe, fast_options(), SessionSlot::new())
}

async fn read_until_data(session: &RttSession<SimulatedProbe>, channel: u32, length: usize) -> ReadResult {
    for _ in 0..50 {
        let result = session.read(channel, length).await.unwrap();
        if !result.is_empty() {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no data arrived on up channel {}", channel);
}

#[tokio::test]
async fn test_undiscovered_channels_are_usage_errors() {
    let session = session_for(loopback_probe());
    let channels = session.start(SERIAL, StartOptions::default()).await.unwrap();
    assert_eq!(channels.up.len(), 2);
    assert_eq!(channels.down.len(), 2);

    for index in [2, 3, 255, u32::MAX] {
        let err = session.read(index, 8).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = session.write(index, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
    assert_eq!(session.status().await, Status::Active);
}

#[tokio::test]
async fn test_double_stop_fails() {
    let session = session_for(loopback_probe());
    assert!(matches!(session.stop().await, Err(RttError::NotStarted)));

    assert_ok!(session.start(SERIAL, StartOptions::default()).await);
    assert_ok!(session.stop().await);

    let err = assert_err!(session.stop().await);
    assert_eq!(err.code(), ErrorCode::NotInitialized);
    assert_eq!(err.code().errno(), 11);
}

#[tokio::test]
async fn test_binary_round_trip() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let written = session.write(0, vec![0u8, 1, 2, 3, 4]).await.unwrap();
    assert_eq!(written.bytes_written, 5);

    let result = read_until_data(&session, 0, 64).await;
    assert_eq!(result.raw, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_text_round_trip() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    session.write(1, "this is a test").await.unwrap();
    let result = read_until_data(&session, 1, 64).await;
    assert_eq!(result.text, "this is a test");
    assert_eq!(result.raw.len(), 14);
}

#[tokio::test]
async fn test_pinned_control_block_location() {
    let session = session_for(loopback_probe());
    session
        .start(SERIAL, StartOptions::at(CONTROL_BLOCK_ADDRESS))
        .await
        .unwrap();
    session.stop().await.unwrap();

    let err = session.start(SERIAL, StartOptions::at(15)).await.unwrap_err();
    assert!(matches!(err, RttError::ControlBlockNotAtAddress { address: 15, .. }));
    assert_eq!(err.code(), ErrorCode::CouldNotFindControlBlock);
    assert_eq!(session.status().await, Status::Stopped);

    // A valid RAM address that holds no block is never scanned around
    let err = session
        .start(SERIAL, StartOptions::at(CONTROL_BLOCK_ADDRESS + 4))
        .await
        .unwrap_err();
    assert!(matches!(err, RttError::ControlBlockNotAtAddress { .. }));
    assert!(!session.transport().is_connected(SERIAL));
}

#[tokio::test]
async fn test_unknown_serial_fails_fast() {
    let session = session_for(loopback_probe());
    let started = std::time::Instant::now();
    let err = session.start(0, StartOptions::default()).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.code(), ErrorCode::CouldNotConnectToDevice);
    assert_eq!(err.transport_error().map(|t| t.code), Some(transport_codes::PROBE_NOT_FOUND));

    let report = err.report(Operation::Start, &session.last_log().await);
    assert_eq!(report.errno, 6);
    assert_eq!(report.erroroperation, "connect");
    assert!(report.log.contains("Connecting to probe 0"));
}

#[tokio::test]
async fn test_short_reads_are_not_errors() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let empty = session.read(0, 100).await.unwrap();
    assert!(empty.is_empty());

    session.write(0, "abc").await.unwrap();
    let result = read_until_data(&session, 0, 100).await;
    assert_eq!(result.raw.len(), 3);

    let zero = session.read(0, 0).await.unwrap();
    assert!(zero.raw.is_empty());
}

#[tokio::test]
async fn test_reads_are_bounded_by_length() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    session.write(0, "0123456789").await.unwrap();
    let first = read_until_data(&session, 0, 4).await;
    assert_eq!(first.text, "0123");
    let rest = session.read(0, 100).await.unwrap();
    assert_eq!(rest.text, "456789");
}

#[tokio::test]
async fn test_full_down_buffer_takes_partial_write() {
    let probe = SimulatedProbe::new().with_target(
        SERIAL,
        SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 16)]).without_loopback(),
    );
    let session = session_for(probe);
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let first = session.write(0, [0xAAu8; 20]).await.unwrap();
    assert_eq!(first.bytes_written, 15);
    let second = session.write(0, "more").await.unwrap();
    assert_eq!(second.bytes_written, 0);
}

#[tokio::test]
async fn test_control_block_appears_after_firmware_init() {
    let probe = SimulatedProbe::new().with_target(
        SERIAL,
        SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 64)])
            .with_init_delay(Duration::from_millis(50))
            .with_greeting(b"booted\n"),
    );
    let session = session_for(probe);
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let greeting = read_until_data(&session, 0, 64).await;
    assert_eq!(greeting.text, "booted\n");
}

#[tokio::test]
async fn test_missing_control_block_times_out() {
    let probe = SimulatedProbe::new().with_target(SERIAL, SimulatedTarget::without_rtt());
    let session = session_for(probe);

    let err = session.start(SERIAL, StartOptions::default()).await.unwrap_err();
    match err {
        RttError::ControlBlockNotFound { waited_ms } => assert!(waited_ms >= 200),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(session.status().await, Status::Stopped);
    assert!(!session.transport().is_connected(SERIAL));
}

#[tokio::test]
async fn test_link_failure_tears_session_down() {
    let probe = SimulatedProbe::new().with_target(
        SERIAL,
        SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 64)]).fail_transfers_after(1),
    );
    let session = session_for(probe);
    session.start(SERIAL, StartOptions::default()).await.unwrap();
    session.write(0, "ok").await.unwrap();

    let err = session.read(0, 16).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CouldNotCallFunction);
    assert_eq!(err.transport_error().map(|t| t.code), Some(transport_codes::LINK_LOST));
    assert_eq!(session.status().await, Status::Stopped);
    assert!(!session.transport().is_connected(SERIAL));

    // Restart works once the probe is released
    session.start(SERIAL, StartOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_run_in_submission_order() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let writes = (b'a'..=b'j').map(|byte| session.write(0, vec![byte]));
    let results = join_all(writes).await;
    assert!(results.iter().all(|r| matches!(r, Ok(w) if w.bytes_written == 1)));

    let echoed = read_until_data(&session, 0, 64).await;
    assert_eq!(echoed.text, "abcdefghij");
}

#[tokio::test]
async fn test_queue_timeout_reports_busy() {
    let probe = SimulatedProbe::new().with_target(SERIAL, SimulatedTarget::without_rtt());
    let options = SessionOptions {
        control_block_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        queue_timeout: Some(Duration::from_millis(20)),
    };
    let session = Arc::new(RttSession::with_slot(probe, options, SessionSlot::new()));

    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start(SERIAL, StartOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = session.read(0, 8).await.unwrap_err();
    assert!(matches!(err, RttError::Busy));
    assert_eq!(err.code().errno(), 12);
    assert_eq!(err.kind(), ErrorKind::Load);

    assert!(starting.await.unwrap().is_err());
}

#[tokio::test]
async fn test_failed_start_keeps_its_own_trace_while_calls_queue_behind_it() {
    let probe = SimulatedProbe::new().with_target(SERIAL, SimulatedTarget::without_rtt());
    let session = Arc::new(session_for(probe));

    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start_traced(SERIAL, StartOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queued = session.read_traced(0, 8).await.unwrap_err();
    assert!(matches!(queued.error, RttError::NotStarted));
    assert!(!queued.log.contains("Scanning RAM"));

    let failed = starting.await.unwrap().unwrap_err();
    assert!(matches!(failed.error, RttError::ControlBlockNotFound { .. }));
    assert!(failed.log.contains("Scanning RAM for control block"));
    assert!(failed.log.contains("No control block after"));

    let report = failed.report(Operation::Start);
    assert_eq!(report.erroroperation, Operation::Start.to_string());
    assert!(report.log.contains("No control block after"));
}

#[tokio::test]
async fn test_unbounded_read_length_returns_what_is_buffered() {
    let session = session_for(loopback_probe());
    session.start(SERIAL, StartOptions::default()).await.unwrap();

    let empty = session.read(0, usize::MAX).await.unwrap();
    assert!(empty.is_empty());

    session.write(0, "abc").await.unwrap();
    let echoed = read_until_data(&session, 0, usize::MAX).await;
    assert_eq!(echoed.raw, b"abc".to_vec());
    assert_eq!(session.status().await, Status::Active);
}

#[tokio::test]
async fn test_pinned_location_at_top_of_address_space_is_rejected() {
    let session = session_for(loopback_probe());
    let err = session
        .start(SERIAL, StartOptions::at(u64::MAX - 4))
        .await
        .unwrap_err();
    assert!(matches!(err, RttError::ControlBlockNotAtAddress { address, .. } if address == u64::MAX - 4));
    assert_eq!(session.status().await, Status::Stopped);
    assert!(!session.transport().is_connected(SERIAL));
}

#[tokio::test]
async fn test_abandoned_start_is_released_by_stop() {
    let probe = SimulatedProbe::new().with_target(SERIAL, SimulatedTarget::without_rtt());
    let session = session_for(probe);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(30),
        session.start(SERIAL, StartOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(session.status().await, Status::Starting);
    assert!(matches!(
        session.start(SERIAL, StartOptions::default()).await,
        Err(RttError::AlreadyStarted)
    ));

    session.stop().await.unwrap();
    assert_eq!(session.status().await, Status::Stopped);
    assert!(!session.transport().is_connected(SERIAL));
}

#[tokio::test]
async fn test_one_active_session_per_process() {
    let first = RttSession::new(loopback_probe(), fast_options());
    let second_probe = SimulatedProbe::new().with_target(
        1,
        SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 64)]),
    );
    let second = RttSession::new(second_probe, fast_options());

    first.start(SERIAL, StartOptions::default()).await.unwrap();
    let err = second.start(1, StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, RttError::AlreadyStarted));
    assert_eq!(second.transport().reset_count(1), 0);

    first.stop().await.unwrap();
    second.start(1, StartOptions::default()).await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_table_describes_buffers() {
    let session = session_for(loopback_probe());
    let channels = session.start(SERIAL, StartOptions::default()).await.unwrap();

    let data = &channels.up[1];
    assert_eq!(data.channel_index, 1);
    assert_eq!(data.direction, Direction::Up);
    assert_eq!(data.name, "Data");
    assert_eq!(data.size, 64);
    assert_eq!(session.channels().await.unwrap(), channels);

    let info = session.info().await;
    assert_eq!(info.serial_number, Some(SERIAL));
    assert_eq!(info.control_block_address, Some(CONTROL_BLOCK_ADDRESS));
    assert!(info.started_at.is_some());
}

#[cfg(feature = "full-integration")]
mod hardware {
    //! Needs a probe on the serial in RTT_LINK_SERIAL with loopback firmware flashed

    use super::*;
    use rtt_link::transport::ProbeRsTransport;
    use rtt_link::Config;

    fn hardware_serial() -> Option<u32> {
        std::env::var("RTT_LINK_SERIAL").ok()?.parse().ok()
    }

    #[tokio::test]
    async fn test_hardware_text_round_trip() {
        let Some(serial) = hardware_serial() else {
            println!("RTT_LINK_SERIAL not set, skipping");
            return;
        };
        let config = Config::default();
        let session = RttSession::with_slot(
            ProbeRsTransport::new(config.probe.clone()),
            SessionOptions::from(&config.rtt),
            SessionSlot::new(),
        );

        session.start(serial, StartOptions::default()).await.unwrap();
        session.write(0, "this is a test").await.unwrap();

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(session.read(0, 64).await.unwrap().raw);
            if received.ends_with(b"this is a test") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(received.ends_with(b"this is a test"));
        session.stop().await.unwrap();
    }
}
