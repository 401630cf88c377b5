//! Integration tests for unpi-client.
//!
//! A full driver talks to a scripted device over an in-memory duplex.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_pipeline, start, start_default, MockDevice};
use tokio::io::duplex;
use unpi_client::protocol::{build_frame, CmdType};
use unpi_client::{Args, Driver, UnpiError, Value};

const SYS: u8 = 1;
const ZDO: u8 = 5;
const RCN: u8 = 27;

const VERSION_RSP: [u8; 9] = [2, 0, 2, 7, 1, 0, 0, 0, 0];

/// Request and reply travel end to end.
#[tokio::test]
async fn test_request_round_trip() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("version", Args::empty()), async {
        let frame = device.next_frame().await;
        assert_eq!(frame.to_bytes().as_ref(), &[0xFE, 0x00, 0x21, 0x02, 0x23]);
        device.reply(SYS, 2, &VERSION_RSP).await;
    });

    let fields = result.unwrap();
    assert_eq!(fields["majorrel"], Value::Number(2));
    assert_eq!(fields["minorrel"], Value::Number(7));
    assert_eq!(driver.info().await.pending, 0);
}

/// Named arguments are encoded in declaration order.
#[tokio::test]
async fn test_named_arguments() {
    let (driver, mut device) = start_default().await;

    let request = driver.sys_request("osalNvRead", [("offset", 0u16), ("id", 0x0003u16)]);
    let (result, ()) = tokio::join!(request, async {
        let frame = device.next_frame().await;
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00]);
        device.reply(SYS, 8, &[0, 2, 0xAA, 0xBB]).await;
    });

    let fields = result.unwrap();
    assert_eq!(fields["status"], Value::Number(0));
    assert_eq!(fields["value"], Value::Bytes(vec![0xAA, 0xBB]));
}

/// Replies split at arbitrary points, behind line noise, still decode.
#[tokio::test]
async fn test_fragmented_reply_after_garbage() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("ping", Args::empty()), async {
        device.next_frame().await;
        let reply = build_frame(CmdType::Srsp, SYS, 1, &[0x79, 0x01]).unwrap();
        device.write_raw(&[0x00, 0x13, 0x37]).await;
        for byte in reply.iter() {
            device.write_raw(&[*byte]).await;
        }
    });
    assert_eq!(result.unwrap()["capabilities"], Value::Number(0x0179));
}

/// A lost reply triggers realignment and a resend.
#[tokio::test]
async fn test_realignment_after_dropped_reply() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("version", Args::empty()), async {
        let original = device.next_frame().await;
        // swallow the reply, answer the probe
        device.answer_echo().await;
        let resent = device.next_frame().await;
        assert_eq!(resent.to_bytes(), original.to_bytes());
        device.reply(SYS, 2, &VERSION_RSP).await;
    });

    assert_eq!(result.unwrap()["product"], Value::Number(0));
    assert_eq!(driver.info().await.pending, 0);
}

/// An echo carrying the wrong nonce fails the request as corruption.
#[tokio::test]
async fn test_realignment_detects_corruption() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("version", Args::empty()), async {
        device.next_frame().await;
        let probe = device.next_frame().await;
        let mut value = probe.payload().to_vec();
        value[3] ^= 0x80;
        device.reply(RCN, 0, &value).await;
    });

    let err = result.unwrap_err();
    assert!(matches!(err, UnpiError::Corruption { .. }));
    assert!(err.is_fatal());
}

/// A device that never answers ends in a fatal timeout with nothing left behind.
#[tokio::test]
async fn test_unresponsive_device() {
    let (driver, _device) = start_default().await;
    let err = driver.sys_request("version", Args::empty()).await.unwrap_err();
    assert!(matches!(err, UnpiError::FatalTimeout(_)));

    let info = driver.info().await;
    assert_eq!(info.pending, 0);
    assert_eq!(info.queued, 0);
}

/// A generic error rejects the request it names and nothing else.
#[tokio::test]
async fn test_generic_error_targets_named_request() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("version", Args::empty()), async {
        device.next_frame().await;
        // refers to NWK command 4, which nobody is waiting for
        device.reply(0, 0, &[3, 0x23, 4]).await;
        // refers to SYS version
        device.reply(0, 0, &[2, 0x21, 2]).await;
    });

    match result.unwrap_err() {
        UnpiError::DeviceError {
            subsystem,
            command,
            code,
            reason,
        } => {
            assert_eq!(subsystem, "SYS");
            assert_eq!(command, "version");
            assert_eq!(code, 2);
            assert_eq!(reason, "InvalidCommandId");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// A reply with a bad check byte rejects the request but keeps the data.
#[tokio::test]
async fn test_invalid_checksum_reply() {
    let (driver, mut device) = start_default().await;

    let (result, ()) = tokio::join!(driver.sys_request("ping", Args::empty()), async {
        device.next_frame().await;
        let mut reply = build_frame(CmdType::Srsp, SYS, 1, &[0x01, 0x00]).unwrap().to_vec();
        let last = reply.len() - 1;
        reply[last] ^= 0x01;
        device.write_raw(&reply).await;
    });

    match result.unwrap_err() {
        UnpiError::InvalidChecksum { received } => {
            assert_eq!(received["capabilities"], Value::Number(1))
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// Requests from many tasks are put on the wire one at a time, in order.
#[tokio::test]
async fn test_concurrent_requests_are_serialized() {
    let (driver, mut device) = start_default().await;
    let driver = Arc::new(driver);

    let mut handles = Vec::new();
    for i in 0..8u16 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            driver.sys_request("osalNvLength", [("id", i)]).await
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..8u16 {
        let frame = device.next_frame().await;
        assert_eq!(frame.payload(), &i.to_le_bytes());
        // nothing else goes out until this one is answered
        assert!(device.try_next_frame(Duration::from_millis(20)).await.is_none());
        device.reply(SYS, 19, &(i * 10).to_le_bytes()).await;
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let fields = handle.await.unwrap().unwrap();
        assert_eq!(fields["length"], Value::Number(i as i64 * 10));
    }
}

/// Overflow evicts the oldest waiting request; the rest keep their order.
#[tokio::test]
async fn test_queue_overflow_evicts_oldest() {
    let (driver, mut device) = start(
        Driver::builder()
            .pipeline_config(fast_pipeline())
            .max_queue_length(2),
    )
    .await;
    let driver = Arc::new(driver);

    let mut handles = Vec::new();
    for i in 0..4u16 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            driver.sys_request("osalNvLength", [("id", i)]).await
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for expected in [0u16, 2, 3] {
        let frame = device.next_frame().await;
        assert_eq!(frame.payload(), &expected.to_le_bytes());
        device.reply(SYS, 19, &[1, 0]).await;
    }

    let results: Vec<_> = collect_results(handles).await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(UnpiError::QueueOverflow)));
    assert!(results[2].is_ok());
    assert!(results[3].is_ok());
}

async fn collect_results(
    handles: Vec<tokio::task::JoinHandle<unpi_client::Result<unpi_client::Fields>>>,
) -> Vec<unpi_client::Result<unpi_client::Fields>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

/// A reset clears the backlog, fails the in-flight request and waits for
/// the reset indication.
#[tokio::test]
async fn test_reset_clears_outstanding_work() {
    let (driver, mut device) = start_default().await;
    let driver = Arc::new(driver);

    let in_flight = tokio::spawn({
        let driver = driver.clone();
        async move { driver.sys_request("version", Args::empty()).await }
    });
    device.next_frame().await;

    let queued = tokio::spawn({
        let driver = driver.clone();
        async move { driver.sys_request("ping", Args::empty()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reset = tokio::spawn({
        let driver = driver.clone();
        async move { driver.sys_request("resetReq", [("type", 1u8)]).await }
    });

    assert!(matches!(queued.await.unwrap(), Err(UnpiError::QueueCleared)));

    device.indicate(SYS, 0x80, &[0, 2, 0, 2, 7, 1]).await;
    assert!(matches!(in_flight.await.unwrap(), Err(UnpiError::ModuleReset)));

    let frame = device.next_frame().await;
    assert_eq!((frame.cmd_type(), frame.subsystem(), frame.command()), (CmdType::Areq, SYS, 0));
    assert!(!reset.is_finished());
    device.indicate(SYS, 0x80, &[0, 2, 0, 2, 7, 1]).await;

    assert!(reset.await.unwrap().unwrap().is_empty());
}

/// Notifications reach subscribers with their decoded fields.
#[tokio::test]
async fn test_indications_are_published() {
    let (driver, mut device) = start_default().await;
    let mut events = driver.subscribe();

    device.indicate(ZDO, 192, &[9]).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.topic(), "AREQ:ZDO:stateChangeInd");
    assert!(event.is_indication());
    assert!(event.checksum_valid);
    assert_eq!(event.data["state"], Value::Number(9));
    assert_eq!(
        driver.registry().enum_name("devStates", 9),
        Some("DEV_ZB_COORD")
    );
}

/// Unknown frames are skipped without disturbing later traffic.
#[tokio::test]
async fn test_unknown_frames_are_ignored() {
    let (driver, mut device) = start_default().await;
    let mut events = driver.subscribe();

    device.indicate(SYS, 0x7F, &[1, 2, 3]).await;
    device.indicate(ZDO, 192, &[0]).await;

    let event = events.recv().await.unwrap();
    assert!(event.matches("ZDO", "stateChangeInd"));
}

/// Startup drain answers readiness.
#[tokio::test]
async fn test_start_drains_stale_replies() {
    let (client, server) = duplex(4096);
    let mut device = MockDevice::new(server);
    let device_task = tokio::spawn(async move {
        device.answer_echo().await;
        device
    });

    let driver = Driver::builder()
        .pipeline_config(fast_pipeline())
        .start(client)
        .await
        .unwrap();
    assert!(driver.is_ready());
    device_task.await.unwrap();
}

/// A silent device leaves the driver usable but not ready.
#[tokio::test]
async fn test_start_without_answer_is_not_ready() {
    let (client, _server) = duplex(4096);
    let driver = Driver::builder()
        .pipeline_config(fast_pipeline())
        .drain_attempts(2)
        .drain_interval(Duration::from_millis(10))
        .start(client)
        .await
        .unwrap();
    assert!(!driver.is_ready());
    assert!(matches!(driver.drain().await, Err(UnpiError::NotReady)));
}

/// Ping goes out without waiting for the queue.
#[tokio::test]
async fn test_ping_bypasses_queue() {
    let (driver, mut device) = start_default().await;

    let (request, ping, ()) = tokio::join!(
        driver.sys_request("version", Args::empty()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            driver.ping().await
        },
        async {
            device.next_frame().await;
            device.answer_echo().await;
            device.reply(SYS, 2, &VERSION_RSP).await;
        }
    );
    assert!(ping.is_ok());
    assert!(request.is_ok());
}

/// Close resolves every waiting caller.
#[tokio::test]
async fn test_close_rejects_outstanding_requests() {
    let (driver, mut device) = start(Driver::builder()).await;
    let driver = Arc::new(driver);

    let in_flight = tokio::spawn({
        let driver = driver.clone();
        async move { driver.sys_request("version", Args::empty()).await }
    });
    device.next_frame().await;
    let queued = tokio::spawn({
        let driver = driver.clone();
        async move { driver.sys_request("ping", Args::empty()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    driver.close().await;

    assert!(in_flight.await.unwrap().is_err());
    assert!(queued.await.unwrap().is_err());
    assert_eq!(driver.info().await.pending, 0);
    assert!(matches!(driver.ping().await, Err(UnpiError::ConnectionClosed)));
}

/// End of stream fails whatever is waiting.
#[tokio::test]
async fn test_transport_eof() {
    let (driver, mut device) = start(Driver::builder()).await;

    let (result, ()) = tokio::join!(driver.sys_request("version", Args::empty()), async {
        device.next_frame().await;
        drop(device);
    });
    assert!(matches!(result, Err(UnpiError::ConnectionClosed)));
}
