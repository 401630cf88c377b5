//! Scripted device on the far end of a duplex stream.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use unpi_client::pipeline::PipelineConfig;
use unpi_client::protocol::{build_frame, CmdType, Frame, FrameBuffer};
use unpi_client::{Driver, DriverBuilder};

pub struct MockDevice {
    stream: DuplexStream,
    buffer: FrameBuffer,
    received: VecDeque<Frame>,
}

impl MockDevice {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            received: VecDeque::new(),
        }
    }

    /// Next frame written by the driver.
    pub async fn next_frame(&mut self) -> Frame {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = self.received.pop_front() {
                return frame;
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "driver closed the transport");
            self.received.extend(self.buffer.push(&chunk[..n]));
        }
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.next_frame()).await.ok()
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn reply(&mut self, subsystem: u8, command: u8, payload: &[u8]) {
        self.send(CmdType::Srsp, subsystem, command, payload).await;
    }

    pub async fn indicate(&mut self, subsystem: u8, command: u8, payload: &[u8]) {
        self.send(CmdType::Areq, subsystem, command, payload).await;
    }

    pub async fn send(&mut self, cmd_type: CmdType, subsystem: u8, command: u8, payload: &[u8]) {
        let bytes = build_frame(cmd_type, subsystem, command, payload).unwrap();
        self.write_raw(&bytes).await;
    }

    /// Answer the next frame, which must be a keepalive echo.
    pub async fn answer_echo(&mut self) {
        let frame = self.next_frame().await;
        assert_eq!((frame.subsystem(), frame.command()), (27, 0));
        self.reply(27, 0, frame.payload()).await;
    }
}

/// Short timeouts for timing-dependent tests.
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        soft_timeout: Duration::from_millis(100),
        fatal_timeout: Duration::from_millis(2000),
        realign_attempts: 3,
        probe_timeout: Duration::from_millis(200),
        piggyback_timeout: Duration::from_millis(200),
    }
}

/// Driver without startup drain, plus the device end of its transport.
pub async fn start(builder: DriverBuilder) -> (Driver, MockDevice) {
    let (client, server) = duplex(4096);
    let driver = builder.drain_on_start(false).start(client).await.unwrap();
    (driver, MockDevice::new(server))
}

pub async fn start_default() -> (Driver, MockDevice) {
    start(Driver::builder().pipeline_config(fast_pipeline())).await
}
