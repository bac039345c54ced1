//! Serial port channel for desktop using serialport crate
//!
//! `serialport` is blocking, so each open link is bridged to tokio through an
//! in-memory duplex pipe pumped by two blocking tasks. `close` waits for both
//! so the port is released before a reconnect.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::transport::ByteChannel;

// Port read timeout; bounds how long the inbound pump takes to notice close
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SETTLE_DELAY: Duration = Duration::from_millis(500);
const BRIDGE_CAPACITY: usize = 1024;

pub struct SerialChannel {
    port_name: String,
    running: Option<Arc<AtomicBool>>,
    pumps: Vec<JoinHandle<()>>,
}

impl SerialChannel {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            running: None,
            pumps: Vec::new(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl ByteChannel for SerialChannel {
    type Source = ReadHalf<DuplexStream>;
    type Sink = WriteHalf<DuplexStream>;
    type Error = std::io::Error;

    async fn open(&mut self, baud_rate: u32) -> Result<(Self::Source, Self::Sink), Self::Error> {
        let mut port = serialport::new(self.port_name.as_str(), baud_rate)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(std::io::Error::other)?;
        tokio::time::sleep(SETTLE_DELAY).await;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::other)?;
        let mut port_rx = port.try_clone().map_err(std::io::Error::other)?;

        let (session_end, bridge_end) = tokio::io::duplex(BRIDGE_CAPACITY);
        let (mut bridge_rx, mut bridge_tx) = tokio::io::split(bridge_end);
        let running = Arc::new(AtomicBool::new(true));
        let handle = Handle::current();

        let inbound_running = Arc::clone(&running);
        let inbound_handle = handle.clone();
        let inbound = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 256];
            while inbound_running.load(Ordering::Acquire) {
                match port_rx.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if inbound_handle.block_on(bridge_tx.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        error!("Serial read error: {:?}", e);
                        break;
                    }
                }
            }
            debug!("Serial inbound pump stopped");
        });

        let outbound_running = Arc::clone(&running);
        let outbound = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 256];
            while outbound_running.load(Ordering::Acquire) {
                // Returns 0 once the session drops its sink
                let n = match handle.block_on(bridge_rx.read(&mut buf)) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Err(e) = port.write_all(&buf[..n]).and_then(|_| port.flush()) {
                    error!("Serial write error: {:?}", e);
                    break;
                }
            }
            debug!("Serial outbound pump stopped");
        });

        self.running = Some(running);
        self.pumps = vec![inbound, outbound];
        debug!("Opened {} at {} baud", self.port_name, baud_rate);
        Ok(tokio::io::split(session_end))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.store(false, Ordering::Release);
        // The outbound pump exits once the session has dropped its sink, the
        // inbound one within a poll interval
        for pump in self.pumps.drain(..) {
            pump.await.map_err(std::io::Error::other)?;
        }
        debug!("Closed {}", self.port_name);
        Ok(())
    }
}
