use std::fmt::Debug;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, FrameDecoder};
use crate::command::{Command, WriteVariant};
use crate::semaphore::TransactionSemaphore;
use crate::transport::ByteChannel;
use crate::types::{bytes_to_hex, IndicatorColor, Response, RfidError, Status, Tag};

/// Session settings
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub baud_rate: u32,
    /// Model string the reader must report before the session is usable
    pub expected_identity: String,
    /// Upper bound on one write/response cycle; `None` waits forever
    pub transaction_timeout: Option<Duration>,
    /// Beep duration used for success feedback
    pub short_beep: u8,
    /// Beep duration used for failure feedback
    pub long_beep: u8,
    /// Size of a single read from the byte source
    pub read_chunk: usize,
    /// Silence required on the line before reusing it after an abandoned
    /// transaction
    pub resync_quiet: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            baud_rate: 38_400,
            expected_identity: "ID card reader & writer".into(),
            transaction_timeout: Some(Duration::from_secs(2)),
            short_beep: 5,
            long_beep: 20,
            read_chunk: 64,
            resync_quiet: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

// Inbound pipeline, built once per connection
struct Inbound<R> {
    source: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    // Set when a transaction was abandoned with its reply possibly in flight
    resync: bool,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    fn new(source: R, read_chunk: usize) -> Self {
        Self {
            source,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; read_chunk.max(1)],
            resync: false,
        }
    }

    /// Discard source bytes until the line stays quiet for `quiet`
    async fn drain(&mut self, quiet: Duration) -> Result<usize, RfidError> {
        let mut dropped = 0;
        loop {
            match tokio::time::timeout(quiet, self.source.read(&mut self.chunk)).await {
                Err(_) => return Ok(dropped),
                Ok(Ok(0)) => {
                    return Err(RfidError::ConnectionClosed { tail: Bytes::new() });
                }
                Ok(Ok(n)) => {
                    trace!("Drained: {}", bytes_to_hex(&self.chunk[..n]));
                    dropped += n;
                }
                Ok(Err(e)) => return Err(transport_error(e)),
            }
        }
    }

    async fn next_response(&mut self) -> Result<Response, RfidError> {
        loop {
            if let Some(response) = self.decoder.decode_next()? {
                return Ok(response);
            }

            let bytes_read = self.source.read(&mut self.chunk).await.map_err(transport_error)?;
            if bytes_read == 0 {
                let tail = self.decoder.flush().unwrap_or_default();
                if !tail.is_empty() {
                    warn!("Stream ended inside a frame: {}", bytes_to_hex(&tail));
                }
                return Err(RfidError::ConnectionClosed { tail });
            }
            self.decoder.extend(&self.chunk[..bytes_read]);
        }
    }
}

/// Session with one reader over a [`ByteChannel`]
///
/// Every operation is one or a short fixed sequence of
/// [`write_frame`](Self::write_frame) transactions. Transactions are
/// serialised FIFO since the link carries no request identifiers.
pub struct ReaderSession<C: ByteChannel> {
    channel: Mutex<C>,
    config: ReaderConfig,
    state: StdMutex<SessionState>,
    shutdown: StdMutex<CancellationToken>,
    inbound: Mutex<Option<Inbound<C::Source>>>,
    outbound: Mutex<Option<C::Sink>>,
    semaphore: TransactionSemaphore,
}

impl<C: ByteChannel> ReaderSession<C> {
    /// Create a disconnected session with default settings
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, ReaderConfig::default())
    }

    pub fn with_config(channel: C, config: ReaderConfig) -> Self {
        Self {
            channel: Mutex::new(channel),
            config,
            state: StdMutex::new(SessionState::Disconnected),
            shutdown: StdMutex::new(CancellationToken::new()),
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            semaphore: TransactionSemaphore::default(),
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the channel and check the reader identifies as the expected model
    ///
    /// On a mismatch or any failure during the check the channel is closed
    /// again and the session stays disconnected.
    pub async fn connect(&self) -> Result<(), RfidError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                SessionState::Connected => return Ok(()),
                SessionState::Connecting => {
                    return Err(RfidError::InvalidState("connect already in progress"));
                }
                SessionState::Disconnected => *state = SessionState::Connecting,
            }
        }
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        debug!("Opening channel at {} baud", self.config.baud_rate);
        let opened = self.channel.lock().await.open(self.config.baud_rate).await;
        let (source, sink) = match opened {
            Ok(halves) => halves,
            Err(e) => {
                error!("Failed to open channel: {:?}", e);
                self.set_state(SessionState::Disconnected);
                return Err(transport_error(e));
            }
        };
        *self.inbound.lock().await = Some(Inbound::new(source, self.config.read_chunk));
        *self.outbound.lock().await = Some(sink);

        let validated = match self.validate_reader().await {
            Ok(()) if token.is_cancelled() => Err(RfidError::Cancelled),
            other => other,
        };
        match validated {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                info!("Connected to '{}'", self.config.expected_identity);
                Ok(())
            }
            Err(e) => {
                error!("Reader validation failed: {}", e);
                self.teardown().await;
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn validate_reader(&self) -> Result<(), RfidError> {
        let model = self.get_model_info().await?;
        if model == self.config.expected_identity {
            Ok(())
        } else {
            Err(RfidError::DeviceMismatch {
                expected: self.config.expected_identity.clone(),
                found: model,
            })
        }
    }

    /// Tear the session down, whatever state it is in
    ///
    /// Pending reads and writes are cancelled and queued transactions fail
    /// with [`RfidError::Cancelled`]. Errors closing the channel are logged.
    pub async fn disconnect(&self) {
        self.shutdown_token().cancel();
        let purged = self.semaphore.purge();
        if purged > 0 {
            debug!("Cancelled {} queued transactions", purged);
        }
        self.teardown().await;
        self.set_state(SessionState::Disconnected);
    }

    async fn teardown(&self) {
        let inbound = self.inbound.lock().await.take();
        let outbound = self.outbound.lock().await.take();
        if inbound.is_none() && outbound.is_none() {
            return;
        }

        if let Some(tail) = inbound.and_then(|mut inbound| inbound.decoder.flush()) {
            debug!("Discarding unread bytes: {}", bytes_to_hex(&tail));
        }
        drop(outbound);

        if let Err(e) = self.channel.lock().await.close().await {
            warn!("Error closing channel: {:?}", e);
        }
        debug!("Channel closed");
    }

    /// Send `command` and wait for the one response it produces
    pub async fn write_frame(&self, command: &Command) -> Result<Response, RfidError> {
        let cancel = self.shutdown_token();
        if cancel.is_cancelled() {
            return Err(RfidError::NotConnected);
        }
        self.semaphore
            .with(|| self.transact(command, &cancel))
            .await
    }

    async fn transact(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Response, RfidError> {
        let mut frame = BytesMut::new();
        codec::encode_frame(command, &mut frame)?;

        let exchange = async {
            self.discard_stale().await?;
            debug!("Sending {}: {}", command.name(), bytes_to_hex(&frame));
            self.send(&frame).await?;
            self.receive(command).await
        };
        let bounded = async {
            match self.config.transaction_timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .map_err(|_| RfidError::Timeout(limit))?,
                None => exchange.await,
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RfidError::Cancelled),
            result = bounded => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                // The reply (or the rest of a broken frame) may still arrive
                if matches!(
                    e,
                    RfidError::Timeout(_) | RfidError::Cancelled | RfidError::Framing { .. }
                ) {
                    self.request_resync().await;
                }
                return Err(e);
            }
        };

        debug!(
            "Received {:02X?} status {:?}: {}",
            response.opcode,
            response.status,
            bytes_to_hex(&response.data)
        );
        Ok(response)
    }

    async fn request_resync(&self) {
        if let Some(inbound) = self.inbound.lock().await.as_mut() {
            inbound.resync = true;
        }
    }

    // Bytes left over from an abandoned transaction would be paired with
    // the next command
    async fn discard_stale(&self) -> Result<(), RfidError> {
        let mut inbound = self.inbound.lock().await;
        let inbound = inbound.as_mut().ok_or(RfidError::NotConnected)?;
        if let Some(stale) = inbound.decoder.flush() {
            debug!("Dropping stale bytes: {}", bytes_to_hex(&stale));
        }
        if inbound.resync {
            let dropped = inbound.drain(self.config.resync_quiet).await?;
            if dropped > 0 {
                debug!("Drained {} late bytes", dropped);
            }
            inbound.resync = false;
        }
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), RfidError> {
        let mut outbound = self.outbound.lock().await;
        let sink = outbound.as_mut().ok_or(RfidError::NotConnected)?;
        sink.write_all(frame).await.map_err(transport_error)?;
        sink.flush().await.map_err(transport_error)?;
        trace!("Wrote {} bytes", frame.len());
        Ok(())
    }

    // Replies to other opcodes belong to abandoned transactions
    async fn receive(&self, command: &Command) -> Result<Response, RfidError> {
        let mut inbound = self.inbound.lock().await;
        let inbound = inbound.as_mut().ok_or(RfidError::NotConnected)?;
        loop {
            let response = inbound.next_response().await?;
            if response.opcode == command.opcode() {
                return Ok(response);
            }
            warn!(
                "Dropping {:02X?} response while waiting for {} ({:02X?})",
                response.opcode,
                command.name(),
                command.opcode()
            );
        }
    }

    /// Send `command` and fail unless the reader answers OK
    async fn write_expect_ok(&self, command: &Command) -> Result<Response, RfidError> {
        let response = self.write_frame(command).await?;
        if response.status == Status::Ok {
            Ok(response)
        } else {
            Err(RfidError::Communication {
                command: command.name(),
                status: response.status,
            })
        }
    }

    /// Set the reader's indicator LED
    pub async fn set_indicator(&self, color: IndicatorColor) -> Result<(), RfidError> {
        self.write_expect_ok(&Command::set_indicator(color))
            .await
            .map(|_| ())
    }

    pub async fn clear_indicator(&self) -> Result<(), RfidError> {
        self.set_indicator(IndicatorColor::None).await
    }

    /// Beep for roughly `duration / 255` seconds; 0 beeps continuously
    pub async fn beep(&self, duration: u32) -> Result<(), RfidError> {
        let command = Command::beep(duration)?;
        self.write_expect_ok(&command).await.map(|_| ())
    }

    // Indicator and beep are cosmetic; their failures are only logged
    async fn feedback(&self, color: IndicatorColor, beep: Option<u8>) {
        if let Err(e) = self.set_indicator(color).await {
            warn!("Failed to set indicator {:?}: {}", color, e);
        }
        if let Some(duration) = beep {
            if let Err(e) = self.write_expect_ok(&Command::Beep(duration)).await {
                warn!("Failed to beep: {}", e);
            }
        }
    }

    async fn success_feedback(&self, play_sound: bool) {
        let beep = play_sound.then_some(self.config.short_beep);
        self.feedback(IndicatorColor::Green, beep).await;
    }

    async fn failure_feedback(&self, play_sound: bool) {
        let beep = play_sound.then_some(self.config.long_beep);
        self.feedback(IndicatorColor::Red, beep).await;
    }

    /// Read the tag currently in the field
    ///
    /// Sets the indicator green (red when no tag is present) and optionally
    /// beeps.
    pub async fn read_tag(&self, play_sound: bool) -> Result<Tag, RfidError> {
        let command = Command::ReadTag;
        let response = self.write_frame(&command).await?;
        match response.status {
            Status::Ok => {
                let tag = Tag::try_from(response.data.as_ref())?;
                debug!("Read tag {}", tag);
                self.success_feedback(play_sound).await;
                Ok(tag)
            }
            Status::NoToken => {
                self.failure_feedback(play_sound).await;
                Err(RfidError::NoTag)
            }
            status => Err(RfidError::Communication {
                command: command.name(),
                status,
            }),
        }
    }

    /// Write `tag` and read it back to confirm
    ///
    /// The primary write opcode is tried first; if the tag read back differs
    /// the fallback opcode is tried. Fails with
    /// [`RfidError::WriteNotVerified`] if neither sticks.
    pub async fn write_tag(&self, tag: &Tag, play_sound: bool) -> Result<(), RfidError> {
        self.write_verified(tag, false, play_sound).await
    }

    /// Like [`write_tag`](Self::write_tag), but leaves the tag read-only
    pub async fn write_and_lock_tag(&self, tag: &Tag, play_sound: bool) -> Result<(), RfidError> {
        self.write_verified(tag, true, play_sound).await
    }

    async fn write_verified(
        &self,
        tag: &Tag,
        locked: bool,
        play_sound: bool,
    ) -> Result<(), RfidError> {
        let mut found = Tag::default();
        for variant in [WriteVariant::Primary, WriteVariant::Fallback] {
            let command = Command::write_tag(variant, *tag, locked);
            self.write_expect_ok(&command).await?;

            found = self.read_tag(false).await?;
            if found == *tag {
                info!("Wrote tag {} with {}", tag, command.name());
                self.success_feedback(play_sound).await;
                return Ok(());
            }
            warn!("{} left tag {} instead of {}", command.name(), found, tag);
        }

        self.failure_feedback(play_sound).await;
        Err(RfidError::WriteNotVerified {
            expected: *tag,
            found,
        })
    }

    /// Model string reported by the reader
    pub async fn get_model_info(&self) -> Result<String, RfidError> {
        let response = self.write_frame(&Command::ModelInfo).await?;
        Ok(String::from_utf8_lossy(&response.data).into_owned())
    }
}

fn transport_error(e: impl Debug) -> RfidError {
    RfidError::Transport(format!("{:?}", e))
}
