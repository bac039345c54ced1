use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte-stream link to the reader (serial port, USB bridge, etc.)
///
/// `open` yields the inbound source and outbound sink halves. The session
/// owns both until it disconnects, then drops them before calling `close`.
pub trait ByteChannel: Send {
    type Source: AsyncRead + Unpin + Send + 'static;
    type Sink: AsyncWrite + Unpin + Send + 'static;
    type Error: std::fmt::Debug;

    /// Open the link at `baud_rate`; may wait until the device is ready
    fn open(
        &mut self,
        baud_rate: u32,
    ) -> impl Future<Output = Result<(Self::Source, Self::Sink), Self::Error>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
