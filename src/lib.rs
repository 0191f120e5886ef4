//! Async host-side driver for Shimmer3 wearable sensor units.
//!
//! Wearlink talks to a device over any byte transport and exposes its three
//! host-facing surfaces:
//!
//! - **Live streaming**: the Bluetooth serial protocol with a background
//!   read loop, command/response correlation and broadcast sample fan-out
//! - **Dock access**: the synchronous docked UART protocol with CRC-guarded
//!   request/response exchanges
//! - **Recordings**: offline decoding of trial files written to the SD card,
//!   including multi-device clock alignment
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use wearlink::{SensorGroup, Wearlink};
//!
//! #[tokio::main]
//! async fn main() -> wearlink::Result<()> {
//!     # let transport = tokio::io::duplex(64).0;
//!     let session = Wearlink::connect(transport).await?;
//!     session.set_sensors(&[SensorGroup::AccelLn, SensorGroup::Gyro]).await?;
//!
//!     let mut samples = session.sample_stream();
//!     session.start_streaming().await?;
//!     while let Some(Ok(packet)) = samples.next().await {
//!         println!("{packet:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod dock;
mod error;
pub mod frame;
pub mod recording;
pub mod session;
#[cfg(test)]
pub mod test_utils;
pub mod types;

pub use error::{DriverError, Result};

pub use dock::Dock;
pub use frame::{CommandFrame, Deframer, Frame};
pub use recording::{Recording, RecordingHeader, SyncAnchor};
pub use session::{
    BatteryState, DeviceStatus, InquiryResponse, Session, SessionConfig, SessionState, Transport,
};
pub use types::*;

use std::path::Path;

/// Unified entry point for device connections and recording files.
pub struct Wearlink;

impl Wearlink {
    /// Connects over `transport` and performs the handshake.
    ///
    /// The transport is any connected byte stream, typically a Bluetooth
    /// serial port. The returned session is initialized and ready for
    /// commands.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use wearlink::Wearlink;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> wearlink::Result<()> {
    /// # let transport = tokio::io::duplex(64).0;
    /// let session = Wearlink::connect(transport).await?;
    /// if let Some(caps) = session.capabilities() {
    ///     println!("firmware: {}", caps.version);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect<T: Transport>(transport: T) -> Result<Session> {
        let session = Session::connect(transport, SessionConfig::default());
        session.initialize().await?;
        Ok(session)
    }

    /// Wraps a serial stream to a docked device.
    ///
    /// Dock exchanges are strictly request/response, so no task is spawned
    /// and no handshake runs.
    pub fn dock<T>(stream: T) -> Dock<T>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        Dock::new(stream)
    }

    /// Opens and fully decodes a recording file.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Recording> {
        Recording::open(path).await
    }
}
