//! Streaming session engine for the Bluetooth link.
//!
//! A [`Session`] owns the write half of the transport and a spawned read-loop
//! task that owns the read half. The read loop is the only consumer of
//! inbound bytes: it frames them, correlates acknowledgements and responses
//! with the single in-flight command, fans decoded data samples out to
//! subscribers, and surfaces unsolicited status notifications.
//!
//! The protocol has no correlation identifiers, so at most one command may be
//! outstanding at any time. A second concurrent command is rejected with
//! [`DriverError::Busy`] instead of being queued.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::error::{DriverError, Result};
use crate::frame::{CommandFrame, Deframer, Frame, FrameContext, opcode};
use crate::types::calibration::AllCalibration;
use crate::types::channel::{ChannelType, SensorGroup, serialize_sensors};
use crate::types::exg::{EXG_REGISTER_LEN, ExgRegister};
use crate::types::firmware::{
    FirmwareCapabilities, FirmwareType, FirmwareVersion, HardwareVersion,
};
use crate::types::packet::{DataPacket, record_len};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Idle,
    Streaming,
    ShuttingDown,
    Closed,
}

/// Tuning knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for an acknowledgement or response.
    pub command_timeout: Duration,
    /// Disable the unsolicited ack byte before status notifications during
    /// the handshake, on firmware that supports it.
    pub suppress_status_ack: bool,
    /// Buffered samples per subscriber before lagging kicks in.
    pub data_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            suppress_status_ack: true,
            data_channel_capacity: 256,
        }
    }
}

/// Decoded device status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub docked: bool,
    pub sensing: bool,
    pub rtc_set: bool,
    pub logging: bool,
    pub streaming: bool,
    pub sd_present: bool,
    pub sd_error: bool,
    pub red_led: bool,
}

impl DeviceStatus {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            docked: bits & 0x01 != 0,
            sensing: bits & 0x02 != 0,
            rtc_set: bits & 0x04 != 0,
            logging: bits & 0x08 != 0,
            streaming: bits & 0x10 != 0,
            sd_present: bits & 0x20 != 0,
            sd_error: bits & 0x40 != 0,
            red_led: bits & 0x80 != 0,
        }
    }
}

/// Battery measurement with the vendor's 12-bit ADC calibration applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryState {
    pub voltage: f64,
}

// Discharge curve from the vendor manual, voltage to percent.
const BATTERY_CURVE: [(f64, f64); 26] = [
    (3.2, 0.0),
    (3.627, 5.9),
    (3.645, 9.8),
    (3.663, 13.8),
    (3.681, 17.7),
    (3.699, 21.6),
    (3.717, 25.6),
    (3.7314, 29.5),
    (3.735, 33.4),
    (3.7386, 37.4),
    (3.7566, 41.3),
    (3.771, 45.2),
    (3.789, 49.2),
    (3.8034, 53.1),
    (3.8106, 57.0),
    (3.8394, 61.0),
    (3.861, 64.9),
    (3.8826, 68.9),
    (3.9078, 72.8),
    (3.933, 76.7),
    (3.969, 80.7),
    (4.0086, 84.6),
    (4.041, 88.5),
    (4.0734, 92.5),
    (4.113, 96.4),
    (4.167, 100.0),
];

impl BatteryState {
    fn from_adc(raw: u16) -> Self {
        // 12-bit ADC against a 3.0 V reference, times the divider ratio
        let voltage = raw as f64 * (3.0 / 4095.0) * 1.988;
        Self { voltage }
    }

    /// Approximate charge level from the vendor discharge curve, clamped to
    /// 0..=100.
    pub fn percent(&self) -> f64 {
        let v = self.voltage;
        let (first, last) = (BATTERY_CURVE[0], BATTERY_CURVE[BATTERY_CURVE.len() - 1]);
        if v <= first.0 {
            return first.1;
        }
        if v >= last.0 {
            return last.1;
        }
        for pair in BATTERY_CURVE.windows(2) {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            if v <= x1 {
                return y0 + (v - x0) / (x1 - x0) * (y1 - y0);
            }
        }
        last.1
    }
}

/// Active channel configuration returned by the inquiry command.
#[derive(Debug, Clone, PartialEq)]
pub struct InquiryResponse {
    pub sampling_rate: f64,
    pub buffer_size: u8,
    /// Streamed channels in record order, timestamp excluded.
    pub channels: Vec<ChannelType>,
}

/// The single in-flight command slot.
struct PendingCommand {
    ack: Option<oneshot::Sender<Result<()>>>,
    response: Option<(u8, oneshot::Sender<Result<Vec<u8>>>)>,
}

impl PendingCommand {
    fn is_settled(&self) -> bool {
        self.ack.is_none() && self.response.is_none()
    }

    fn fail(&mut self, mk: impl Fn() -> DriverError) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(Err(mk()));
        }
        if let Some((_, tx)) = self.response.take() {
            let _ = tx.send(Err(mk()));
        }
    }
}

struct Shared {
    pending: Mutex<Option<PendingCommand>>,
    state: Mutex<SessionState>,
    /// Full record layout while streaming, timestamp first.
    layout: Mutex<Option<Arc<Vec<ChannelType>>>>,
    data_tx: broadcast::Sender<DataPacket>,
    status_tx: broadcast::Sender<DeviceStatus>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let mut guard = lock(&self.state);
        trace!(from = ?*guard, to = ?state, "session state");
        *guard = state;
    }

    fn fail_pending(&self, mk: impl Fn() -> DriverError) {
        let mut guard = lock(&self.pending);
        if let Some(pending) = guard.as_mut() {
            pending.fail(mk);
        }
        *guard = None;
    }
}

/// Poisoned state locks are unrecoverable programming errors; propagating
/// them through every signature buys nothing, so we unwrap the inner value.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An initialized Bluetooth session to one device.
pub struct Session {
    writer: AsyncMutex<BoxedWriter>,
    shared: Arc<Shared>,
    config: SessionConfig,
    capabilities: Mutex<Option<FirmwareCapabilities>>,
    hardware: Mutex<Option<HardwareVersion>>,
    cancel: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Alias for the byte stream the session runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

impl Session {
    /// Wraps a connected transport and spawns the read loop.
    ///
    /// The session starts in [`SessionState::Disconnected`]; call
    /// [`Session::initialize`] before issuing commands.
    pub fn connect<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        let (data_tx, _) = broadcast::channel(config.data_channel_capacity);
        let (status_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            state: Mutex::new(SessionState::Disconnected),
            layout: Mutex::new(None),
            data_tx,
            status_tx,
        });

        let cancel = CancellationToken::new();
        let task_shared = Arc::clone(&shared);
        let task_cancel = cancel.clone();
        let read_task =
            tokio::spawn(async move { read_loop(reader, task_shared, task_cancel).await });

        Self {
            writer: AsyncMutex::new(writer),
            shared,
            config,
            capabilities: Mutex::new(None),
            hardware: Mutex::new(None),
            cancel,
            read_task: Mutex::new(Some(read_task)),
        }
    }

    /// Performs the connection handshake.
    ///
    /// Probes the firmware and hardware versions, derives the firmware
    /// capabilities, and suppresses the status-ack byte on capable firmware
    /// when configured to. Any failure surfaces as a handshake error.
    pub async fn initialize(&self) -> Result<FirmwareCapabilities> {
        self.shared.set_state(SessionState::Handshaking);

        let caps = match self.handshake().await {
            Ok(caps) => caps,
            Err(err) => {
                self.shared.set_state(SessionState::Disconnected);
                return Err(DriverError::handshake_with_source(
                    "device version probe failed",
                    Box::new(err),
                ));
            }
        };

        info!(fw_type = ?caps.fw_type, version = %caps.version, "handshake complete");
        self.shared.set_state(SessionState::Idle);
        Ok(caps)
    }

    async fn handshake(&self) -> Result<FirmwareCapabilities> {
        let (fw_type, version) = self.get_firmware_version().await?;
        let caps = FirmwareCapabilities::new(fw_type, version);
        *lock(&self.capabilities) = Some(caps);

        let hardware = self.get_hardware_version().await?;
        *lock(&self.hardware) = Some(hardware);

        if caps.supports_status_ack_disable() && self.config.suppress_status_ack {
            debug!("disabling status acknowledgement byte");
            self.set_status_ack(false).await?;
        }
        Ok(caps)
    }

    /// Capabilities derived during [`Session::initialize`].
    pub fn capabilities(&self) -> Option<FirmwareCapabilities> {
        *lock(&self.capabilities)
    }

    /// Hardware revision read during [`Session::initialize`].
    pub fn hardware_version(&self) -> Option<HardwareVersion> {
        *lock(&self.hardware)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Subscribes to decoded data samples.
    ///
    /// Every subscriber sees samples in arrival order. A subscriber that
    /// falls more than the configured capacity behind observes a lag error
    /// on its receiver, never backpressure on the device link.
    pub fn subscribe(&self) -> broadcast::Receiver<DataPacket> {
        self.shared.data_tx.subscribe()
    }

    /// Subscribes to unsolicited status notifications.
    pub fn subscribe_status(&self) -> broadcast::Receiver<DeviceStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Data samples as an async `Stream`, for combinator pipelines. Lag
    /// surfaces as an error item, the stream itself stays alive.
    pub fn sample_stream(&self) -> BroadcastStream<DataPacket> {
        BroadcastStream::new(self.subscribe())
    }

    /// Status notifications as an async `Stream`.
    pub fn status_stream(&self) -> BroadcastStream<DeviceStatus> {
        BroadcastStream::new(self.subscribe_status())
    }

    /// Stops the read loop and closes the session. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let task = lock(&self.read_task).take();
        let Some(task) = task else {
            return Ok(());
        };

        self.shared.set_state(SessionState::ShuttingDown);
        self.cancel.cancel();
        if let Err(err) = task.await {
            warn!(error = %err, "read loop join failed");
        }
        self.shared.fail_pending(|| DriverError::Disconnected);
        self.shared.set_state(SessionState::Closed);
        info!("session closed");
        Ok(())
    }

    // --- command surface ---

    /// Reads the user-assigned device name.
    pub async fn get_device_name(&self) -> Result<String> {
        let payload = self
            .request(CommandFrame::new(opcode::GET_DEVICE_NAME), opcode::DEVICE_NAME_RESPONSE)
            .await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    pub async fn set_device_name(&self, name: &str) -> Result<()> {
        self.execute(CommandFrame::with_payload(opcode::SET_DEVICE_NAME, varlen(name.as_bytes())?))
            .await
    }

    /// Reads the experiment identifier stored on the device.
    pub async fn get_experiment_id(&self) -> Result<String> {
        let payload = self
            .request(CommandFrame::new(opcode::GET_EXPERIMENT_ID), opcode::EXPERIMENT_ID_RESPONSE)
            .await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    pub async fn set_experiment_id(&self, id: &str) -> Result<()> {
        self.execute(CommandFrame::with_payload(opcode::SET_EXPERIMENT_ID, varlen(id.as_bytes())?))
            .await
    }

    /// Reads the sampling rate in Hz.
    pub async fn get_sampling_rate(&self) -> Result<f64> {
        let payload = self
            .request(CommandFrame::new(opcode::GET_SAMPLING_RATE), opcode::SAMPLING_RATE_RESPONSE)
            .await?;
        let divider = read_u16_le(&payload, 0)?;
        Ok(codec::divider_to_rate(divider))
    }

    /// Sets the sampling rate to the closest representable value.
    pub async fn set_sampling_rate(&self, rate: f64) -> Result<()> {
        let divider = codec::rate_to_divider(rate)?;
        self.execute(CommandFrame::with_payload(
            opcode::SET_SAMPLING_RATE,
            divider.to_le_bytes().to_vec(),
        ))
        .await
    }

    /// Reads the battery voltage.
    pub async fn get_battery(&self) -> Result<BatteryState> {
        let payload =
            self.request(CommandFrame::new(opcode::GET_BATTERY), opcode::BATTERY_RESPONSE).await?;
        let raw = read_u16_le(&payload, 0)?;
        Ok(BatteryState::from_adc(raw))
    }

    /// Reads the current device status byte.
    pub async fn get_status(&self) -> Result<DeviceStatus> {
        let payload =
            self.request(CommandFrame::new(opcode::GET_STATUS), opcode::STATUS_RESPONSE).await?;
        let bits = *payload
            .first()
            .ok_or_else(|| DriverError::protocol("empty status response"))?;
        Ok(DeviceStatus::from_bits(bits))
    }

    /// Reads firmware family and version.
    pub async fn get_firmware_version(&self) -> Result<(FirmwareType, FirmwareVersion)> {
        let payload = self
            .request(CommandFrame::new(opcode::GET_FW_VERSION), opcode::FW_VERSION_RESPONSE)
            .await?;
        let fw_type = FirmwareType::from_wire(read_u16_le(&payload, 0)?)?;
        let major = read_u16_le(&payload, 2)?;
        let minor = read_u8(&payload, 4)?;
        let patch = read_u8(&payload, 5)?;
        Ok((fw_type, FirmwareVersion::new(major, minor, patch)))
    }

    /// Reads the hardware board revision.
    pub async fn get_hardware_version(&self) -> Result<HardwareVersion> {
        let payload = self
            .request(
                CommandFrame::new(opcode::GET_HARDWARE_VERSION),
                opcode::HARDWARE_VERSION_RESPONSE,
            )
            .await?;
        Ok(HardwareVersion(read_u8(&payload, 0)?))
    }

    /// Reads one ExG front-end register block (`chip` is 0 or 1).
    pub async fn get_exg_register(&self, chip: u8) -> Result<ExgRegister> {
        let payload = self
            .request(
                CommandFrame::with_payload(
                    opcode::GET_EXG_REGS,
                    vec![chip, 0x00, EXG_REGISTER_LEN as u8],
                ),
                opcode::EXG_REGS_RESPONSE,
            )
            .await?;
        ExgRegister::from_slice(&payload)
    }

    /// Writes `data` into one ExG register block starting at `offset`.
    pub async fn set_exg_register(&self, chip: u8, offset: u8, data: &[u8]) -> Result<()> {
        let mut payload = vec![chip, offset, data.len() as u8];
        payload.extend_from_slice(data);
        self.execute(CommandFrame::with_payload(opcode::SET_EXG_REGS, payload)).await
    }

    /// Reads the factory calibration of all inertial sensors.
    pub async fn get_all_calibration(&self) -> Result<AllCalibration> {
        let payload = self
            .request(
                CommandFrame::new(opcode::GET_ALL_CALIBRATION),
                opcode::ALL_CALIBRATION_RESPONSE,
            )
            .await?;
        AllCalibration::from_slice(&payload)
    }

    /// Selects the active sensors.
    pub async fn set_sensors(&self, sensors: &[SensorGroup]) -> Result<()> {
        let bitfield = serialize_sensors(sensors);
        self.execute(CommandFrame::with_payload(opcode::SET_SENSORS, bitfield.to_vec())).await
    }

    /// Reads the real-time clock in seconds since the epoch.
    pub async fn get_rtc(&self) -> Result<f64> {
        let payload = self.request(CommandFrame::new(opcode::GET_RTC), opcode::RTC_RESPONSE).await?;
        let ticks = read_u64_le(&payload, 0)?;
        Ok(codec::ticks_to_secs(ticks))
    }

    /// Sets the real-time clock from seconds since the epoch.
    pub async fn set_rtc(&self, secs: f64) -> Result<()> {
        let ticks = codec::secs_to_ticks(secs);
        self.execute(CommandFrame::with_payload(opcode::SET_RTC, ticks.to_le_bytes().to_vec()))
            .await
    }

    /// Reads the configuration timestamp from the device config file.
    pub async fn get_config_time(&self) -> Result<u64> {
        let payload = self
            .request(CommandFrame::new(opcode::GET_CONFIG_TIME), opcode::CONFIG_TIME_RESPONSE)
            .await?;
        let text = String::from_utf8_lossy(&payload);
        text.parse::<u64>()
            .map_err(|_| DriverError::protocol(format!("non-numeric config time {text:?}")))
    }

    /// Stores a configuration timestamp in the device config file.
    pub async fn set_config_time(&self, time: u64) -> Result<()> {
        self.execute(CommandFrame::with_payload(
            opcode::SET_CONFIG_TIME,
            varlen(time.to_string().as_bytes())?,
        ))
        .await
    }

    /// Queries the active channel configuration.
    pub async fn inquiry(&self) -> Result<InquiryResponse> {
        let payload =
            self.request(CommandFrame::new(opcode::INQUIRY), opcode::INQUIRY_RESPONSE).await?;
        parse_inquiry(&payload)
    }

    /// Starts live streaming.
    ///
    /// Runs the inquiry first to pin the sample record layout, then issues
    /// the start command. Samples arrive on [`Session::subscribe`] receivers.
    pub async fn start_streaming(&self) -> Result<()> {
        let inquiry = self.inquiry().await?;

        let mut layout = Vec::with_capacity(1 + inquiry.channels.len());
        layout.push(ChannelType::Timestamp);
        layout.extend_from_slice(&inquiry.channels);
        record_len(&layout)?;
        *lock(&self.shared.layout) = Some(Arc::new(layout));

        self.execute(CommandFrame::new(opcode::START_STREAMING)).await?;
        self.shared.set_state(SessionState::Streaming);
        Ok(())
    }

    /// Stops live streaming.
    pub async fn stop_streaming(&self) -> Result<()> {
        self.execute(CommandFrame::new(opcode::STOP_STREAMING)).await?;
        *lock(&self.shared.layout) = None;
        self.shared.set_state(SessionState::Idle);
        Ok(())
    }

    /// Starts logging to the SD card.
    pub async fn start_logging(&self) -> Result<()> {
        self.execute(CommandFrame::new(opcode::START_LOGGING)).await
    }

    /// Stops logging to the SD card.
    pub async fn stop_logging(&self) -> Result<()> {
        self.execute(CommandFrame::new(opcode::STOP_LOGGING)).await
    }

    /// No-op command to verify the link is alive.
    pub async fn ping(&self) -> Result<()> {
        self.execute(CommandFrame::new(opcode::PING)).await
    }

    /// Enables or disables the ack byte preceding status notifications.
    pub async fn set_status_ack(&self, enabled: bool) -> Result<()> {
        self.execute(CommandFrame::with_payload(opcode::SET_STATUS_ACK, vec![enabled as u8]))
            .await
    }

    // --- command plumbing ---

    /// Sends a command that is only acknowledged.
    async fn execute(&self, command: CommandFrame) -> Result<()> {
        let ack_rx = self.install_pending(None)?;
        self.write_command(&command).await?;
        self.await_with_timeout(ack_rx).await?
    }

    /// Sends a command and waits for ack plus the typed response.
    async fn request(&self, command: CommandFrame, response_opcode: u8) -> Result<Vec<u8>> {
        let (ack_rx, resp_rx) = {
            let mut pending = lock(&self.shared.pending);
            if pending.is_some() {
                return Err(DriverError::Busy);
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            let (resp_tx, resp_rx) = oneshot::channel();
            *pending = Some(PendingCommand {
                ack: Some(ack_tx),
                response: Some((response_opcode, resp_tx)),
            });
            (ack_rx, resp_rx)
        };

        self.write_command(&command).await?;
        self.await_with_timeout(ack_rx).await??;
        self.await_with_timeout(resp_rx).await?
    }

    fn install_pending(&self, response: Option<(u8, oneshot::Sender<Result<Vec<u8>>>)>) -> Result<oneshot::Receiver<Result<()>>> {
        let mut pending = lock(&self.shared.pending);
        if pending.is_some() {
            return Err(DriverError::Busy);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        *pending = Some(PendingCommand { ack: Some(ack_tx), response });
        Ok(ack_rx)
    }

    async fn write_command(&self, command: &CommandFrame) -> Result<()> {
        let bytes = command.to_bytes();
        trace!(opcode = command.opcode, len = bytes.len(), "sending command");
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.write_all(&bytes).await {
            self.clear_pending();
            self.shared.set_state(SessionState::Closed);
            return Err(DriverError::transport("command write", err));
        }
        if let Err(err) = writer.flush().await {
            self.clear_pending();
            return Err(DriverError::transport("command flush", err));
        }
        Ok(())
    }

    async fn await_with_timeout<R>(&self, rx: oneshot::Receiver<R>) -> Result<R> {
        match timeout(self.config.command_timeout, rx).await {
            Ok(Ok(inner)) => Ok(inner),
            Ok(Err(_)) => {
                self.clear_pending();
                Err(DriverError::Disconnected)
            }
            Err(_) => {
                self.clear_pending();
                Err(DriverError::Timeout { duration: self.config.command_timeout })
            }
        }
    }

    fn clear_pending(&self) {
        *lock(&self.shared.pending) = None;
    }
}

fn varlen(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > u8::MAX as usize {
        return Err(DriverError::range(data.len() as i64, 1, false));
    }
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    Ok(out)
}

fn read_u8(payload: &[u8], offset: usize) -> Result<u8> {
    payload
        .get(offset)
        .copied()
        .ok_or_else(|| DriverError::protocol(format!("response too short for byte at {offset}")))
}

fn read_u16_le(payload: &[u8], offset: usize) -> Result<u16> {
    let bytes = payload
        .get(offset..offset + 2)
        .ok_or_else(|| DriverError::protocol(format!("response too short for u16 at {offset}")))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u64_le(payload: &[u8], offset: usize) -> Result<u64> {
    let bytes = payload
        .get(offset..offset + 8)
        .ok_or_else(|| DriverError::protocol(format!("response too short for u64 at {offset}")))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

fn parse_inquiry(payload: &[u8]) -> Result<InquiryResponse> {
    if payload.len() < 8 {
        return Err(DriverError::protocol(format!(
            "inquiry response too short: {} bytes",
            payload.len()
        )));
    }
    let divider = read_u16_le(payload, 0)?;
    let channel_count = payload[6] as usize;
    let buffer_size = payload[7];

    let ids = payload.get(8..8 + channel_count).ok_or_else(|| {
        DriverError::protocol(format!(
            "inquiry response truncated: {channel_count} channels declared, {} bytes present",
            payload.len() - 8
        ))
    })?;
    let channels =
        ids.iter().map(|id| ChannelType::from_wire_id(*id)).collect::<Result<Vec<_>>>()?;

    Ok(InquiryResponse { sampling_rate: codec::divider_to_rate(divider), buffer_size, channels })
}

/// Reads transport bytes, frames them and dispatches frames until cancelled
/// or the link drops.
async fn read_loop(mut reader: BoxedReader, shared: Arc<Shared>, cancel: CancellationToken) {
    info!("read loop started");
    let mut deframer = Deframer::new();
    let mut chunk = [0u8; 1024];
    let mut sample_count = 0u64;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("read loop cancelled");
                break;
            }
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                info!("transport closed by peer");
                shared.fail_pending(|| DriverError::Disconnected);
                shared.set_state(SessionState::Closed);
                break;
            }
            Ok(n) => {
                deframer.push_bytes(&chunk[..n]);
                if let Err(err) = drain_frames(&mut deframer, &shared, &mut sample_count) {
                    // Resynchronization gave up. Fail the in-flight caller
                    // and start over from an empty buffer; the link itself
                    // is still usable.
                    warn!(error = %err, "framing failed, clearing buffer");
                    shared.fail_pending(|| DriverError::protocol("response lost in desynchronized stream"));
                    deframer.clear();
                }
            }
            Err(err) => {
                warn!(error = %err, "transport read failed");
                shared.fail_pending(|| DriverError::Disconnected);
                shared.set_state(SessionState::Closed);
                break;
            }
        }
    }

    info!(samples = sample_count, "read loop ended");
}

fn drain_frames(deframer: &mut Deframer, shared: &Shared, sample_count: &mut u64) -> Result<()> {
    loop {
        let layout = lock(&shared.layout).clone();
        let ctx = FrameContext {
            sample_len: match layout.as_deref() {
                Some(layout) => Some(record_len(layout)?),
                None => None,
            },
        };

        let Some(frame) = deframer.next_frame(&ctx)? else {
            return Ok(());
        };

        match frame {
            Frame::Ack => {
                let mut guard = lock(&shared.pending);
                match guard.as_mut() {
                    Some(pending) => {
                        if let Some(tx) = pending.ack.take() {
                            let _ = tx.send(Ok(()));
                        }
                        if pending.is_settled() {
                            *guard = None;
                        }
                    }
                    // Firmware that still prefixes status notifications
                    // with an ack byte lands here
                    None => trace!("unsolicited ack discarded"),
                }
            }
            Frame::CommandResponse { opcode: resp_opcode, payload } => {
                let delivered = {
                    let mut guard = lock(&shared.pending);
                    match guard.as_mut() {
                        Some(pending)
                            if pending.response.as_ref().is_some_and(|(op, _)| *op == resp_opcode) =>
                        {
                            if let Some((_, tx)) = pending.response.take() {
                                let _ = tx.send(Ok(payload.clone()));
                            }
                            if pending.is_settled() {
                                *guard = None;
                            }
                            true
                        }
                        _ => false,
                    }
                };

                if !delivered {
                    if resp_opcode == opcode::STATUS_RESPONSE {
                        if let Some(bits) = payload.first() {
                            let status = DeviceStatus::from_bits(*bits);
                            debug!(?status, "status notification");
                            let _ = shared.status_tx.send(status);
                        }
                    } else {
                        debug!(
                            opcode = resp_opcode,
                            len = payload.len(),
                            "unmatched response discarded"
                        );
                    }
                }
            }
            Frame::DataSample(raw) => {
                let Some(layout) = layout else {
                    trace!("sample outside streaming state discarded");
                    continue;
                };
                match DataPacket::decode(&raw, &layout) {
                    Ok(packet) => {
                        *sample_count += 1;
                        // No receivers is fine, samples are simply dropped
                        let _ = shared.data_tx.send(packet);
                    }
                    Err(err) => warn!(error = %err, "sample decode failed"),
                }
            }
        }
    }
}
