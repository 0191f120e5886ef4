//! Dock/UART client.
//!
//! A device sitting in its dock exposes a second control channel over UART.
//! Unlike the Bluetooth link there is no asynchronous traffic: every request
//! produces exactly one response or acknowledgement, so this client has no
//! background task and reads replies inline.
//!
//! Packets are framed with a start character, a command byte, a length byte
//! covering component/property/payload, and a trailing CRC-16 in the vendor's
//! CCITT variant. Packets of odd length are zero-padded before the CRC is
//! computed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::codec;
use crate::error::{DriverError, Result};
use crate::types::exg::{EXG_REGISTER_LEN, ExgRegister};
use crate::types::firmware::{FirmwareType, FirmwareVersion, HardwareVersion};

const START_CHAR: u8 = 0x24;

const CMD_SET: u8 = 0x01;
const CMD_RESPONSE: u8 = 0x02;
const CMD_GET: u8 = 0x03;
const CMD_ACK: u8 = 0xFF;

const CMD_BAD_COMMAND: u8 = 0xFC;
const CMD_BAD_ARGUMENT: u8 = 0xFD;
const CMD_BAD_CRC: u8 = 0xFE;

const COMP_MAIN: u8 = 0x01;
const COMP_DAUGHTER_CARD: u8 = 0x03;

const PROP_MAC: u8 = 0x02;
const PROP_VERSION: u8 = 0x03;
const PROP_RTC_CONFIG_TIME: u8 = 0x04;
const PROP_CURRENT_TIME: u8 = 0x05;
const PROP_INFOMEM: u8 = 0x06;
const PROP_CARD_ID: u8 = 0x02;

const CRC_INIT: u16 = 0xB0CA;

/// Infomem offset of the first ExG register block.
const INFOMEM_EXG_OFFSET: u16 = 0x0A;

/// CRC-16/CCITT over `data`, zero-padded to even length first.
fn crc16(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    let mut feed = |byte: u8| {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    };
    for &b in data {
        feed(b);
    }
    if data.len() % 2 != 0 {
        feed(0x00);
    }
    crc
}

/// Synchronous request/response client for the dock UART channel.
pub struct Dock<T> {
    stream: T,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Dock<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    /// Releases the underlying transport.
    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Reads the Bluetooth MAC address.
    pub async fn get_mac_address(&mut self) -> Result<[u8; 6]> {
        self.write_packet(CMD_GET, COMP_MAIN, PROP_MAC, &[]).await?;
        let data = self.read_response_verify(COMP_MAIN, PROP_MAC).await?;
        data.as_slice()
            .try_into()
            .map_err(|_| DriverError::protocol(format!("MAC response has {} bytes", data.len())))
    }

    /// Reads hardware revision, firmware family and firmware version.
    pub async fn get_firmware_version(
        &mut self,
    ) -> Result<(HardwareVersion, FirmwareType, FirmwareVersion)> {
        self.write_packet(CMD_GET, COMP_MAIN, PROP_VERSION, &[]).await?;
        let data = self.read_response_verify(COMP_MAIN, PROP_VERSION).await?;
        if data.len() != 7 {
            return Err(DriverError::protocol(format!(
                "version response has {} bytes, expected 7",
                data.len()
            )));
        }
        let hardware = HardwareVersion(data[0]);
        let fw_type = FirmwareType::from_wire(u16::from_le_bytes([data[1], data[2]]))?;
        let major = u16::from_le_bytes([data[3], data[4]]);
        let version = FirmwareVersion::new(major, data[5], data[6]);
        Ok((hardware, fw_type, version))
    }

    /// Reads the active firmware family.
    pub async fn get_firmware_type(&mut self) -> Result<FirmwareType> {
        let (_, fw_type, _) = self.get_firmware_version().await?;
        Ok(fw_type)
    }

    /// Sets the real-time clock from a UNIX timestamp in seconds.
    pub async fn set_rtc(&mut self, secs: f64) -> Result<()> {
        let ticks = codec::secs_to_ticks(secs);
        self.write_packet(CMD_SET, COMP_MAIN, PROP_RTC_CONFIG_TIME, &ticks.to_le_bytes()).await?;
        self.read_ack().await
    }

    /// Reads the current real-time clock as a UNIX timestamp in seconds.
    pub async fn get_rtc(&mut self) -> Result<f64> {
        self.write_packet(CMD_GET, COMP_MAIN, PROP_CURRENT_TIME, &[]).await?;
        let data = self.read_response_verify(COMP_MAIN, PROP_CURRENT_TIME).await?;
        Ok(codec::ticks_to_secs(read_u64_le(&data)?))
    }

    /// Reads the value the real-time clock was last set to.
    ///
    /// The current clock keeps running after a set; this returns the
    /// configured value itself.
    pub async fn get_config_rtc(&mut self) -> Result<f64> {
        self.write_packet(CMD_GET, COMP_MAIN, PROP_RTC_CONFIG_TIME, &[]).await?;
        let data = self.read_response_verify(COMP_MAIN, PROP_RTC_CONFIG_TIME).await?;
        Ok(codec::ticks_to_secs(read_u64_le(&data)?))
    }

    /// Reads `len` bytes of infomem starting at `addr`.
    pub async fn get_infomem(&mut self, addr: u16, len: u8) -> Result<Vec<u8>> {
        // Firmware quirk: an infomem read only works after a daughter-card
        // identifier request primed an internal firmware variable.
        let mut card_req = vec![0x00];
        card_req.extend_from_slice(&0u16.to_le_bytes());
        self.write_packet(CMD_GET, COMP_DAUGHTER_CARD, PROP_CARD_ID, &card_req).await?;
        let _ = self.read_response().await?;

        let mut req = vec![len];
        req.extend_from_slice(&addr.to_le_bytes());
        self.write_packet(CMD_GET, COMP_MAIN, PROP_INFOMEM, &req).await?;
        self.read_response_verify(COMP_MAIN, PROP_INFOMEM).await
    }

    /// Reads one ExG register block out of infomem (`chip` is 0 or 1).
    pub async fn get_exg_register(&mut self, chip: u8) -> Result<ExgRegister> {
        if chip > 1 {
            return Err(DriverError::protocol(format!("ExG chip index {chip} out of range")));
        }
        let offset = INFOMEM_EXG_OFFSET + chip as u16 * EXG_REGISTER_LEN as u16;
        let data = self.get_infomem(offset, EXG_REGISTER_LEN as u8).await?;
        ExgRegister::from_slice(&data)
    }

    async fn write_packet(&mut self, cmd: u8, comp: u8, prop: u8, data: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(5 + data.len() + 2);
        packet.push(START_CHAR);
        packet.push(cmd);
        packet.push(2 + data.len() as u8);
        packet.push(comp);
        packet.push(prop);
        packet.extend_from_slice(data);

        let crc = crc16(&packet, CRC_INIT);
        packet.extend_from_slice(&crc.to_le_bytes());

        trace!(cmd, comp, prop, len = packet.len(), "dock request");
        self.stream
            .write_all(&packet)
            .await
            .map_err(|err| DriverError::transport("dock write", err))?;
        self.stream.flush().await.map_err(|err| DriverError::transport("dock flush", err))
    }

    /// Reads the two-byte preamble and maps firmware error replies.
    async fn read_preamble(&mut self, expected: u8, crc_buf: &mut Vec<u8>) -> Result<()> {
        let start = self.read_byte(crc_buf).await?;
        if start != START_CHAR {
            return Err(DriverError::protocol(format!("unexpected start character {start:#04x}")));
        }

        let cmd = self.read_byte(crc_buf).await?;
        match cmd {
            CMD_BAD_ARGUMENT => Err(DriverError::protocol("dock rejected argument")),
            CMD_BAD_COMMAND => Err(DriverError::protocol("dock rejected unknown command")),
            CMD_BAD_CRC => Err(DriverError::protocol("dock reported CRC failure")),
            cmd if cmd == expected => Ok(()),
            cmd => {
                Err(DriverError::protocol(format!("unexpected dock response type {cmd:#04x}")))
            }
        }
    }

    async fn read_response(&mut self) -> Result<(u8, u8, Vec<u8>)> {
        let mut crc_buf = Vec::new();
        self.read_preamble(CMD_RESPONSE, &mut crc_buf).await?;

        let len = self.read_byte(&mut crc_buf).await?;
        let comp = self.read_byte(&mut crc_buf).await?;
        let prop = self.read_byte(&mut crc_buf).await?;
        if len < 2 {
            return Err(DriverError::protocol(format!("dock packet length {len} too small")));
        }

        let mut data = vec![0u8; len as usize - 2];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(|err| DriverError::transport("dock read", err))?;
        crc_buf.extend_from_slice(&data);

        self.verify_crc(&crc_buf).await?;
        debug!(comp, prop, len = data.len(), "dock response");
        Ok((comp, prop, data))
    }

    async fn read_response_verify(&mut self, exp_comp: u8, exp_prop: u8) -> Result<Vec<u8>> {
        let (comp, prop, data) = self.read_response().await?;
        if comp != exp_comp || prop != exp_prop {
            return Err(DriverError::protocol(format!(
                "dock response for component {comp:#04x} property {prop:#04x}, \
                 expected {exp_comp:#04x}/{exp_prop:#04x}"
            )));
        }
        Ok(data)
    }

    async fn read_ack(&mut self) -> Result<()> {
        let mut crc_buf = Vec::new();
        self.read_preamble(CMD_ACK, &mut crc_buf).await?;
        self.verify_crc(&crc_buf).await
    }

    async fn read_byte(&mut self, crc_buf: &mut Vec<u8>) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.stream
            .read_exact(&mut byte)
            .await
            .map_err(|err| DriverError::transport("dock read", err))?;
        crc_buf.push(byte[0]);
        Ok(byte[0])
    }

    async fn verify_crc(&mut self, covered: &[u8]) -> Result<()> {
        let mut wire = [0u8; 2];
        self.stream
            .read_exact(&mut wire)
            .await
            .map_err(|err| DriverError::transport("dock read", err))?;
        let expected = crc16(covered, CRC_INIT);
        if wire != expected.to_le_bytes() {
            return Err(DriverError::protocol("dock response failed CRC check"));
        }
        Ok(())
    }
}

fn read_u64_le(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| DriverError::protocol(format!("expected 8 bytes, got {}", data.len())))?;
    Ok(u64::from_le_bytes(bytes))
}
