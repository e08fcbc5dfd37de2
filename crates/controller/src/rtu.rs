//! Serial Modbus RTU master built on `tokio-serial` and `tokio-modbus`.

use async_trait::async_trait;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::bus::{ModbusBus, TransportError};
use crate::config::{SerialConfig, SerialParity};

/// One Modbus request, kept around so it can be repeated on retry.
#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    ReadCoils(u16, u16),
    ReadDiscreteInputs(u16, u16),
    ReadHoldingRegisters(u16, u16),
    ReadInputRegisters(u16, u16),
    WriteSingleCoil(u16, bool),
    WriteMultipleRegisters(u16, &'a [u16]),
}

enum Response {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Written,
}

pub struct RtuClient {
    settings: SerialConfig,
    ctx: Option<Context>,
}

impl RtuClient {
    pub fn new(settings: SerialConfig) -> Self {
        Self {
            settings,
            ctx: None,
        }
    }

    /// Open the serial port.  Failing here is fatal for the caller.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let s = &self.settings;
        let builder = tokio_serial::new(s.port.as_str(), s.baud_rate)
            .parity(map_parity(s.parity))
            .data_bits(map_data_bits(s.data_bits)?)
            .stop_bits(map_stop_bits(s.stop_bits)?)
            .timeout(s.timeout());

        let port = SerialStream::open(&builder).map_err(|e| TransportError::Io(e.into()))?;
        self.ctx = Some(rtu::attach_slave(port, Slave(1)));

        info!(
            port = %s.port,
            baud = s.baud_rate,
            parity = ?s.parity,
            retries = s.retries,
            "serial link open"
        );
        Ok(())
    }

    async fn call(&mut self, slave: u8, req: Request<'_>) -> Result<Response, TransportError> {
        let timeout = self.settings.timeout();
        let attempts = self.settings.retries + 1;
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(slave));

        let mut last = TransportError::NotConnected;
        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(timeout, dispatch(ctx, req)).await {
                Err(_) => Err(TransportError::Timeout(timeout)),
                Ok(Err(tokio_modbus::Error::Transport(e))) => Err(TransportError::Io(e)),
                Ok(Err(e)) => Err(TransportError::Protocol(e.to_string())),
                Ok(Ok(Err(code))) => Err(TransportError::Exception(code)),
                Ok(Ok(Ok(resp))) => Ok(resp),
            };

            match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(slave, attempt, ?req, "modbus request failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

async fn dispatch(ctx: &mut Context, req: Request<'_>) -> tokio_modbus::Result<Response> {
    Ok(match req {
        Request::ReadCoils(addr, cnt) => ctx.read_coils(addr, cnt).await?.map(Response::Bits),
        Request::ReadDiscreteInputs(addr, cnt) => {
            ctx.read_discrete_inputs(addr, cnt).await?.map(Response::Bits)
        }
        Request::ReadHoldingRegisters(addr, cnt) => {
            ctx.read_holding_registers(addr, cnt).await?.map(Response::Words)
        }
        Request::ReadInputRegisters(addr, cnt) => {
            ctx.read_input_registers(addr, cnt).await?.map(Response::Words)
        }
        Request::WriteSingleCoil(addr, value) => {
            ctx.write_single_coil(addr, value).await?.map(|()| Response::Written)
        }
        Request::WriteMultipleRegisters(addr, words) => {
            ctx.write_multiple_registers(addr, words).await?.map(|()| Response::Written)
        }
    })
}

fn bits(resp: Response) -> Result<Vec<bool>, TransportError> {
    match resp {
        Response::Bits(b) => Ok(b),
        _ => Err(TransportError::Protocol("expected bit response".into())),
    }
}

fn words(resp: Response) -> Result<Vec<u16>, TransportError> {
    match resp {
        Response::Words(w) => Ok(w),
        _ => Err(TransportError::Protocol("expected register response".into())),
    }
}

#[async_trait]
impl ModbusBus for RtuClient {
    async fn read_coils(&mut self, slave: u8, offset: u16, count: u16)
        -> Result<Vec<bool>, TransportError> {
        bits(self.call(slave, Request::ReadCoils(offset, count)).await?)
    }

    async fn read_discrete_inputs(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        bits(self.call(slave, Request::ReadDiscreteInputs(offset, count)).await?)
    }

    async fn read_holding_registers(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        words(self.call(slave, Request::ReadHoldingRegisters(offset, count)).await?)
    }

    async fn read_input_registers(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        words(self.call(slave, Request::ReadInputRegisters(offset, count)).await?)
    }

    async fn write_single_coil(&mut self, slave: u8, offset: u16, value: bool)
        -> Result<(), TransportError> {
        self.call(slave, Request::WriteSingleCoil(offset, value)).await?;
        Ok(())
    }

    async fn write_multiple_registers(
        &mut self,
        slave: u8,
        offset: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        self.call(slave, Request::WriteMultipleRegisters(offset, words)).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            match ctx.disconnect().await {
                Ok(_) => info!(port = %self.settings.port, "serial link closed"),
                Err(e) => warn!(port = %self.settings.port, "serial disconnect failed: {e}"),
            }
        }
    }
}

fn map_parity(parity: SerialParity) -> Parity {
    match parity {
        SerialParity::None => Parity::None,
        SerialParity::Even => Parity::Even,
        SerialParity::Odd => Parity::Odd,
    }
}

fn map_data_bits(bits: u8) -> Result<DataBits, TransportError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(TransportError::Protocol(format!("unsupported data_bits: {other}"))),
    }
}

fn map_stop_bits(bits: u8) -> Result<StopBits, TransportError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(TransportError::Protocol(format!("unsupported stop_bits: {other}"))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SerialConfig {
        SerialConfig {
            port: "/dev/null-does-not-exist".into(),
            ..SerialConfig::default()
        }
    }

    #[tokio::test]
    async fn requests_before_connect_fail_fast() {
        let mut client = RtuClient::new(settings());
        let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_to_missing_port_is_an_error() {
        let mut client = RtuClient::new(settings());
        assert!(client.connect().is_err());
    }

    #[test]
    fn serial_framing_maps() {
        assert!(matches!(map_data_bits(8), Ok(DataBits::Eight)));
        assert!(map_data_bits(9).is_err());
        assert!(matches!(map_stop_bits(2), Ok(StopBits::Two)));
        assert!(map_stop_bits(3).is_err());
        assert_eq!(map_parity(SerialParity::Even), Parity::Even);
    }
}
