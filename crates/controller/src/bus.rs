//! Transport abstraction over a Modbus master and the typed register helpers
//! built on top of it.
//!
//! Every helper locks the shared bus for exactly one request, so the status
//! poller and the control loop interleave between requests and never inside
//! one.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_modbus::ExceptionCode;

use crate::address::{physical_offset, RegisterKind};
use crate::codec::{self, DataType, Raw, RegisterValue};
use crate::db::Register;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("{kind} registers cannot be written")]
    NotWritable { kind: RegisterKind },
    #[error("register {register} is misconfigured: {reason}")]
    InvalidRegister { register: i64, reason: String },
}

impl TransportError {
    /// Exceptions are answers from the slave; repeating the request will not
    /// change them.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Exception(_) | Self::NotWritable { .. } | Self::InvalidRegister { .. }
        )
    }
}

/// A Modbus master able to talk to any slave on its link.
#[async_trait]
pub trait ModbusBus: Send {
    async fn read_coils(&mut self, slave: u8, offset: u16, count: u16)
        -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &mut self,
        slave: u8,
        offset: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_single_coil(&mut self, slave: u8, offset: u16, value: bool)
        -> Result<(), TransportError>;

    async fn write_multiple_registers(
        &mut self,
        slave: u8,
        offset: u16,
        words: &[u16],
    ) -> Result<(), TransportError>;

    async fn disconnect(&mut self) {}
}

/// The single lock serialising all transport access.
pub type SharedBus = Arc<Mutex<dyn ModbusBus>>;

pub fn shared<B: ModbusBus + 'static>(bus: B) -> SharedBus {
    Arc::new(Mutex::new(bus))
}

// ---------------------------------------------------------------------------
// Register location
// ---------------------------------------------------------------------------

/// A stored slave id as a unicast RTU address.
pub fn slave_address(slave_id: i64) -> Option<u8> {
    u8::try_from(slave_id).ok().filter(|s| (1..=247).contains(s))
}

/// Where a configured register lives on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub slave: u8,
    pub kind: RegisterKind,
    pub offset: u16,
    pub data_type: DataType,
    pub scale: f64,
}

impl Location {
    pub fn of(reg: &Register) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidRegister {
            register: reg.id,
            reason,
        };

        let slave = slave_address(reg.slave_id)
            .ok_or_else(|| invalid(format!("slave id {} out of range 1-247", reg.slave_id)))?;
        let kind = reg
            .kind()
            .ok_or_else(|| invalid(format!("unsupported function code {}", reg.function_code)))?;
        let address = u16::try_from(reg.address)
            .map_err(|_| invalid(format!("address {} out of range", reg.address)))?;
        let data_type = reg.data_type().map_err(invalid)?;

        Ok(Self {
            slave,
            kind,
            offset: physical_offset(address, Some(kind)),
            data_type,
            scale: reg.scale,
        })
    }
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Raw read of `count` items of the location's class.
pub async fn read_raw(bus: &SharedBus, loc: &Location, count: u16) -> Result<Raw, TransportError> {
    let mut bus = bus.lock().await;
    let raw = match loc.kind {
        RegisterKind::Coil => Raw::Bits(bus.read_coils(loc.slave, loc.offset, count).await?),
        RegisterKind::DiscreteInput => {
            Raw::Bits(bus.read_discrete_inputs(loc.slave, loc.offset, count).await?)
        }
        RegisterKind::HoldingRegister => {
            Raw::Words(bus.read_holding_registers(loc.slave, loc.offset, count).await?)
        }
        RegisterKind::InputRegister => {
            Raw::Words(bus.read_input_registers(loc.slave, loc.offset, count).await?)
        }
    };
    Ok(raw)
}

/// Read and decode one configured register.
pub async fn read_register(bus: &SharedBus, reg: &Register) -> Result<RegisterValue, TransportError> {
    let loc = Location::of(reg)?;
    let raw = read_raw(bus, &loc, loc.data_type.word_count()).await?;
    Ok(codec::decode(&raw, loc.data_type))
}

/// Read one configured register as an engineering value.
pub async fn read_value(bus: &SharedBus, reg: &Register) -> Result<f64, TransportError> {
    let value = read_register(bus, reg).await?;
    Ok(codec::apply_scale(value, reg.scale))
}

/// Write an engineering value to a coil or holding register.
///
/// Coils receive `value != 0`; holding registers receive the value encoded
/// per the register's data type, spanning two words for 32-bit types.
pub async fn write_value(bus: &SharedBus, reg: &Register, value: f64) -> Result<(), TransportError> {
    let loc = Location::of(reg)?;
    match loc.kind {
        RegisterKind::Coil => {
            let mut bus = bus.lock().await;
            bus.write_single_coil(loc.slave, loc.offset, value != 0.0).await
        }
        RegisterKind::HoldingRegister => {
            let raw = codec::remove_scale(value, loc.data_type, loc.scale);
            let words = codec::encode(raw, loc.data_type);
            let mut bus = bus.lock().await;
            bus.write_multiple_registers(loc.slave, loc.offset, &words).await
        }
        kind => Err(TransportError::NotWritable { kind }),
    }
}

// ---------------------------------------------------------------------------
// In-memory bus for tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::mock::{shared_mock, MockBus, MockWrite};
    use super::*;

    fn reg(id: i64, slave: i64, address: i64, fc: i64, data_type: &str) -> Register {
        Register {
            id,
            device_id: slave,
            slave_id: slave,
            name: format!("r{id}"),
            address,
            function_code: fc,
            data_type: data_type.into(),
            scale: 1.0,
            access: "R".into(),
        }
    }

    #[tokio::test]
    async fn reads_float_input_register_at_mapped_offset() {
        let mut mock = MockBus::new();
        mock.set_float_input(2, 0, 80.0);
        let (bus, typed) = shared_mock(mock);

        let value = read_value(&bus, &reg(1, 2, 30001, 4, "float32")).await.unwrap();
        assert_eq!(value, 80.0);

        let m = typed.lock().await;
        assert_eq!(m.reads, vec![(2, RegisterKind::InputRegister, 0, 2)]);
    }

    #[tokio::test]
    async fn reads_coil_as_boolean() {
        let mut mock = MockBus::new();
        mock.set_coil(1, 0, true);
        let (bus, _) = shared_mock(mock);

        let value = read_register(&bus, &reg(1, 1, 1, 1, "boolean")).await.unwrap();
        assert_eq!(value, RegisterValue::Bool(true));
    }

    #[tokio::test]
    async fn scaled_integer_read() {
        let mut mock = MockBus::new();
        mock.holding.insert((1, 99), 2205);
        let (bus, _) = shared_mock(mock);

        let mut r = reg(1, 1, 40100, 3, "uint16");
        r.scale = 0.1;
        let value = read_value(&bus, &r).await.unwrap();
        assert!((value - 220.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn writes_int32_as_two_words() {
        let (bus, typed) = shared_mock(MockBus::new());

        write_value(&bus, &reg(5, 3, 40001, 3, "int32"), 11000.0).await.unwrap();

        let m = typed.lock().await;
        assert_eq!(
            m.writes,
            vec![MockWrite::Registers { slave: 3, offset: 0, words: vec![0, 11000] }]
        );
    }

    #[tokio::test]
    async fn coil_write_sends_nonzero_as_true() {
        let (bus, typed) = shared_mock(MockBus::new());

        write_value(&bus, &reg(1, 1, 1, 1, "boolean"), 2.0).await.unwrap();
        write_value(&bus, &reg(1, 1, 1, 1, "boolean"), 0.0).await.unwrap();

        let m = typed.lock().await;
        assert_eq!(
            m.writes,
            vec![
                MockWrite::Coil { slave: 1, offset: 0, value: true },
                MockWrite::Coil { slave: 1, offset: 0, value: false },
            ]
        );
    }

    #[tokio::test]
    async fn input_register_is_not_writable() {
        let (bus, typed) = shared_mock(MockBus::new());

        let err = write_value(&bus, &reg(1, 2, 30001, 4, "float32"), 1.0).await.unwrap_err();
        assert!(matches!(err, TransportError::NotWritable { kind: RegisterKind::InputRegister }));
        assert!(typed.lock().await.writes.is_empty());
    }

    #[tokio::test]
    async fn misconfigured_register_is_rejected_before_io() {
        let (bus, typed) = shared_mock(MockBus::new());

        let err = read_register(&bus, &reg(9, 1, 40001, 16, "float32")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRegister { register: 9, .. }));

        let err = read_register(&bus, &reg(9, 0, 40001, 3, "float32")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRegister { .. }));

        assert!(typed.lock().await.reads.is_empty());
    }

    #[tokio::test]
    async fn failed_read_surfaces_timeout() {
        let mut mock = MockBus::new();
        mock.fail(2, RegisterKind::InputRegister, 0);
        let (bus, _) = shared_mock(mock);

        let err = read_value(&bus, &reg(1, 2, 30001, 4, "float32")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn exceptions_are_not_retryable() {
        assert!(!TransportError::Exception(ExceptionCode::IllegalDataAddress).is_retryable());
        assert!(TransportError::NotConnected.is_retryable());
    }
}
