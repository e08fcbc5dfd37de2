//! A pump as the controller sees it on the wire: its actuator coil plus the
//! electrical registers found on its device.

use anyhow::Result;
use tracing::warn;

use crate::address::RegisterKind;
use crate::bus::{self, SharedBus, TransportError};
use crate::db::{Db, Electrical, Pump, Register};
use crate::symbolic::{pick, Measurement};

#[derive(Debug, Clone)]
pub struct PumpIo {
    pub pump: Pump,
    pub actuator: Register,
    pub voltage: Option<Register>,
    pub current: Option<Register>,
    pub power: Option<Register>,
    pub consumption: Option<Register>,
}

impl PumpIo {
    /// Resolve the pump's registers.  `None` when no actuator can be found:
    /// neither a configured actuator register nor a coil on the pump device.
    pub async fn load(db: &Db, pump: Pump) -> Result<Option<Self>> {
        let registers = match pump.device_id {
            Some(device_id) => db.registers_for_device(device_id).await?,
            None => Vec::new(),
        };

        let actuator = match pump.actuator_register_id {
            Some(id) => db.get_register(id).await?,
            None => registers
                .iter()
                .find(|r| r.kind() == Some(RegisterKind::Coil))
                .cloned(),
        };
        let Some(actuator) = actuator else {
            return Ok(None);
        };

        let find = |m: Measurement| pick(&registers, m).cloned();
        Ok(Some(Self {
            voltage: find(Measurement::Voltage),
            current: find(Measurement::Current),
            power: find(Measurement::Power),
            consumption: find(Measurement::Consumption),
            actuator,
            pump,
        }))
    }

    pub async fn is_on(&self, bus: &SharedBus) -> Result<bool, TransportError> {
        Ok(bus::read_value(bus, &self.actuator).await? != 0.0)
    }

    pub async fn switch(&self, bus: &SharedBus, on: bool) -> Result<(), TransportError> {
        bus::write_value(bus, &self.actuator, if on { 1.0 } else { 0.0 }).await
    }

    /// Voltage, current and power; an unreadable or missing register reads as 0.
    pub async fn electrical(&self, bus: &SharedBus) -> Electrical {
        Electrical {
            voltage: self.read_or_zero(bus, self.voltage.as_ref(), "voltage").await,
            current: self.read_or_zero(bus, self.current.as_ref(), "current").await,
            power: self.read_or_zero(bus, self.power.as_ref(), "power").await,
        }
    }

    /// Accumulated consumption in kWh, 0 when unreadable.
    pub async fn consumption(&self, bus: &SharedBus) -> f64 {
        self.read_or_zero(bus, self.consumption.as_ref(), "consumption")
            .await
    }

    async fn read_or_zero(&self, bus: &SharedBus, reg: Option<&Register>, what: &str) -> f64 {
        let Some(reg) = reg else {
            return 0.0;
        };
        match bus::read_value(bus, reg).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    pump = %self.pump.name,
                    slave = reg.slave_id,
                    address = reg.address,
                    "failed to read {what}: {e}"
                );
                0.0
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{shared_mock, MockBus, MockWrite};
    use crate::db::{NewDevice, NewPump, NewRegister};

    async fn seed(db: &Db, with_actuator: bool) -> Pump {
        let device_id = db
            .upsert_device(&NewDevice {
                slave_id: 1,
                name: "Motobomba".into(),
                connection: None,
                category: "pump".into(),
                active: true,
            })
            .await
            .unwrap();
        let mut regs = vec![
            ("Tensão", 30001, 4, "float32"),
            ("Corrente", 30003, 4, "float32"),
            ("Consumo", 30005, 4, "float32"),
        ];
        if with_actuator {
            regs.insert(0, ("Acionamento (Liga/Desliga)", 1, 1, "boolean"));
        }
        for (name, address, fc, dt) in regs {
            db.upsert_register(&NewRegister {
                device_id,
                name: name.into(),
                address,
                function_code: fc,
                data_type: dt.into(),
                scale: 1.0,
                access: if fc == 1 { "W" } else { "R" }.into(),
            })
            .await
            .unwrap();
        }
        let id = db
            .upsert_pump(&NewPump {
                name: "Principal".into(),
                rated_power: "1".into(),
                device_id: Some(device_id),
                actuator_register_id: None,
                source_reservoir_id: None,
                destination_reservoir_id: None,
                role: "PRINCIPAL".into(),
                rotation_status: "ACTIVE".into(),
                group_name: None,
            })
            .await
            .unwrap();
        db.principal_pump().await.unwrap().filter(|p| p.id == id).unwrap()
    }

    #[tokio::test]
    async fn finds_coil_and_electrical_registers_by_name() {
        let db = Db::memory().await;
        let pump = seed(&db, true).await;
        let io = PumpIo::load(&db, pump).await.unwrap().unwrap();

        assert_eq!(io.actuator.address, 1);
        assert_eq!(io.voltage.as_ref().unwrap().name, "Tensão");
        assert_eq!(io.current.as_ref().unwrap().name, "Corrente");
        assert_eq!(io.consumption.as_ref().unwrap().name, "Consumo");
        assert!(io.power.is_none());
    }

    #[tokio::test]
    async fn pump_without_coil_has_no_io() {
        let db = Db::memory().await;
        let pump = seed(&db, false).await;
        assert!(PumpIo::load(&db, pump).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn electrical_reads_degrade_to_zero() {
        let db = Db::memory().await;
        let pump = seed(&db, true).await;
        let io = PumpIo::load(&db, pump).await.unwrap().unwrap();

        let mut mock = MockBus::new();
        mock.set_float_input(1, 0, 220.0);
        mock.fail(1, RegisterKind::InputRegister, 2);
        let (bus, handle) = shared_mock(mock);

        let e = io.electrical(&bus).await;
        assert_eq!(e.voltage, 220.0);
        assert_eq!(e.current, 0.0);
        assert_eq!(e.power, 0.0);

        io.switch(&bus, true).await.unwrap();
        assert!(io.is_on(&bus).await.unwrap());
        assert_eq!(
            handle.lock().await.writes,
            vec![MockWrite::Coil {
                slave: 1,
                offset: 0,
                value: true
            }]
        );
    }
}
