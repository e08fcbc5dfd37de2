//! One-shot diagnostic read of every configured register.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{self, SharedBus};
use crate::codec::{self, RegisterValue};
use crate::db::Db;

/// Result of reading one register.
#[derive(Debug, Clone, Serialize)]
pub struct SweepLine {
    pub slave_id: i64,
    pub register_id: i64,
    pub name: String,
    pub address: i64,
    pub function_code: i64,
    pub data_type: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RegisterValue>,
    /// Engineering value after the register's scale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
}

impl SweepSummary {
    pub fn of(lines: &[SweepLine]) -> Self {
        let ok = lines.iter().filter(|l| l.ok).count();
        Self {
            total: lines.len(),
            ok,
            failed: lines.len() - ok,
        }
    }
}

/// Read every register in the store, ordered by slave and address.
pub async fn run(db: &Db, bus: &SharedBus) -> Result<Vec<SweepLine>> {
    let registers = db.load_registers().await?;
    if registers.is_empty() {
        warn!("no registers configured");
    }
    info!(registers = registers.len(), "starting register sweep");

    let mut lines = Vec::with_capacity(registers.len());
    for reg in registers {
        let result = bus::read_register(bus, &reg).await;
        let line = SweepLine {
            slave_id: reg.slave_id,
            register_id: reg.id,
            name: reg.name.clone(),
            address: reg.address,
            function_code: reg.function_code,
            data_type: reg.data_type.clone(),
            ok: result.is_ok(),
            raw: result.as_ref().ok().copied(),
            value: result
                .as_ref()
                .ok()
                .map(|v| codec::apply_scale(*v, reg.scale)),
            error: result.as_ref().err().map(|e| e.to_string()),
        };

        match (&line.raw, &line.error) {
            (Some(raw), _) => info!(
                slave = reg.slave_id,
                address = reg.address,
                register = %reg.name,
                %raw,
                "read ok"
            ),
            (None, Some(e)) => warn!(
                slave = reg.slave_id,
                address = reg.address,
                register = %reg.name,
                "read failed: {e}"
            ),
            (None, None) => {}
        }
        lines.push(line);
    }

    let summary = SweepSummary::of(&lines);
    info!(total = summary.total, ok = summary.ok, failed = summary.failed, "sweep finished");
    Ok(lines)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RegisterKind;
    use crate::bus::mock::{shared_mock, MockBus};
    use crate::db::{NewDevice, NewRegister};

    async fn seeded() -> Db {
        let db = Db::memory().await;
        let dev = db
            .upsert_device(&NewDevice {
                slave_id: 4,
                name: "Sensor".into(),
                connection: Some("/dev/ttyUSB0".into()),
                category: "sensor".into(),
                active: true,
            })
            .await
            .unwrap();
        for (name, address, fc, dt, scale) in [
            ("Pressão", 30001, 4, "float32", 1.0),
            ("Temperatura", 40010, 3, "int16", 0.1),
            ("Alarme", 10001, 2, "boolean", 1.0),
        ] {
            db.upsert_register(&NewRegister {
                device_id: dev,
                name: name.into(),
                address,
                function_code: fc,
                data_type: dt.into(),
                scale,
                access: "R".into(),
            })
            .await
            .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn reports_each_register() {
        let db = seeded().await;
        let mut mock = MockBus::new();
        mock.set_float_input(4, 0, 2.5);
        mock.holding.insert((4, 9), 215);
        mock.fail(4, RegisterKind::DiscreteInput, 0);
        let (bus, _) = shared_mock(mock);

        let lines = run(&db, &bus).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(SweepSummary::of(&lines), SweepSummary { total: 3, ok: 2, failed: 1 });

        let by_name = |n: &str| lines.iter().find(|l| l.name == n).unwrap();
        assert_eq!(by_name("Pressão").value, Some(2.5));
        let temp = by_name("Temperatura").value.unwrap();
        assert!((temp - 21.5).abs() < 1e-9);
        let alarm = by_name("Alarme");
        assert!(!alarm.ok);
        assert!(alarm.error.as_deref().unwrap().contains("no response"));
    }

    #[tokio::test]
    async fn json_lines_omit_missing_fields() {
        let db = seeded().await;
        let mut mock = MockBus::new();
        mock.offline.insert(4);
        let (bus, _) = shared_mock(mock);

        let lines = run(&db, &bus).await.unwrap();
        let json = serde_json::to_value(&lines[0]).unwrap();
        assert_eq!(json["ok"], false);
        assert!(json.get("value").is_none());
        assert!(json["error"].is_string());
    }
}
