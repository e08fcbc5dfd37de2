//! Fixed-topology hysteresis controller.
//!
//! One principal pump moves water from the accumulation reservoir to the
//! distribution reservoir.  The pump turns on when there is water to move
//! and room to put it, and turns off when either side runs out.  The gap
//! between the distribution thresholds keeps it from chattering.

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::address::RegisterKind;
use crate::bus::{self, SharedBus, TransportError};
use crate::db::{Db, Register, Reservoir};
use crate::pump::PumpIo;
use crate::symbolic::{pick, Measurement, ReservoirType};

/// One mechanical horsepower (cv) in watts.
pub const HP_TO_WATTS: f64 = 735.499;

/// Level thresholds in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub accumulation_lower: f64,
    pub accumulation_upper: f64,
    pub distribution_lower: f64,
    pub distribution_upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    TurnOn,
    TurnOff,
    NoChange,
}

pub fn decide(pump_on: bool, accumulation: f64, distribution: f64, t: &Thresholds) -> Decision {
    if !pump_on && accumulation >= t.accumulation_lower && distribution <= t.distribution_lower {
        Decision::TurnOn
    } else if pump_on
        && (accumulation <= t.accumulation_lower || distribution >= t.distribution_upper)
    {
        Decision::TurnOff
    } else {
        Decision::NoChange
    }
}

/// Parse a rated power in horsepower: "0.5", "2" or a fraction like "1/3".
pub fn parse_rated_power(s: &str) -> Option<f64> {
    let s = s.trim();
    let hp = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (hp.is_finite() && hp >= 0.0).then_some(hp)
}

// ---------------------------------------------------------------------------
// Station topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Tank {
    pub reservoir: Reservoir,
    /// Level in percent.
    pub level: Register,
    /// Holding register that receives the capacity at start-up.
    pub volume: Option<Register>,
}

impl Tank {
    pub fn volume_liters(&self, level_pct: f64) -> f64 {
        level_pct / 100.0 * self.reservoir.capacity_liters
    }

    async fn load(db: &Db, reservoir: Reservoir) -> Result<Self> {
        let registers = match reservoir.device_id {
            Some(device_id) => db.registers_for_device(device_id).await?,
            None => Vec::new(),
        };

        let level = match reservoir.level_register_id {
            Some(id) => db.get_register(id).await?,
            None => pick(&registers, Measurement::Level).cloned(),
        }
        .ok_or_else(|| anyhow!("reservoir '{}' has no level register", reservoir.name))?;

        let volume = match reservoir.volume_register_id {
            Some(id) => db.get_register(id).await?,
            None => registers
                .iter()
                .filter(|r| r.kind() == Some(RegisterKind::HoldingRegister))
                .find(|r| Measurement::Volume.matches(&r.name))
                .cloned(),
        };

        Ok(Self {
            reservoir,
            level,
            volume,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Station {
    pub pump: PumpIo,
    pub accumulation: Tank,
    pub distribution: Tank,
    pub thresholds: Thresholds,
}

impl Station {
    /// The principal pump, its source and destination reservoirs (falling
    /// back to the first reservoir of each type) and their thresholds.
    pub async fn load(db: &Db) -> Result<Self> {
        let pump = db
            .principal_pump()
            .await?
            .ok_or_else(|| anyhow!("no PRINCIPAL pump configured"))?;

        let accumulation =
            Self::reservoir(db, pump.source_reservoir_id, ReservoirType::Accumulation).await?;
        let distribution =
            Self::reservoir(db, pump.destination_reservoir_id, ReservoirType::Distribution)
                .await?;

        let name = pump.name.clone();
        let pump = PumpIo::load(db, pump)
            .await?
            .ok_or_else(|| anyhow!("pump '{name}' has no actuator coil"))?;

        let acc_t = db
            .thresholds(accumulation.id)
            .await?
            .ok_or_else(|| anyhow!("reservoir '{}' has no thresholds", accumulation.name))?;
        let dist_t = db
            .thresholds(distribution.id)
            .await?
            .ok_or_else(|| anyhow!("reservoir '{}' has no thresholds", distribution.name))?;

        Ok(Self {
            pump,
            accumulation: Tank::load(db, accumulation).await?,
            distribution: Tank::load(db, distribution).await?,
            thresholds: Thresholds {
                accumulation_lower: acc_t.lower,
                accumulation_upper: acc_t.upper,
                distribution_lower: dist_t.lower,
                distribution_upper: dist_t.upper,
            },
        })
    }

    async fn reservoir(db: &Db, id: Option<i64>, kind: ReservoirType) -> Result<Reservoir> {
        let found = match id {
            Some(id) => db.get_reservoir(id).await?,
            None => db.reservoir_by_type(kind.as_str()).await?,
        };
        found.with_context(|| format!("no {} reservoir configured", kind.as_str()))
    }

    /// Push the pump's rated power (watts) and both capacities (liters) to
    /// the devices.  Failures are logged; the loop can run without them.
    pub async fn push_constants(&self, bus: &SharedBus) {
        let pump = &self.pump.pump;
        match (&self.pump.power, parse_rated_power(&pump.rated_power)) {
            (Some(reg), Some(hp)) => {
                let watts = hp * HP_TO_WATTS;
                match bus::write_value(bus, reg, watts).await {
                    Ok(()) => info!(pump = %pump.name, slave = reg.slave_id, hp, watts, "rated power pushed"),
                    Err(e) => warn!(pump = %pump.name, slave = reg.slave_id, "failed to push rated power: {e}"),
                }
            }
            (None, _) => warn!(pump = %pump.name, "pump has no power register, rated power not pushed"),
            (_, None) => warn!(pump = %pump.name, rated_power = %pump.rated_power, "unparseable rated power"),
        }

        for tank in [&self.accumulation, &self.distribution] {
            let res = &tank.reservoir;
            let Some(reg) = &tank.volume else {
                warn!(reservoir = %res.name, "reservoir has no volume register, capacity not pushed");
                continue;
            };
            match bus::write_value(bus, reg, res.capacity_liters).await {
                Ok(()) => info!(reservoir = %res.name, slave = reg.slave_id, capacity = res.capacity_liters, "capacity pushed"),
                Err(e) => warn!(reservoir = %res.name, slave = reg.slave_id, "failed to push capacity: {e}"),
            }
        }
    }

    /// Both level percentages, accumulation first.
    pub async fn read_levels(&self, bus: &SharedBus) -> Result<(f64, f64), TransportError> {
        let acc = bus::read_value(bus, &self.accumulation.level).await?;
        let dist = bus::read_value(bus, &self.distribution.level).await?;
        Ok((acc, dist))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
