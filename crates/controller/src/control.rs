//! Control loop driver.
//!
//! Sets up the configured strategy, starts the status poller, runs one
//! control cycle per interval and, on shutdown, stops and joins the poller,
//! closes the database and disconnects the bus, in that order.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::SharedBus;
use crate::config::{ControlConfig, Strategy};
use crate::db::{Db, Electrical, Register};
use crate::poller;
use crate::pump::PumpIo;
use crate::rules::{evaluate_rules, CycleReport};
use crate::threshold::{decide, Decision, Station};
use crate::tracker::AcionamentoTracker;

// ---------------------------------------------------------------------------
// Threshold strategy
// ---------------------------------------------------------------------------

pub struct ThresholdDriver {
    station: Station,
    tracker: AcionamentoTracker,
    /// Start-up reconciliation done.  Until then every cycle retries it and
    /// takes no decision.
    recovered: bool,
}

impl ThresholdDriver {
    /// Load the station, push its constants and reconcile the pump's cycle
    /// with its physical state.  An unreadable pump is reconciled later.
    pub async fn start(db: &Db, bus: &SharedBus) -> Result<Self> {
        let station = Station::load(db)
            .await
            .context("failed to load station topology")?;
        station.push_constants(bus).await;

        let tracker = AcionamentoTracker::new(station.pump.pump.id);
        let mut driver = Self {
            station,
            tracker,
            recovered: false,
        };
        let pump_on = match driver.station.pump.is_on(bus).await {
            Ok(on) => {
                driver
                    .tracker
                    .reconcile(db, on)
                    .await
                    .context("start-up cycle reconciliation failed")?;
                driver.recovered = true;
                Some(on)
            }
            Err(e) => {
                warn!(pump = %driver.station.pump.pump.name, "cannot read pump state, start-up recovery deferred: {e}");
                None
            }
        };

        let s = &driver.station;
        info!(
            pump = %s.pump.pump.name,
            ?pump_on,
            accumulation = %s.accumulation.reservoir.name,
            distribution = %s.distribution.reservoir.name,
            thresholds = ?s.thresholds,
            "threshold strategy ready"
        );
        Ok(driver)
    }

    async fn recover(&mut self, db: &Db, bus: &SharedBus) -> bool {
        let pump = &self.station.pump;
        let on = match pump.is_on(bus).await {
            Ok(on) => on,
            Err(e) => {
                warn!(pump = %pump.pump.name, "pump state still unreadable, cycle skipped: {e}");
                return false;
            }
        };
        match self.tracker.reconcile(db, on).await {
            Ok(()) => {
                info!(pump = %pump.pump.name, pump_on = on, "deferred start-up recovery done");
                self.recovered = true;
                true
            }
            Err(e) => {
                error!(pump = %pump.pump.name, "start-up cycle reconciliation failed, cycle skipped: {e:#}");
                false
            }
        }
    }

    /// One cycle.  Returns the decision that was carried out, `None` when the
    /// cycle was skipped or the pump write failed.
    pub async fn cycle(&mut self, db: &Db, bus: &SharedBus) -> Option<Decision> {
        if !self.recovered && !self.recover(db, bus).await {
            return None;
        }
        self.tracker.retry_pending(db).await;
        let s = &self.station;

        let (acc, dist) = match s.read_levels(bus).await {
            Ok(levels) => levels,
            Err(e) => {
                warn!("failed to read reservoir levels, cycle skipped: {e}");
                return None;
            }
        };

        for (tank, pct) in [(&s.accumulation, acc), (&s.distribution, dist)] {
            if let Err(e) = db
                .insert_level_reading(tank.reservoir.id, tank.volume_liters(pct))
                .await
            {
                error!(reservoir = %tank.reservoir.name, "failed to store level reading: {e:#}");
            }
        }

        let pump_on = match s.pump.is_on(bus).await {
            Ok(on) => on,
            Err(e) => {
                warn!(pump = %s.pump.pump.name, "failed to read pump state, cycle skipped: {e}");
                return None;
            }
        };
        let electrical = s.pump.electrical(bus).await;

        info!(
            accumulation = acc,
            distribution = dist,
            pump_on,
            voltage = electrical.voltage,
            current = electrical.current,
            power = electrical.power,
            "station readings"
        );

        let decision = decide(pump_on, acc, dist, &s.thresholds);
        let on = match decision {
            Decision::NoChange => {
                debug!(pump_on, "no change");
                return Some(decision);
            }
            Decision::TurnOn => true,
            Decision::TurnOff => false,
        };

        if let Err(e) = s.pump.switch(bus, on).await {
            warn!(pump = %s.pump.pump.name, on, "failed to switch pump: {e}");
            return None;
        }
        info!(pump = %s.pump.pump.name, on, accumulation = acc, distribution = dist, "pump switched");

        if on {
            self.tracker.on_turned_on(db).await;
        } else {
            let consumption = s.pump.consumption(bus).await;
            self.tracker.on_turned_off(db, consumption, electrical).await;
        }
        Some(decision)
    }
}

// ---------------------------------------------------------------------------
// Rules strategy
// ---------------------------------------------------------------------------

struct TrackedPump {
    io: PumpIo,
    tracker: AcionamentoTracker,
    /// Last known actuator state.
    on: Option<bool>,
}

pub struct RulesDriver {
    pumps: Vec<TrackedPump>,
}

impl RulesDriver {
    /// Find the pumps whose actuators rules may drive and reconcile their
    /// cycles.  A pump whose state cannot be read starts untracked.
    pub async fn start(db: &Db, bus: &SharedBus) -> Result<Self> {
        let mut pumps = Vec::new();
        for pump in db.pumps_with_actuators().await? {
            let name = pump.name.clone();
            let Some(io) = PumpIo::load(db, pump).await? else {
                warn!(pump = %name, "actuator register missing, pump not tracked");
                continue;
            };

            let mut tracker = AcionamentoTracker::new(io.pump.id);
            let on = match io.is_on(bus).await {
                Ok(on) => {
                    tracker
                        .reconcile(db, on)
                        .await
                        .with_context(|| format!("start-up cycle reconciliation failed for '{name}'"))?;
                    Some(on)
                }
                Err(e) => {
                    warn!(pump = %name, "cannot read pump state, start-up recovery skipped: {e}");
                    None
                }
            };
            pumps.push(TrackedPump { io, tracker, on });
        }

        info!(pumps = pumps.len(), "rules strategy ready");
        Ok(Self { pumps })
    }

    /// One cycle.  Rules and registers are reloaded every time so edits made
    /// in the store take effect without a restart.
    pub async fn cycle(&mut self, db: &Db, bus: &SharedBus) -> Option<CycleReport> {
        for p in &mut self.pumps {
            p.tracker.retry_pending(db).await;
        }

        let rules = match db.load_enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("failed to load rules, cycle skipped: {e:#}");
                return None;
            }
        };
        let registers: HashMap<i64, Register> = match db.load_registers().await {
            Ok(regs) => regs.into_iter().map(|r| (r.id, r)).collect(),
            Err(e) => {
                error!("failed to load registers, cycle skipped: {e:#}");
                return None;
            }
        };

        // Snapshot running pumps before any rule can stop them.
        let mut snapshots = Vec::with_capacity(self.pumps.len());
        for p in &self.pumps {
            snapshots.push(match p.on {
                Some(true) => p.io.electrical(bus).await,
                _ => Electrical::default(),
            });
        }

        let report = evaluate_rules(bus, &rules, &registers).await;

        for outcome in &report.outcomes {
            if let Err(e) = db
                .insert_rule_log(outcome.rule_id, outcome.conditions_met(), outcome.actions_executed())
                .await
            {
                error!(rule = %outcome.rule, "failed to store rule log: {e:#}");
            }
        }

        for (p, electrical) in self.pumps.iter_mut().zip(snapshots) {
            let Some(write) = report
                .writes
                .iter()
                .rev()
                .find(|w| w.register_id == p.io.actuator.id)
            else {
                continue;
            };
            let on = write.value != 0.0;
            match (p.on, on) {
                (Some(was), now) if was == now => {}
                (_, true) => p.tracker.on_turned_on(db).await,
                // Unknown state: close whatever the store still has open.
                (Some(true) | None, false) => {
                    let consumption = p.io.consumption(bus).await;
                    p.tracker.on_turned_off(db, consumption, electrical).await;
                }
                (Some(false), false) => {}
            }
            p.on = Some(on);
        }

        debug!(
            rules = rules.len(),
            fired = report.fired(),
            writes = report.writes.len(),
            "rules cycle done"
        );
        Some(report)
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

enum Driver {
    Threshold(ThresholdDriver),
    Rules(RulesDriver),
}

impl Driver {
    async fn start(strategy: Strategy, db: &Db, bus: &SharedBus) -> Result<Self> {
        Ok(match strategy {
            Strategy::Threshold => Self::Threshold(ThresholdDriver::start(db, bus).await?),
            Strategy::Rules => Self::Rules(RulesDriver::start(db, bus).await?),
        })
    }

    async fn cycle(&mut self, db: &Db, bus: &SharedBus) {
        match self {
            Self::Threshold(d) => {
                d.cycle(db, bus).await;
            }
            Self::Rules(d) => {
                d.cycle(db, bus).await;
            }
        }
    }
}

async fn release(db: &Db, bus: &SharedBus) {
    db.close().await;
    bus.lock().await.disconnect().await;
}

/// Run the control loop on an already connected bus until `shutdown`
/// completes.  Setup failures still close the database and the bus.
pub async fn run<F>(db: Db, bus: SharedBus, control: ControlConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut driver = match Driver::start(control.strategy, &db, &bus).await {
        Ok(d) => d,
        Err(e) => {
            release(&db, &bus).await;
            return Err(e);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = tokio::spawn(poller::run(
        db.clone(),
        bus.clone(),
        Duration::from_secs(control.status_interval_sec),
        stop_rx,
    ));

    let interval = Duration::from_secs(control.cycle_interval_sec);
    info!(
        strategy = ?control.strategy,
        interval_sec = control.cycle_interval_sec,
        "control loop started"
    );

    tokio::pin!(shutdown);
    loop {
        driver.cycle(&db, &bus).await;
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("shutting down");
    let _ = stop_tx.send(true);
    if let Err(e) = poller.await {
        error!("status poller task failed: {e}");
    }
    release(&db, &bus).await;
    info!("control loop stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RegisterKind;
    use crate::bus::mock::{shared_mock, MockBus, MockWrite};
    use crate::config::{self, Config};
    use crate::db::CycleStatus;

    const STATION: &str = r#"
[[devices]]
name = "Motobomba"
slave_id = 1
category = "pump"

[[devices]]
name = "Acumulação"
slave_id = 2
category = "reservoir"

[[devices]]
name = "Distribuição"
slave_id = 3
category = "reservoir"

[[registers]]
device = "Motobomba"
name = "Acionamento (Liga/Desliga)"
address = 1
function_code = 1
data_type = "boolean"
access = "W"

[[registers]]
device = "Motobomba"
name = "Tensão"
address = 30001
function_code = 4
data_type = "float32"

[[registers]]
device = "Motobomba"
name = "Potência"
address = 40001
function_code = 3
data_type = "float32"
access = "W"

[[registers]]
device = "Motobomba"
name = "Consumo"
address = 30005
function_code = 4
data_type = "float32"

[[registers]]
device = "Acumulação"
name = "Nível"
address = 30001
function_code = 4
data_type = "float32"

[[registers]]
device = "Acumulação"
name = "Volume"
address = 40001
function_code = 3
data_type = "int32"
access = "W"

[[registers]]
device = "Distribuição"
name = "Nível"
address = 30001
function_code = 4
data_type = "float32"

[[registers]]
device = "Distribuição"
name = "Volume"
address = 40001
function_code = 3
data_type = "int32"
access = "W"

[[reservoirs]]
name = "Acumulação"
type = "accumulation"
capacity_liters = 1000
device = "Acumulação"
lower = 30
upper = 90

[[reservoirs]]
name = "Distribuição"
type = "distribution"
capacity_liters = 11000
device = "Distribuição"
lower = 20
upper = 80

[[pumps]]
name = "Principal"
rated_power = "1/3"
device = "Motobomba"
actuator_register = "Acionamento (Liga/Desliga)"
source = "Acumulação"
destination = "Distribuição"

[[rules]]
name = "Liga bomba"
priority = 10

[[rules.conditions]]
variable = "Nivel_Reservatorio_Distribuicao"
operator = "<="
value = 20

[[rules.conditions]]
variable = "Nivel_Reservatorio_Acumulacao"
operator = ">="
value = 30

[[rules.actions]]
device = "Motobomba"
register = "Acionamento (Liga/Desliga)"
value = 1

[[rules]]
name = "Desliga bomba"
priority = 5

[[rules.conditions]]
variable = "Nivel_Reservatorio_Distribuicao"
operator = ">="
value = 80

[[rules.actions]]
device = "Motobomba"
register = "Acionamento (Liga/Desliga)"
value = 0
"#;

    async fn station_db() -> (Db, i64) {
        let db = Db::memory().await;
        let cfg: Config = toml::from_str(STATION).unwrap();
        cfg.validate().unwrap();
        config::apply(&cfg, &db).await.unwrap();
        let pump_id = db.principal_pump().await.unwrap().unwrap().id;
        (db, pump_id)
    }

    fn levels(acc: f32, dist: f32) -> MockBus {
        let mut m = MockBus::new();
        m.set_float_input(2, 0, acc);
        m.set_float_input(3, 0, dist);
        m
    }

    fn coil_writes(writes: &[MockWrite]) -> Vec<bool> {
        writes
            .iter()
            .filter_map(|w| match w {
                MockWrite::Coil { slave: 1, offset: 0, value } => Some(*value),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn threshold_cycle_turns_pump_on_and_opens_one_cycle() {
        let (db, pump_id) = station_db().await;
        let (bus, handle) = shared_mock(levels(80.0, 15.0));

        let mut driver = ThresholdDriver::start(&db, &bus).await.unwrap();
        assert!(db.cycles_for_pump(pump_id).await.unwrap().is_empty());

        assert_eq!(driver.cycle(&db, &bus).await, Some(Decision::TurnOn));

        assert_eq!(coil_writes(&handle.lock().await.writes), vec![true]);
        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].end_time.is_none());

        let acc = db.reservoir_by_type("accumulation").await.unwrap().unwrap();
        assert_eq!(db.level_reading_count(acc.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn distribution_in_dead_band_does_not_start_pump() {
        let (db, pump_id) = station_db().await;
        let (bus, handle) = shared_mock(levels(80.0, 25.0));

        let mut driver = ThresholdDriver::start(&db, &bus).await.unwrap();
        assert_eq!(driver.cycle(&db, &bus).await, Some(Decision::NoChange));

        assert!(coil_writes(&handle.lock().await.writes).is_empty());
        assert!(db.cycles_for_pump(pump_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn threshold_full_run_closes_cycle_with_consumption() {
        let (db, pump_id) = station_db().await;
        let (bus, handle) = shared_mock(levels(80.0, 15.0));
        let mut driver = ThresholdDriver::start(&db, &bus).await.unwrap();

        driver.cycle(&db, &bus).await;
        {
            let mut mock = handle.lock().await;
            mock.set_float_input(3, 0, 50.0);
        }
        assert_eq!(driver.cycle(&db, &bus).await, Some(Decision::NoChange));
        {
            let mut mock = handle.lock().await;
            mock.set_float_input(3, 0, 85.0);
            mock.set_float_input(1, 0, 221.0);
            mock.set_float_input(1, 4, 2.5);
        }
        assert_eq!(driver.cycle(&db, &bus).await, Some(Decision::TurnOff));

        assert_eq!(coil_writes(&handle.lock().await.writes), vec![true, false]);
        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].consumption_kwh, Some(2.5));
        assert_eq!(cycles[0].voltage, Some(221.0));
        assert_eq!(cycles[0].status_id, CycleStatus::Finished.id());
    }

    #[tokio::test]
    async fn failed_level_read_skips_cycle() {
        let (db, pump_id) = station_db().await;
        let mut mock = levels(80.0, 15.0);
        mock.offline.insert(3);
        let (bus, handle) = shared_mock(mock);

        let mut driver = ThresholdDriver::start(&db, &bus).await.unwrap();
        assert_eq!(driver.cycle(&db, &bus).await, None);
        assert!(coil_writes(&handle.lock().await.writes).is_empty());
        assert!(db.cycles_for_pump(pump_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_with_pump_running_adopts_open_cycle() {
        let (db, pump_id) = station_db().await;
        let open = db.insert_cycle(pump_id).await.unwrap();
        let mut mock = levels(80.0, 50.0);
        mock.set_coil(1, 0, true);
        let (bus, _) = shared_mock(mock);

        let driver = ThresholdDriver::start(&db, &bus).await.unwrap();
        assert_eq!(driver.tracker.open_cycle(), Some(open));
        assert_eq!(db.cycles_for_pump(pump_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rules_cycle_tracks_pump_and_logs_rules() {
        let (db, pump_id) = station_db().await;
        let (bus, handle) = shared_mock(levels(80.0, 15.0));
        let mut driver = RulesDriver::start(&db, &bus).await.unwrap();

        let report = driver.cycle(&db, &bus).await.unwrap();
        assert_eq!(report.fired(), 1);
        assert_eq!(db.cycles_for_pump(pump_id).await.unwrap().len(), 1);

        // Still low: the rule fires again but no second cycle opens.
        driver.cycle(&db, &bus).await.unwrap();
        assert_eq!(db.cycles_for_pump(pump_id).await.unwrap().len(), 1);

        {
            let mut mock = handle.lock().await;
            mock.set_float_input(3, 0, 90.0);
            mock.set_float_input(1, 4, 1.75);
        }
        driver.cycle(&db, &bus).await.unwrap();

        assert_eq!(coil_writes(&handle.lock().await.writes), vec![true, true, false]);
        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].consumption_kwh, Some(1.75));

        let rules = db.load_enabled_rules().await.unwrap();
        let liga = rules.iter().find(|r| r.name == "Liga bomba").unwrap();
        assert_eq!(
            db.rule_log_entries(liga.id).await.unwrap(),
            vec![(true, 1), (true, 1), (false, 0)]
        );
    }

    #[tokio::test]
    async fn unreadable_pump_at_start_defers_recovery() {
        let (db, pump_id) = station_db().await;
        let open = db.insert_cycle(pump_id).await.unwrap();
        let mut mock = levels(80.0, 50.0);
        mock.fail(1, RegisterKind::Coil, 0);
        let (bus, handle) = shared_mock(mock);

        let mut driver = ThresholdDriver::start(&db, &bus).await.unwrap();
        assert_eq!(driver.tracker.open_cycle(), None);

        // Still unreadable: no decision and the stored cycle is untouched.
        assert_eq!(driver.cycle(&db, &bus).await, None);
        assert!(db.cycles_for_pump(pump_id).await.unwrap()[0].end_time.is_none());

        handle.lock().await.failing.clear();
        assert_eq!(driver.cycle(&db, &bus).await, Some(Decision::NoChange));

        // Pump found off: the cycle left open is closed as interrupted.
        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].id, open);
        assert_eq!(cycles[0].status_id, CycleStatus::Interrupted.id());
        assert!(coil_writes(&handle.lock().await.writes).is_empty());
    }

    #[tokio::test]
    async fn run_survives_unreadable_pump_at_start() {
        let (db, _) = station_db().await;
        let mut mock = levels(80.0, 15.0);
        mock.fail(1, RegisterKind::Coil, 0);
        let (bus, handle) = shared_mock(mock);
        let control = ControlConfig {
            strategy: Strategy::Threshold,
            cycle_interval_sec: 1,
            status_interval_sec: 3600,
        };

        run(db, bus, control, tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        let mock = handle.lock().await;
        assert!(mock.disconnected);
        assert!(coil_writes(&mock.writes).is_empty());
    }

    #[tokio::test]
    async fn rules_off_closes_stale_cycle_of_unread_pump() {
        let (db, pump_id) = station_db().await;
        let stale = db.insert_cycle(pump_id).await.unwrap();
        let mut mock = levels(80.0, 90.0);
        mock.fail(1, RegisterKind::Coil, 0);
        mock.set_float_input(1, 4, 0.5);
        let (bus, handle) = shared_mock(mock);

        let mut driver = RulesDriver::start(&db, &bus).await.unwrap();
        assert_eq!(driver.pumps[0].on, None);
        handle.lock().await.failing.clear();

        let report = driver.cycle(&db, &bus).await.unwrap();
        assert_eq!(report.fired(), 1);
        assert_eq!(coil_writes(&handle.lock().await.writes), vec![false]);

        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].id, stale);
        assert!(cycles[0].end_time.is_some());
        assert_eq!(cycles[0].consumption_kwh, Some(0.5));
        assert_eq!(driver.pumps[0].on, Some(false));
    }

    #[tokio::test]
    async fn run_stops_and_releases_everything() {
        let (db, _) = station_db().await;
        let (bus, handle) = shared_mock(levels(80.0, 15.0));
        let control = ControlConfig {
            strategy: Strategy::Threshold,
            cycle_interval_sec: 1,
            status_interval_sec: 3600,
        };

        run(db, bus, control, tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        let mock = handle.lock().await;
        assert!(mock.disconnected);
        assert_eq!(coil_writes(&mock.writes), vec![true]);
    }

    #[tokio::test]
    async fn setup_failure_still_releases_the_bus() {
        let db = Db::memory().await;
        let (bus, handle) = shared_mock(MockBus::new());

        let err = run(db, bus, ControlConfig::default(), std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("no PRINCIPAL pump"));
        assert!(handle.lock().await.disconnected);
    }
}
