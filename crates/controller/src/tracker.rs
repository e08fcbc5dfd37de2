//! Activation-cycle ("acionamento") bookkeeping for one pump.
//!
//! The store is the source of truth: every open and close first asks it for
//! the pump's open cycle, so a restarted process picks up where the last one
//! left off and a repeated ON never opens a second row.  A transition that
//! cannot be persisted stays pending and is retried on the next cycle.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::db::{CycleStatus, Db, Electrical};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    Open,
    Close {
        consumption_kwh: f64,
        electrical: Electrical,
    },
}

#[derive(Debug)]
pub struct AcionamentoTracker {
    pump_id: i64,
    open: Option<i64>,
    pending: Option<Pending>,
}

impl AcionamentoTracker {
    pub fn new(pump_id: i64) -> Self {
        Self {
            pump_id,
            open: None,
            pending: None,
        }
    }

    /// Id of the cycle this process believes is open.
    pub fn open_cycle(&self) -> Option<i64> {
        self.open
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Align the store with the pump's physical state at start-up.
    ///
    /// ON with an open row adopts it, ON without one opens a row, and OFF
    /// with an open row closes it as interrupted.
    pub async fn reconcile(&mut self, db: &Db, pump_on: bool) -> Result<()> {
        let stored = db.open_cycle(self.pump_id).await?;
        self.open = match (pump_on, stored) {
            (true, Some(id)) => {
                info!(pump = self.pump_id, cycle = id, "pump running, adopting open cycle");
                Some(id)
            }
            (true, None) => {
                let id = db.insert_cycle(self.pump_id).await?;
                info!(pump = self.pump_id, cycle = id, "pump running without a cycle, opened one");
                Some(id)
            }
            (false, Some(id)) => {
                db.close_cycle(id, Electrical::default(), 0.0, CycleStatus::Interrupted)
                    .await?;
                warn!(pump = self.pump_id, cycle = id, "pump stopped while unattended, cycle marked interrupted");
                None
            }
            (false, None) => None,
        };
        self.pending = None;
        Ok(())
    }

    /// Record an OFF to ON transition.
    pub async fn on_turned_on(&mut self, db: &Db) {
        match self.try_open(db).await {
            Ok(id) => {
                self.open = Some(id);
                self.pending = None;
            }
            Err(e) => {
                error!(pump = self.pump_id, "failed to record cycle start, will retry: {e:#}");
                self.pending = Some(Pending::Open);
            }
        }
    }

    /// Record an ON to OFF transition with the final readings.
    pub async fn on_turned_off(&mut self, db: &Db, consumption_kwh: f64, electrical: Electrical) {
        match self.try_close(db, consumption_kwh, electrical).await {
            Ok(()) => {
                self.open = None;
                self.pending = None;
            }
            Err(e) => {
                error!(pump = self.pump_id, "failed to record cycle end, will retry: {e:#}");
                self.pending = Some(Pending::Close {
                    consumption_kwh,
                    electrical,
                });
            }
        }
    }

    /// Replay a transition that could not be persisted earlier.
    pub async fn retry_pending(&mut self, db: &Db) {
        match self.pending {
            Some(Pending::Open) => self.on_turned_on(db).await,
            Some(Pending::Close {
                consumption_kwh,
                electrical,
            }) => self.on_turned_off(db, consumption_kwh, electrical).await,
            None => {}
        }
    }

    async fn try_open(&self, db: &Db) -> Result<i64> {
        if let Some(id) = db.open_cycle(self.pump_id).await? {
            if self.open != Some(id) {
                warn!(pump = self.pump_id, cycle = id, "cycle already open, reusing it");
            }
            return Ok(id);
        }
        let id = db.insert_cycle(self.pump_id).await?;
        info!(pump = self.pump_id, cycle = id, "cycle started");
        Ok(id)
    }

    async fn try_close(&self, db: &Db, consumption_kwh: f64, electrical: Electrical) -> Result<()> {
        let Some(id) = db.open_cycle(self.pump_id).await? else {
            error!(
                pump = self.pump_id,
                consumption_kwh,
                "no open cycle to close, consumption for this run is lost"
            );
            return Ok(());
        };
        if self.open != Some(id) {
            warn!(pump = self.pump_id, cycle = id, "closing cycle recovered from the store");
        }
        if db
            .close_cycle(id, electrical, consumption_kwh, CycleStatus::Finished)
            .await?
        {
            info!(pump = self.pump_id, cycle = id, consumption_kwh, "cycle finished");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewPump;

    async fn pump(db: &Db) -> i64 {
        db.upsert_pump(&NewPump {
            name: "Principal".into(),
            rated_power: "1".into(),
            device_id: None,
            actuator_register_id: None,
            source_reservoir_id: None,
            destination_reservoir_id: None,
            role: "PRINCIPAL".into(),
            rotation_status: "ACTIVE".into(),
            group_name: None,
        })
        .await
        .unwrap()
    }

    fn electrical() -> Electrical {
        Electrical {
            voltage: 220.0,
            current: 3.5,
            power: 245.0,
        }
    }

    #[tokio::test]
    async fn off_on_off_makes_one_closed_cycle() {
        let db = Db::memory().await;
        let pump_id = pump(&db).await;
        let mut tracker = AcionamentoTracker::new(pump_id);

        tracker.on_turned_on(&db).await;
        assert!(tracker.open_cycle().is_some());
        tracker.on_turned_off(&db, 1.25, electrical()).await;
        assert!(tracker.open_cycle().is_none());

        // A repeated OFF finds nothing to close and adds nothing.
        tracker.on_turned_off(&db, 9.0, electrical()).await;
        assert!(!tracker.has_pending());

        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        let c = &cycles[0];
        assert!(!c.start_date.is_empty());
        assert!(c.end_time.is_some());
        assert_eq!(c.consumption_kwh, Some(1.25));
        assert_eq!(c.voltage, Some(220.0));
        assert_eq!(c.status_id, CycleStatus::Finished.id());
    }

    #[tokio::test]
    async fn second_on_reuses_open_cycle() {
        let db = Db::memory().await;
        let pump_id = pump(&db).await;
        let mut tracker = AcionamentoTracker::new(pump_id);

        tracker.on_turned_on(&db).await;
        let first = tracker.open_cycle();
        // A fresh tracker, as after a restart, must not open another row.
        let mut other = AcionamentoTracker::new(pump_id);
        other.on_turned_on(&db).await;

        assert_eq!(other.open_cycle(), first);
        assert_eq!(db.cycles_for_pump(pump_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_recovers_cycle_lost_from_memory() {
        let db = Db::memory().await;
        let pump_id = pump(&db).await;
        let id = db.insert_cycle(pump_id).await.unwrap();

        let mut tracker = AcionamentoTracker::new(pump_id);
        tracker.on_turned_off(&db, 0.5, Electrical::default()).await;

        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles[0].id, id);
        assert_eq!(cycles[0].consumption_kwh, Some(0.5));
        assert!(db.open_cycle(pump_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_reconciliation() {
        let db = Db::memory().await;
        let pump_id = pump(&db).await;

        // ON, nothing stored: open one.
        let mut tracker = AcionamentoTracker::new(pump_id);
        tracker.reconcile(&db, true).await.unwrap();
        let opened = tracker.open_cycle().unwrap();

        // ON, row stored: adopt it.
        let mut tracker = AcionamentoTracker::new(pump_id);
        tracker.reconcile(&db, true).await.unwrap();
        assert_eq!(tracker.open_cycle(), Some(opened));

        // OFF, row stored: close as interrupted.
        let mut tracker = AcionamentoTracker::new(pump_id);
        tracker.reconcile(&db, false).await.unwrap();
        assert_eq!(tracker.open_cycle(), None);

        let cycles = db.cycles_for_pump(pump_id).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status_id, CycleStatus::Interrupted.id());
        assert!(cycles[0].end_time.is_some());
    }

    #[tokio::test]
    async fn persistence_failure_keeps_transition_pending() {
        let db = Db::memory().await;
        let pump_id = pump(&db).await;
        let mut tracker = AcionamentoTracker::new(pump_id);

        db.close().await;
        tracker.on_turned_on(&db).await;
        assert!(tracker.has_pending());
        assert!(tracker.open_cycle().is_none());

        // Still unreachable: the transition stays queued.
        tracker.retry_pending(&db).await;
        assert!(tracker.has_pending());
    }
}
