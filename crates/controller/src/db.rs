use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::address::{self, RegisterKind};
use crate::codec::DataType;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Device {
    pub id: i64,
    pub slave_id: i64,
    pub name: String,
    pub connection: Option<String>,
    pub category: String,
    pub active: bool,
    pub status: String,
    pub last_seen: Option<String>,
}

/// A configured register together with the slave id of its device.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Register {
    pub id: i64,
    pub device_id: i64,
    pub slave_id: i64,
    pub name: String,
    pub address: i64,
    pub function_code: i64,
    pub data_type: String,
    pub scale: f64,
    pub access: String,
}

impl Register {
    pub fn kind(&self) -> Option<RegisterKind> {
        RegisterKind::from_function_code(self.function_code)
    }

    pub fn data_type(&self) -> std::result::Result<DataType, String> {
        self.data_type.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Reservoir {
    pub id: i64,
    pub name: String,
    pub capacity_liters: f64,
    pub reservoir_type: String,
    pub device_id: Option<i64>,
    pub level_register_id: Option<i64>,
    pub volume_register_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, FromRow)]
pub struct ThresholdRow {
    pub reservoir_id: i64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Pump {
    pub id: i64,
    pub name: String,
    pub rated_power: String,
    pub device_id: Option<i64>,
    pub actuator_register_id: Option<i64>,
    pub source_reservoir_id: Option<i64>,
    pub destination_reservoir_id: Option<i64>,
    pub role: String,
    pub rotation_status: String,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    priority: i64,
    stop_on_trigger: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Condition {
    pub id: i64,
    pub rule_id: i64,
    pub left_register_id: i64,
    pub operator: String,
    pub right_value: f64,
    pub right_is_register: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Action {
    pub id: i64,
    pub rule_id: i64,
    pub target_register_id: i64,
    pub write_value: f64,
}

/// An enabled rule with its ordered conditions and actions.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    pub stop_on_trigger: bool,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Acionamento {
    pub id: i64,
    pub pump_id: i64,
    pub start_date: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub consumption_kwh: Option<f64>,
    pub status_id: i64,
}

/// Electrical readings captured when a cycle closes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Electrical {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Started = 1,
    Finished = 2,
    Interrupted = 3,
}

impl CycleStatus {
    pub fn id(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }
}

// ---------------------------------------------------------------------------
// Seed inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub slave_id: i64,
    pub name: String,
    pub connection: Option<String>,
    pub category: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewRegister {
    pub device_id: i64,
    pub name: String,
    pub address: i64,
    pub function_code: i64,
    pub data_type: String,
    pub scale: f64,
    pub access: String,
}

#[derive(Debug, Clone)]
pub struct NewReservoir {
    pub name: String,
    pub capacity_liters: f64,
    pub reservoir_type: String,
    pub device_id: Option<i64>,
    pub level_register_id: Option<i64>,
    pub volume_register_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewPump {
    pub name: String,
    pub rated_power: String,
    pub device_id: Option<i64>,
    pub actuator_register_id: Option<i64>,
    pub source_reservoir_id: Option<i64>,
    pub destination_reservoir_id: Option<i64>,
    pub role: String,
    pub rotation_status: String,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCondition {
    pub left_register_id: i64,
    pub operator: String,
    pub right_value: f64,
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub target_register_id: i64,
    pub write_value: f64,
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: i64,
    pub stop_on_trigger: bool,
    pub conditions: Vec<NewCondition>,
    pub actions: Vec<NewAction>,
}

const REGISTER_COLUMNS: &str = r#"
    r.id, r.device_id, d.slave_id, r.name, r.address,
    r.function_code, r.data_type, r.scale, r.access
"#;

const RESERVOIR_COLUMNS: &str = r#"
    id, name, capacity_liters, reservoir_type,
    device_id, level_register_id, volume_register_id
"#;

const PUMP_COLUMNS: &str = r#"
    id, name, rated_power, device_id, actuator_register_id,
    source_reservoir_id, destination_reservoir_id,
    role, rotation_status, group_name
"#;

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/pumpstation/station.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // In-memory databases stay on a single connection.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Clock
    // ----------------------------

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    pub fn today_yyyy_mm_dd() -> String {
        let now = Self::now();
        format!("{:04}-{:02}-{:02}", now.year(), now.month() as u8, now.day())
    }

    pub fn now_hh_mm_ss() -> String {
        let now = Self::now();
        format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
    }

    pub fn timestamp() -> String {
        let now = Self::now();
        now.format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string())
    }

    // ----------------------------
    // Devices + registers
    // ----------------------------

    pub async fn load_active_devices(&self) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT id, slave_id, name, connection, category, active, status, last_seen
            FROM modbus_device
            WHERE active = 1
            ORDER BY slave_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_active_devices failed")
    }

    pub async fn update_device_status(&self, device_id: i64, status: DeviceStatus) -> Result<()> {
        let last_seen = (status == DeviceStatus::Online).then(Self::timestamp);
        sqlx::query(
            r#"
            UPDATE modbus_device
            SET status = ?, last_seen = COALESCE(?, last_seen)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(last_seen)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("update_device_status failed")?;
        Ok(())
    }

    pub async fn load_registers(&self) -> Result<Vec<Register>> {
        sqlx::query_as::<_, Register>(&format!(
            r#"
            SELECT {REGISTER_COLUMNS}
            FROM modbus_register r
            JOIN modbus_device d ON d.id = r.device_id
            ORDER BY d.slave_id, r.function_code, r.address
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .context("load_registers failed")
    }

    pub async fn get_register(&self, register_id: i64) -> Result<Option<Register>> {
        sqlx::query_as::<_, Register>(&format!(
            r#"
            SELECT {REGISTER_COLUMNS}
            FROM modbus_register r
            JOIN modbus_device d ON d.id = r.device_id
            WHERE r.id = ?
            "#
        ))
        .bind(register_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_register failed")
    }

    pub async fn registers_for_device(&self, device_id: i64) -> Result<Vec<Register>> {
        sqlx::query_as::<_, Register>(&format!(
            r#"
            SELECT {REGISTER_COLUMNS}
            FROM modbus_register r
            JOIN modbus_device d ON d.id = r.device_id
            WHERE r.device_id = ?
            ORDER BY r.id
            "#
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("registers_for_device failed")
    }

    /// Registers on devices attached to reservoirs of the given type.
    pub async fn registers_for_reservoir_type(&self, reservoir_type: &str) -> Result<Vec<Register>> {
        sqlx::query_as::<_, Register>(&format!(
            r#"
            SELECT DISTINCT {REGISTER_COLUMNS}
            FROM modbus_register r
            JOIN modbus_device d ON d.id = r.device_id
            JOIN reservoir res ON res.device_id = d.id
            WHERE res.reservoir_type = ?
            ORDER BY r.id
            "#
        ))
        .bind(reservoir_type)
        .fetch_all(&self.pool)
        .await
        .context("registers_for_reservoir_type failed")
    }

    /// Registers on devices of the given category.
    pub async fn registers_for_category(&self, category: &str) -> Result<Vec<Register>> {
        sqlx::query_as::<_, Register>(&format!(
            r#"
            SELECT {REGISTER_COLUMNS}
            FROM modbus_register r
            JOIN modbus_device d ON d.id = r.device_id
            WHERE d.category = ?
            ORDER BY r.id
            "#
        ))
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .context("registers_for_category failed")
    }

    pub async fn max_address(&self, device_id: i64, function_code: i64) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT MAX(address)
            FROM modbus_register
            WHERE device_id = ? AND function_code = ?
            "#,
        )
        .bind(device_id)
        .bind(function_code)
        .fetch_one(&self.pool)
        .await
        .context("max_address failed")
    }

    /// Address of a register already stored under this name, if any.
    pub async fn register_address(&self, device_id: i64, function_code: i64, name: &str) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT address
            FROM modbus_register
            WHERE device_id = ? AND function_code = ? AND name = ?
            ORDER BY address
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(function_code)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("register_address failed")
    }

    /// Next free protocol address for a (device, function code) pair.
    pub async fn next_free_address(&self, device_id: i64, kind: RegisterKind) -> Result<u16> {
        let max = self
            .max_address(device_id, i64::from(kind.function_code()))
            .await?
            .map(u16::try_from)
            .transpose()
            .context("stored register address out of range")?;
        address::next_free_address(max, kind)
            .ok_or_else(|| anyhow!("no free {kind} address left on device {device_id}"))
    }

    // ----------------------------
    // Reservoirs + pumps
    // ----------------------------

    pub async fn get_reservoir(&self, reservoir_id: i64) -> Result<Option<Reservoir>> {
        sqlx::query_as::<_, Reservoir>(&format!(
            "SELECT {RESERVOIR_COLUMNS} FROM reservoir WHERE id = ?"
        ))
        .bind(reservoir_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_reservoir failed")
    }

    pub async fn reservoir_by_type(&self, reservoir_type: &str) -> Result<Option<Reservoir>> {
        sqlx::query_as::<_, Reservoir>(&format!(
            "SELECT {RESERVOIR_COLUMNS} FROM reservoir WHERE reservoir_type = ? ORDER BY id LIMIT 1"
        ))
        .bind(reservoir_type)
        .fetch_optional(&self.pool)
        .await
        .context("reservoir_by_type failed")
    }

    pub async fn thresholds(&self, reservoir_id: i64) -> Result<Option<ThresholdRow>> {
        sqlx::query_as::<_, ThresholdRow>(
            "SELECT reservoir_id, lower, upper FROM reservoir_thresholds WHERE reservoir_id = ?",
        )
        .bind(reservoir_id)
        .fetch_optional(&self.pool)
        .await
        .context("thresholds failed")
    }

    pub async fn insert_level_reading(&self, reservoir_id: i64, volume_liters: f64) -> Result<()> {
        sqlx::query("INSERT INTO level_reading (reservoir_id, value, date, time) VALUES (?, ?, ?, ?)")
            .bind(reservoir_id)
            .bind(volume_liters)
            .bind(Self::today_yyyy_mm_dd())
            .bind(Self::now_hh_mm_ss())
            .execute(&self.pool)
            .await
            .context("insert_level_reading failed")?;
        Ok(())
    }

    /// The first principal pump, which the threshold strategy drives.
    pub async fn principal_pump(&self) -> Result<Option<Pump>> {
        sqlx::query_as::<_, Pump>(&format!(
            "SELECT {PUMP_COLUMNS} FROM pump WHERE role = 'PRINCIPAL' ORDER BY id LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("principal_pump failed")
    }

    /// Pumps with a configured actuator register.
    pub async fn pumps_with_actuators(&self) -> Result<Vec<Pump>> {
        sqlx::query_as::<_, Pump>(&format!(
            "SELECT {PUMP_COLUMNS} FROM pump WHERE actuator_register_id IS NOT NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("pumps_with_actuators failed")
    }

    // ----------------------------
    // Rules
    // ----------------------------

    /// Enabled rules, highest priority first, each with its ordered
    /// conditions and actions.
    pub async fn load_enabled_rules(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, name, priority, stop_on_trigger
            FROM rule
            WHERE enabled = 1
            ORDER BY priority DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_enabled_rules failed")?;

        let conditions = sqlx::query_as::<_, Condition>(
            r#"
            SELECT c.id, c.rule_id, c.left_register_id, c.operator, c.right_value, c.right_is_register
            FROM rule_condition c
            JOIN rule ru ON ru.id = c.rule_id
            WHERE ru.enabled = 1
            ORDER BY c.rule_id, c.position, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_enabled_rules: conditions failed")?;

        let actions = sqlx::query_as::<_, Action>(
            r#"
            SELECT a.id, a.rule_id, a.target_register_id, a.write_value
            FROM rule_action a
            JOIN rule ru ON ru.id = a.rule_id
            WHERE ru.enabled = 1
            ORDER BY a.rule_id, a.position, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_enabled_rules: actions failed")?;

        Ok(rows
            .into_iter()
            .map(|r| Rule {
                conditions: conditions.iter().filter(|c| c.rule_id == r.id).cloned().collect(),
                actions: actions.iter().filter(|a| a.rule_id == r.id).cloned().collect(),
                id: r.id,
                name: r.name,
                priority: r.priority,
                stop_on_trigger: r.stop_on_trigger,
            })
            .collect())
    }

    pub async fn insert_rule_log(
        &self,
        rule_id: i64,
        conditions_met: bool,
        actions_executed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_log (rule_id, timestamp, conditions_met, actions_executed)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(rule_id)
        .bind(Self::timestamp())
        .bind(conditions_met)
        .bind(actions_executed)
        .execute(&self.pool)
        .await
        .context("insert_rule_log failed")?;
        Ok(())
    }

    // ----------------------------
    // Activation cycles
    // ----------------------------

    /// Id of the open ("cycle started", no end time) cycle for a pump.
    pub async fn open_cycle(&self, pump_id: i64) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM acionamento
            WHERE pump_id = ? AND end_time IS NULL AND status_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(pump_id)
        .bind(CycleStatus::Started.id())
        .fetch_optional(&self.pool)
        .await
        .context("open_cycle failed")
    }

    pub async fn insert_cycle(&self, pump_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO acionamento (pump_id, start_date, start_time, status_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(pump_id)
        .bind(Self::today_yyyy_mm_dd())
        .bind(Self::now_hh_mm_ss())
        .bind(CycleStatus::Started.id())
        .fetch_one(&self.pool)
        .await
        .context("insert_cycle failed")
    }

    /// Close an open cycle.  Returns false when it was already closed.
    pub async fn close_cycle(
        &self,
        cycle_id: i64,
        electrical: Electrical,
        consumption_kwh: f64,
        status: CycleStatus,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE acionamento
            SET end_time = ?, voltage = ?, current = ?, power = ?,
                consumption_kwh = ?, status_id = ?
            WHERE id = ? AND end_time IS NULL
            "#,
        )
        .bind(Self::now_hh_mm_ss())
        .bind(electrical.voltage)
        .bind(electrical.current)
        .bind(electrical.power)
        .bind(consumption_kwh)
        .bind(status.id())
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .context("close_cycle failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Seeding
    // ----------------------------

    pub async fn upsert_device(&self, d: &NewDevice) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO modbus_device (slave_id, name, connection, category, active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(slave_id) DO UPDATE SET
              name=excluded.name,
              connection=excluded.connection,
              category=excluded.category,
              active=excluded.active
            RETURNING id
            "#,
        )
        .bind(d.slave_id)
        .bind(&d.name)
        .bind(&d.connection)
        .bind(&d.category)
        .bind(d.active)
        .fetch_one(&self.pool)
        .await
        .context("upsert_device failed")
    }

    pub async fn upsert_register(&self, r: &NewRegister) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO modbus_register (device_id, name, address, function_code, data_type, scale, access)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, function_code, address) DO UPDATE SET
              name=excluded.name,
              data_type=excluded.data_type,
              scale=excluded.scale,
              access=excluded.access
            RETURNING id
            "#,
        )
        .bind(r.device_id)
        .bind(&r.name)
        .bind(r.address)
        .bind(r.function_code)
        .bind(&r.data_type)
        .bind(r.scale)
        .bind(&r.access)
        .fetch_one(&self.pool)
        .await
        .context("upsert_register failed")
    }

    pub async fn upsert_reservoir(&self, r: &NewReservoir) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO reservoir (
              name, capacity_liters, reservoir_type,
              device_id, level_register_id, volume_register_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              capacity_liters=excluded.capacity_liters,
              reservoir_type=excluded.reservoir_type,
              device_id=excluded.device_id,
              level_register_id=excluded.level_register_id,
              volume_register_id=excluded.volume_register_id
            RETURNING id
            "#,
        )
        .bind(&r.name)
        .bind(r.capacity_liters)
        .bind(&r.reservoir_type)
        .bind(r.device_id)
        .bind(r.level_register_id)
        .bind(r.volume_register_id)
        .fetch_one(&self.pool)
        .await
        .context("upsert_reservoir failed")
    }

    pub async fn upsert_thresholds(&self, reservoir_id: i64, lower: f64, upper: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservoir_thresholds (reservoir_id, lower, upper)
            VALUES (?, ?, ?)
            ON CONFLICT(reservoir_id) DO UPDATE SET
              lower=excluded.lower,
              upper=excluded.upper
            "#,
        )
        .bind(reservoir_id)
        .bind(lower)
        .bind(upper)
        .execute(&self.pool)
        .await
        .context("upsert_thresholds failed")?;
        Ok(())
    }

    pub async fn upsert_pump(&self, p: &NewPump) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pump (
              name, rated_power, device_id, actuator_register_id,
              source_reservoir_id, destination_reservoir_id,
              role, rotation_status, group_name
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              rated_power=excluded.rated_power,
              device_id=excluded.device_id,
              actuator_register_id=excluded.actuator_register_id,
              source_reservoir_id=excluded.source_reservoir_id,
              destination_reservoir_id=excluded.destination_reservoir_id,
              role=excluded.role,
              rotation_status=excluded.rotation_status,
              group_name=excluded.group_name
            RETURNING id
            "#,
        )
        .bind(&p.name)
        .bind(&p.rated_power)
        .bind(p.device_id)
        .bind(p.actuator_register_id)
        .bind(p.source_reservoir_id)
        .bind(p.destination_reservoir_id)
        .bind(&p.role)
        .bind(&p.rotation_status)
        .bind(&p.group_name)
        .fetch_one(&self.pool)
        .await
        .context("upsert_pump failed")
    }

    /// Insert or replace a rule together with its conditions and actions.
    pub async fn upsert_rule(&self, r: &NewRule) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("upsert_rule: begin failed")?;

        let rule_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rule (name, description, enabled, priority, stop_on_trigger)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              description=excluded.description,
              enabled=excluded.enabled,
              priority=excluded.priority,
              stop_on_trigger=excluded.stop_on_trigger
            RETURNING id
            "#,
        )
        .bind(&r.name)
        .bind(&r.description)
        .bind(r.enabled)
        .bind(r.priority)
        .bind(r.stop_on_trigger)
        .fetch_one(&mut *tx)
        .await
        .context("upsert_rule failed")?;

        sqlx::query("DELETE FROM rule_condition WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await
            .context("upsert_rule: clear conditions failed")?;
        sqlx::query("DELETE FROM rule_action WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await
            .context("upsert_rule: clear actions failed")?;

        for (position, c) in r.conditions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rule_condition (rule_id, position, left_register_id, operator, right_value)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(rule_id)
            .bind(position as i64)
            .bind(c.left_register_id)
            .bind(&c.operator)
            .bind(c.right_value)
            .execute(&mut *tx)
            .await
            .context("upsert_rule: insert condition failed")?;
        }

        for (position, a) in r.actions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rule_action (rule_id, position, target_register_id, write_value)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(rule_id)
            .bind(position as i64)
            .bind(a.target_register_id)
            .bind(a.write_value)
            .execute(&mut *tx)
            .await
            .context("upsert_rule: insert action failed")?;
        }

        tx.commit().await.context("upsert_rule: commit failed")?;
        Ok(rule_id)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[cfg(test)]
impl Db {
    pub async fn memory() -> Self {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    pub async fn cycles_for_pump(&self, pump_id: i64) -> Result<Vec<Acionamento>> {
        sqlx::query_as::<_, Acionamento>(
            r#"
            SELECT id, pump_id, start_date, start_time, end_time,
                   voltage, current, power, consumption_kwh, status_id
            FROM acionamento
            WHERE pump_id = ?
            ORDER BY id
            "#,
        )
        .bind(pump_id)
        .fetch_all(&self.pool)
        .await
        .context("cycles_for_pump failed")
    }

    pub async fn level_reading_count(&self, reservoir_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM level_reading WHERE reservoir_id = ?")
            .bind(reservoir_id)
            .fetch_one(&self.pool)
            .await
            .context("level_reading_count failed")
    }

    pub async fn rule_log_entries(&self, rule_id: i64) -> Result<Vec<(bool, i64)>> {
        sqlx::query_as::<_, (bool, i64)>(
            "SELECT conditions_met, actions_executed FROM rule_log WHERE rule_id = ? ORDER BY id",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .context("rule_log_entries failed")
    }

    pub async fn device_status(&self, device_id: i64) -> Result<(String, Option<String>)> {
        sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT status, last_seen FROM modbus_device WHERE id = ?",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .context("device_status failed")
    }

    pub async fn set_device_active(&self, device_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE modbus_device SET active = ? WHERE id = ?")
            .bind(active)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("set_device_active failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn device(db: &Db, slave_id: i64, category: &str) -> i64 {
        db.upsert_device(&NewDevice {
            slave_id,
            name: format!("dev{slave_id}"),
            connection: None,
            category: category.into(),
            active: true,
        })
        .await
        .unwrap()
    }

    fn register(device_id: i64, name: &str, address: i64, fc: i64) -> NewRegister {
        NewRegister {
            device_id,
            name: name.into(),
            address,
            function_code: fc,
            data_type: "float32".into(),
            scale: 1.0,
            access: "R".into(),
        }
    }

    #[tokio::test]
    async fn register_carries_owning_slave_id() {
        let db = Db::memory().await;
        let dev = device(&db, 7, "reservoir").await;
        let id = db.upsert_register(&register(dev, "Nível", 30001, 4)).await.unwrap();

        let reg = db.get_register(id).await.unwrap().unwrap();
        assert_eq!(reg.slave_id, 7);
        assert_eq!(reg.kind(), Some(RegisterKind::InputRegister));
        assert_eq!(reg.data_type(), Ok(DataType::Float32));
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let db = Db::memory().await;
        let a = device(&db, 2, "reservoir").await;
        let b = device(&db, 2, "reservoir").await;
        assert_eq!(a, b);

        let r1 = db.upsert_register(&register(a, "Nível", 30001, 4)).await.unwrap();
        let r2 = db.upsert_register(&register(a, "Nivel", 30001, 4)).await.unwrap();
        assert_eq!(r1, r2);
        assert_eq!(db.load_registers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn max_address_per_device_and_function() {
        let db = Db::memory().await;
        let dev = device(&db, 1, "pump").await;
        assert_eq!(db.max_address(dev, 3).await.unwrap(), None);

        db.upsert_register(&register(dev, "Tensão", 40100, 3)).await.unwrap();
        db.upsert_register(&register(dev, "Consumo", 40105, 3)).await.unwrap();
        db.upsert_register(&register(dev, "Nível", 30001, 4)).await.unwrap();

        assert_eq!(db.max_address(dev, 3).await.unwrap(), Some(40105));
        assert_eq!(db.max_address(dev, 4).await.unwrap(), Some(30001));
        assert_eq!(db.max_address(dev, 1).await.unwrap(), None);

        assert_eq!(db.next_free_address(dev, RegisterKind::HoldingRegister).await.unwrap(), 40106);
        assert_eq!(db.next_free_address(dev, RegisterKind::Coil).await.unwrap(), 1);
        assert_eq!(db.next_free_address(dev, RegisterKind::DiscreteInput).await.unwrap(), 10001);

        assert_eq!(db.register_address(dev, 3, "Consumo").await.unwrap(), Some(40105));
        assert_eq!(db.register_address(dev, 4, "Consumo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exhausted_address_space_is_an_error() {
        let db = Db::memory().await;
        let dev = device(&db, 1, "pump").await;
        db.upsert_register(&register(dev, "Último", i64::from(u16::MAX), 3)).await.unwrap();

        let err = db.next_free_address(dev, RegisterKind::HoldingRegister).await.unwrap_err();
        assert!(err.to_string().contains("no free holding_register address"), "got: {err}");
    }

    #[tokio::test]
    async fn enabled_rules_by_descending_priority() {
        let db = Db::memory().await;
        let dev = device(&db, 1, "pump").await;
        let reg = db.upsert_register(&register(dev, "Tensão", 40100, 3)).await.unwrap();

        for (name, priority, enabled) in [("low", 1, true), ("high", 10, true), ("off", 50, false)] {
            db.upsert_rule(&NewRule {
                name: name.into(),
                description: String::new(),
                enabled,
                priority,
                stop_on_trigger: false,
                conditions: vec![
                    NewCondition { left_register_id: reg, operator: ">".into(), right_value: 1.0 },
                    NewCondition { left_register_id: reg, operator: "<".into(), right_value: 9.0 },
                ],
                actions: vec![NewAction { target_register_id: reg, write_value: 5.0 }],
            })
            .await
            .unwrap();
        }

        let rules = db.load_enabled_rules().await.unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(rules[0].conditions.len(), 2);
        assert_eq!(rules[0].conditions[0].operator, ">");
        assert_eq!(rules[0].conditions[1].operator, "<");
        assert_eq!(rules[0].actions.len(), 1);
    }

    #[tokio::test]
    async fn reseeding_a_rule_replaces_children() {
        let db = Db::memory().await;
        let dev = device(&db, 1, "pump").await;
        let reg = db.upsert_register(&register(dev, "Tensão", 40100, 3)).await.unwrap();

        let mut rule = NewRule {
            name: "r".into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            stop_on_trigger: false,
            conditions: vec![NewCondition { left_register_id: reg, operator: ">".into(), right_value: 1.0 }],
            actions: vec![],
        };
        db.upsert_rule(&rule).await.unwrap();
        rule.conditions[0].operator = "<=".into();
        db.upsert_rule(&rule).await.unwrap();

        let rules = db.load_enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].conditions.len(), 1);
        assert_eq!(rules[0].conditions[0].operator, "<=");
    }

    #[tokio::test]
    async fn only_one_open_cycle_per_pump() {
        let db = Db::memory().await;
        let pump = db
            .upsert_pump(&NewPump {
                name: "P1".into(),
                rated_power: "1/3".into(),
                device_id: None,
                actuator_register_id: None,
                source_reservoir_id: None,
                destination_reservoir_id: None,
                role: "PRINCIPAL".into(),
                rotation_status: "ACTIVE".into(),
                group_name: None,
            })
            .await
            .unwrap();

        let id = db.insert_cycle(pump).await.unwrap();
        assert_eq!(db.open_cycle(pump).await.unwrap(), Some(id));
        assert!(db.insert_cycle(pump).await.is_err());

        assert!(db.close_cycle(id, Electrical::default(), 1.5, CycleStatus::Finished).await.unwrap());
        assert!(!db.close_cycle(id, Electrical::default(), 2.0, CycleStatus::Finished).await.unwrap());
        assert_eq!(db.open_cycle(pump).await.unwrap(), None);

        let cycles = db.cycles_for_pump(pump).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].consumption_kwh, Some(1.5));
        assert_eq!(cycles[0].status_id, CycleStatus::Finished.id());
    }

    #[tokio::test]
    async fn device_status_keeps_last_seen_when_offline() {
        let db = Db::memory().await;
        let dev = device(&db, 3, "reservoir").await;

        db.update_device_status(dev, DeviceStatus::Online).await.unwrap();
        let (status, seen) = db.device_status(dev).await.unwrap();
        assert_eq!(status, "Online");
        assert!(seen.is_some());

        db.update_device_status(dev, DeviceStatus::Offline).await.unwrap();
        let (status, seen_after) = db.device_status(dev).await.unwrap();
        assert_eq!(status, "Offline");
        assert_eq!(seen_after, seen);
    }

    #[test]
    fn clock_formats() {
        let d = Db::today_yyyy_mm_dd();
        assert_eq!(d.len(), 10);
        assert_eq!(&d[4..5], "-");
        let t = Db::now_hh_mm_ss();
        assert_eq!(t.len(), 8);
        assert_eq!(&t[2..3], ":");
    }
}
