//! TOML config file loading, validation, and database seeding for the
//! station's devices, registers, reservoirs, pumps and rules.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::address::RegisterKind;
use crate::codec::DataType;
use crate::db::{
    Db, NewAction, NewCondition, NewDevice, NewPump, NewRegister, NewReservoir, NewRule,
};
use crate::rules::Operator;
use crate::symbolic::{self, ResolveError, ReservoirType, VariableRef};
use crate::threshold::parse_rated_power;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub registers: Vec<RegisterEntry>,
    #[serde(default)]
    pub reservoirs: Vec<ReservoirEntry>,
    #[serde(default)]
    pub pumps: Vec<PumpEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: SerialParity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/tmp/ttyS1".into(),
            baud_rate: 115_200,
            parity: SerialParity::None,
            data_bits: 8,
            stop_bits: 1,
            timeout_ms: 2000,
            retries: 3,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full sqlx connection string; takes precedence over `schema`.
    pub url: Option<String>,
    /// Database file stem used when no url is given.
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: "pumpstation".into(),
        }
    }
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}.db?mode=rwc", self.schema),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Fixed hysteresis on the two reservoir levels.
    #[default]
    Threshold,
    /// Database-defined condition/action rules.
    Rules,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub strategy: Strategy,
    pub cycle_interval_sec: u64,
    pub status_interval_sec: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Threshold,
            cycle_interval_sec: 10,
            status_interval_sec: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub slave_id: i64,
    pub category: String,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterEntry {
    /// Name of the owning device.
    pub device: String,
    pub name: String,
    /// Protocol address; the next free one for the function code when absent.
    #[serde(default)]
    pub address: Option<i64>,
    pub function_code: i64,
    pub data_type: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_access")]
    pub access: String,
}

#[derive(Debug, Deserialize)]
pub struct ReservoirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub reservoir_type: String,
    pub capacity_liters: f64,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub level_register: Option<String>,
    #[serde(default)]
    pub volume_register: Option<String>,
    /// Threshold percentages.
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PumpEntry {
    pub name: String,
    /// Horsepower, plain ("0.5") or as a fraction ("1/3").
    pub rated_power: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub actuator_register: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_rotation_status")]
    pub rotation_status: String,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RuleEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub stop_on_trigger: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionEntry>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

/// A register named either symbolically (`variable`) or by
/// `device` + `register` name.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterRef {
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub register: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConditionEntry {
    #[serde(flatten)]
    pub left: RegisterRef,
    pub operator: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
pub struct ActionEntry {
    #[serde(flatten)]
    pub target: RegisterRef,
    pub value: f64,
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_access() -> String {
    "R".into()
}

fn default_role() -> String {
    "PRINCIPAL".into()
}

fn default_rotation_status() -> String {
    "STANDBY".into()
}

const DEVICE_CATEGORIES: &[&str] = &["reservoir", "pump", "sensor", "other"];
const PUMP_ROLES: &[&str] = &["PRINCIPAL", "RESERVA"];
const ROTATION_STATUSES: &[&str] = &["ACTIVE", "STANDBY"];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_serial(&mut errors);
        self.validate_control(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_registers(&mut errors);
        self.validate_reservoirs(&mut errors);
        self.validate_pumps(&mut errors);
        self.validate_rules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_serial(&self, errors: &mut Vec<String>) {
        let s = &self.serial;
        if s.port.trim().is_empty() {
            errors.push("serial: port is empty".into());
        }
        if s.baud_rate == 0 {
            errors.push("serial: baud_rate must be positive".into());
        }
        if !(5..=8).contains(&s.data_bits) {
            errors.push(format!("serial: data_bits {} out of range [5, 8]", s.data_bits));
        }
        if !(1..=2).contains(&s.stop_bits) {
            errors.push(format!("serial: stop_bits must be 1 or 2, got {}", s.stop_bits));
        }
        if s.timeout_ms == 0 {
            errors.push("serial: timeout_ms must be positive".into());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        if self.control.cycle_interval_sec == 0 {
            errors.push("control: cycle_interval_sec must be positive".into());
        }
        if self.control.status_interval_sec == 0 {
            errors.push("control: status_interval_sec must be positive".into());
        }
    }

    fn device_names(&self) -> HashSet<&str> {
        self.devices.iter().map(|d| d.name.as_str()).collect()
    }

    /// Whether `device` declares a register called `register` in this file.
    fn has_register(&self, device: &str, register: &str) -> bool {
        self.registers
            .iter()
            .any(|r| r.device == device && r.name.eq_ignore_ascii_case(register))
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_slaves: HashSet<i64> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.name.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.name)
                }
            };

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&d.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if !(1..=247).contains(&d.slave_id) {
                errors.push(format!(
                    "{}: slave_id {} out of range [1, 247]",
                    ctx(),
                    d.slave_id
                ));
            } else if !seen_slaves.insert(d.slave_id) {
                errors.push(format!(
                    "{}: slave_id {} is already used by another device",
                    ctx(),
                    d.slave_id
                ));
            }

            if !DEVICE_CATEGORIES.contains(&d.category.as_str()) {
                errors.push(format!(
                    "{}: unknown category '{}' (allowed: {})",
                    ctx(),
                    d.category,
                    DEVICE_CATEGORIES.join(", ")
                ));
            }
        }
    }

    fn validate_registers(&self, errors: &mut Vec<String>) {
        let devices = self.device_names();
        let mut seen: HashSet<(&str, i64, i64)> = HashSet::new();

        for (i, r) in self.registers.iter().enumerate() {
            let ctx = || {
                if r.name.is_empty() {
                    format!("registers[{i}]")
                } else {
                    format!("register '{}/{}'", r.device, r.name)
                }
            };

            if r.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if !devices.contains(r.device.as_str()) {
                errors.push(format!(
                    "{}: device '{}' does not match any defined device",
                    ctx(),
                    r.device
                ));
            }

            let kind = RegisterKind::from_function_code(r.function_code);
            if kind.is_none() {
                errors.push(format!(
                    "{}: function_code {} must be 1, 2, 3 or 4",
                    ctx(),
                    r.function_code
                ));
            }

            match (r.data_type.parse::<DataType>(), kind) {
                (Err(e), _) => errors.push(format!("{}: {e}", ctx())),
                (Ok(dt), Some(k)) if k.is_bit() && dt != DataType::Boolean => {
                    errors.push(format!("{}: {k} registers hold booleans, not {dt}", ctx()));
                }
                _ => {}
            }

            match r.access.as_str() {
                "R" => {}
                "W" => {
                    if let Some(k) = kind.filter(|k| !k.is_writable()) {
                        errors.push(format!("{}: {k} registers are read-only", ctx()));
                    }
                }
                other => errors.push(format!("{}: access '{other}' must be R or W", ctx())),
            }

            if !r.scale.is_finite() || r.scale == 0.0 {
                errors.push(format!("{}: scale must be a non-zero number", ctx()));
            }

            if let Some(address) = r.address {
                if !(0..=i64::from(u16::MAX)).contains(&address) {
                    errors.push(format!("{}: address {address} out of range", ctx()));
                } else if !seen.insert((r.device.as_str(), r.function_code, address)) {
                    errors.push(format!(
                        "{}: address {address} already used on this device for function code {}",
                        ctx(),
                        r.function_code
                    ));
                }
            }
        }
    }

    fn validate_reservoirs(&self, errors: &mut Vec<String>) {
        let devices = self.device_names();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, r) in self.reservoirs.iter().enumerate() {
            let ctx = || {
                if r.name.is_empty() {
                    format!("reservoirs[{i}]")
                } else {
                    format!("reservoir '{}'", r.name)
                }
            };

            if r.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&r.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if let Err(e) = r.reservoir_type.parse::<ReservoirType>() {
                errors.push(format!("{}: {e}", ctx()));
            }

            if !(r.capacity_liters.is_finite() && r.capacity_liters > 0.0) {
                errors.push(format!(
                    "{}: capacity_liters must be positive, got {}",
                    ctx(),
                    r.capacity_liters
                ));
            }

            match &r.device {
                Some(dev) if !devices.contains(dev.as_str()) => {
                    errors.push(format!(
                        "{}: device '{dev}' does not match any defined device",
                        ctx()
                    ));
                }
                Some(dev) => {
                    for (field, reg) in [
                        ("level_register", &r.level_register),
                        ("volume_register", &r.volume_register),
                    ] {
                        if let Some(reg) = reg {
                            if !self.has_register(dev, reg) {
                                errors.push(format!(
                                    "{}: {field} '{reg}' is not a register of device '{dev}'",
                                    ctx()
                                ));
                            }
                        }
                    }
                }
                None => {
                    if r.level_register.is_some() || r.volume_register.is_some() {
                        errors.push(format!(
                            "{}: level_register/volume_register need a device",
                            ctx()
                        ));
                    }
                }
            }

            match (r.lower, r.upper) {
                (None, None) => {}
                (Some(lower), Some(upper)) => {
                    for (field, v) in [("lower", lower), ("upper", upper)] {
                        if !(0.0..=100.0).contains(&v) {
                            errors.push(format!("{}: {field} {v} out of range [0, 100]", ctx()));
                        }
                    }
                    if lower >= upper {
                        errors.push(format!(
                            "{}: upper ({upper}) must be greater than lower ({lower})",
                            ctx()
                        ));
                    }
                }
                _ => errors.push(format!("{}: lower and upper must be set together", ctx())),
            }
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let devices = self.device_names();
        let reservoirs: HashSet<&str> = self.reservoirs.iter().map(|r| r.name.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, p) in self.pumps.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("pumps[{i}]")
                } else {
                    format!("pump '{}'", p.name)
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&p.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if parse_rated_power(&p.rated_power).is_none() {
                errors.push(format!(
                    "{}: rated_power '{}' is neither a number nor a fraction",
                    ctx(),
                    p.rated_power
                ));
            }

            match (&p.device, &p.actuator_register) {
                (Some(dev), _) if !devices.contains(dev.as_str()) => {
                    errors.push(format!(
                        "{}: device '{dev}' does not match any defined device",
                        ctx()
                    ));
                }
                (Some(dev), Some(reg)) if !self.has_register(dev, reg) => {
                    errors.push(format!(
                        "{}: actuator_register '{reg}' is not a register of device '{dev}'",
                        ctx()
                    ));
                }
                (None, Some(_)) => {
                    errors.push(format!("{}: actuator_register needs a device", ctx()));
                }
                _ => {}
            }

            for (field, res) in [("source", &p.source), ("destination", &p.destination)] {
                if let Some(res) = res {
                    if !reservoirs.contains(res.as_str()) {
                        errors.push(format!(
                            "{}: {field} '{res}' does not match any defined reservoir",
                            ctx()
                        ));
                    }
                }
            }

            if !PUMP_ROLES.contains(&p.role.as_str()) {
                errors.push(format!("{}: role '{}' must be PRINCIPAL or RESERVA", ctx(), p.role));
            }
            if !ROTATION_STATUSES.contains(&p.rotation_status.as_str()) {
                errors.push(format!(
                    "{}: rotation_status '{}' must be ACTIVE or STANDBY",
                    ctx(),
                    p.rotation_status
                ));
            }
        }
    }

    fn validate_register_ref(&self, ctx: &str, r: &RegisterRef, errors: &mut Vec<String>) {
        match (&r.variable, &r.device, &r.register) {
            (Some(var), None, None) => {
                if let Err(e) = var.parse::<VariableRef>() {
                    errors.push(format!("{ctx}: {e}"));
                }
            }
            (None, Some(dev), Some(reg)) => {
                if !self.has_register(dev, reg) {
                    errors.push(format!("{ctx}: '{dev}/{reg}' is not a defined register"));
                }
            }
            _ => errors.push(format!(
                "{ctx}: set either `variable` or both `device` and `register`"
            )),
        }
    }

    fn validate_rules(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, r) in self.rules.iter().enumerate() {
            let ctx = if r.name.is_empty() {
                format!("rules[{i}]")
            } else {
                format!("rule '{}'", r.name)
            };

            if r.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            } else if !seen.insert(&r.name) {
                errors.push(format!("{ctx}: duplicate name"));
            }

            if r.actions.is_empty() {
                errors.push(format!("{ctx}: has no actions"));
            }

            for (j, c) in r.conditions.iter().enumerate() {
                let cctx = format!("{ctx} condition {}", j + 1);
                if let Err(e) = c.operator.parse::<Operator>() {
                    errors.push(format!("{cctx}: {e}"));
                }
                if !c.value.is_finite() {
                    errors.push(format!("{cctx}: value must be a finite number"));
                }
                self.validate_register_ref(&cctx, &c.left, errors);
            }

            for (j, a) in r.actions.iter().enumerate() {
                let actx = format!("{ctx} action {}", j + 1);
                if !a.value.is_finite() {
                    errors.push(format!("{actx}: value must be a finite number"));
                }
                self.validate_register_ref(&actx, &a.target, errors);
                if let (Some(dev), Some(reg)) = (&a.target.device, &a.target.register) {
                    let writable = self.registers.iter().any(|x| {
                        &x.device == dev && x.name.eq_ignore_ascii_case(reg) && x.access == "W"
                    });
                    if self.has_register(dev, reg) && !writable {
                        errors.push(format!("{actx}: '{dev}/{reg}' is not writable"));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Ids assigned while seeding, by config name.
#[derive(Default)]
struct Seeded {
    devices: HashMap<String, i64>,
    /// (device name, lower-cased register name) -> register id
    registers: HashMap<(String, String), i64>,
    reservoirs: HashMap<String, i64>,
}

impl Seeded {
    fn device(&self, name: &str) -> Result<i64> {
        self.devices
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown device '{name}'"))
    }

    fn register(&self, device: &str, name: &str) -> Result<i64> {
        self.registers
            .get(&(device.to_string(), name.to_lowercase()))
            .copied()
            .ok_or_else(|| anyhow!("unknown register '{device}/{name}'"))
    }

    fn optional_register(&self, device: Option<&String>, name: Option<&String>) -> Result<Option<i64>> {
        match (device, name) {
            (Some(dev), Some(reg)) => self.register(dev, reg).map(Some),
            _ => Ok(None),
        }
    }

    fn reservoir(&self, name: Option<&String>) -> Result<Option<i64>> {
        name.map(|n| {
            self.reservoirs
                .get(n)
                .copied()
                .ok_or_else(|| anyhow!("unknown reservoir '{n}'"))
        })
        .transpose()
    }

    async fn rule_registers(&self, db: &Db, r: &RuleEntry) -> Result<(Vec<NewCondition>, Vec<NewAction>)> {
        let mut conditions = Vec::with_capacity(r.conditions.len());
        for (j, c) in r.conditions.iter().enumerate() {
            let left_register_id = self
                .resolve(db, &c.left)
                .await
                .with_context(|| format!("rule '{}' condition {}", r.name, j + 1))?;
            conditions.push(NewCondition {
                left_register_id,
                operator: c.operator.clone(),
                right_value: c.value,
            });
        }

        let mut actions = Vec::with_capacity(r.actions.len());
        for (j, a) in r.actions.iter().enumerate() {
            let target_register_id = self
                .resolve(db, &a.target)
                .await
                .with_context(|| format!("rule '{}' action {}", r.name, j + 1))?;
            actions.push(NewAction {
                target_register_id,
                write_value: a.value,
            });
        }
        Ok((conditions, actions))
    }

    async fn resolve(&self, db: &Db, r: &RegisterRef) -> Result<i64> {
        match (&r.variable, &r.device, &r.register) {
            (Some(var), _, _) => {
                let var: VariableRef = var.parse()?;
                Ok(symbolic::resolve(db, &var).await?.id)
            }
            (None, Some(dev), Some(reg)) => self.register(dev, reg),
            _ => bail!("register reference is incomplete"),
        }
    }
}

fn is_unresolved(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ResolveError>(),
        Some(ResolveError::NoMatch(_) | ResolveError::Unparseable(_))
    )
}

/// Upsert everything declared in the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut seeded = Seeded::default();

    for d in &config.devices {
        let id = db
            .upsert_device(&NewDevice {
                slave_id: d.slave_id,
                name: d.name.clone(),
                connection: d.connection.clone(),
                category: d.category.clone(),
                active: d.active,
            })
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.name))?;
        seeded.devices.insert(d.name.clone(), id);
    }

    for r in &config.registers {
        let device_id = seeded.device(&r.device)?;
        let address = match r.address {
            Some(a) => a,
            None => match db.register_address(device_id, r.function_code, &r.name).await? {
                Some(existing) => existing,
                None => {
                    let kind = RegisterKind::from_function_code(r.function_code)
                        .ok_or_else(|| anyhow!("invalid function code {}", r.function_code))?;
                    i64::from(db.next_free_address(device_id, kind).await?)
                }
            },
        };
        let data_type: DataType = r.data_type.parse().map_err(|e: String| anyhow!(e))?;
        let id = db
            .upsert_register(&NewRegister {
                device_id,
                name: r.name.clone(),
                address,
                function_code: r.function_code,
                data_type: data_type.to_string(),
                scale: r.scale,
                access: r.access.clone(),
            })
            .await
            .with_context(|| format!("failed to upsert register '{}/{}'", r.device, r.name))?;
        seeded
            .registers
            .insert((r.device.clone(), r.name.to_lowercase()), id);
    }

    for r in &config.reservoirs {
        let reservoir_type: ReservoirType = r.reservoir_type.parse().map_err(|e: String| anyhow!(e))?;
        let device_id = r.device.as_deref().map(|d| seeded.device(d)).transpose()?;
        let id = db
            .upsert_reservoir(&NewReservoir {
                name: r.name.clone(),
                capacity_liters: r.capacity_liters,
                reservoir_type: reservoir_type.as_str().to_string(),
                device_id,
                level_register_id: seeded
                    .optional_register(r.device.as_ref(), r.level_register.as_ref())?,
                volume_register_id: seeded
                    .optional_register(r.device.as_ref(), r.volume_register.as_ref())?,
            })
            .await
            .with_context(|| format!("failed to upsert reservoir '{}'", r.name))?;
        if let (Some(lower), Some(upper)) = (r.lower, r.upper) {
            db.upsert_thresholds(id, lower, upper)
                .await
                .with_context(|| format!("failed to upsert thresholds for '{}'", r.name))?;
        }
        seeded.reservoirs.insert(r.name.clone(), id);
    }

    for p in &config.pumps {
        let device_id = p.device.as_deref().map(|d| seeded.device(d)).transpose()?;
        db.upsert_pump(&NewPump {
            name: p.name.clone(),
            rated_power: p.rated_power.clone(),
            device_id,
            actuator_register_id: seeded
                .optional_register(p.device.as_ref(), p.actuator_register.as_ref())?,
            source_reservoir_id: seeded.reservoir(p.source.as_ref())?,
            destination_reservoir_id: seeded.reservoir(p.destination.as_ref())?,
            role: p.role.clone(),
            rotation_status: p.rotation_status.clone(),
            group_name: p.group.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert pump '{}'", p.name))?;
    }

    let mut skipped_rules = 0;
    for r in &config.rules {
        let (conditions, actions) = match seeded.rule_registers(db, r).await {
            Ok(resolved) => resolved,
            // A variable with no matching register only costs that rule.
            Err(e) if is_unresolved(&e) => {
                tracing::warn!(rule = %r.name, "rule not seeded: {e:#}");
                skipped_rules += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        db.upsert_rule(&NewRule {
            name: r.name.clone(),
            description: r.description.clone(),
            enabled: r.enabled,
            priority: r.priority,
            stop_on_trigger: r.stop_on_trigger,
            conditions,
            actions,
        })
        .await
        .with_context(|| format!("failed to upsert rule '{}'", r.name))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        registers = config.registers.len(),
        reservoirs = config.reservoirs.len(),
        pumps = config.pumps.len(),
        rules = config.rules.len() - skipped_rules,
        skipped_rules,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
