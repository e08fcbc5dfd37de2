//! Symbolic rule variables.
//!
//! A rule author refers to "the level of the accumulation reservoir" or
//! "the pump voltage" rather than to a concrete register.  At runtime that is
//! a [`VariableRef`]; the underscore form (`Nivel_Reservatorio_Acumulacao`,
//! `Tensao_Motobomba`) only exists for parsing and printing.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::db::{Db, Register};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservoirType {
    Accumulation,
    Distribution,
}

impl ReservoirType {
    /// Value stored in `reservoir.reservoir_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accumulation => "accumulation",
            Self::Distribution => "distribution",
        }
    }

    fn legacy(self) -> &'static str {
        match self {
            Self::Accumulation => "Acumulacao",
            Self::Distribution => "Distribuicao",
        }
    }
}

impl FromStr for ReservoirType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold(s).as_str() {
            "accumulation" | "acumulacao" => Ok(Self::Accumulation),
            "distribution" | "distribuicao" => Ok(Self::Distribution),
            other => Err(format!("unknown reservoir type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Level,
    Volume,
    Voltage,
    Current,
    Power,
    Consumption,
}

impl Measurement {
    /// Lower-case register-name fragments identifying the measurement,
    /// accented and plain.
    fn fragments(self) -> &'static [&'static str] {
        match self {
            Self::Level => &["nível", "nivel", "level"],
            Self::Volume => &["volume"],
            Self::Voltage => &["tensão", "tensao", "voltage"],
            Self::Current => &["corrente", "current"],
            Self::Power => &["potência", "potencia", "power"],
            Self::Consumption => &["consumo", "consumption"],
        }
    }

    /// Whether a register name denotes this measurement.
    pub fn matches(self, register_name: &str) -> bool {
        let name = register_name.to_lowercase();
        self.fragments().iter().any(|f| name.contains(f))
    }

    fn legacy(self) -> &'static str {
        match self {
            Self::Level => "Nivel",
            Self::Volume => "Volume",
            Self::Voltage => "Tensao",
            Self::Current => "Corrente",
            Self::Power => "Potencia",
            Self::Consumption => "Consumo",
        }
    }

    fn from_legacy(s: &str) -> Option<Self> {
        match fold(s).as_str() {
            "nivel" | "level" => Some(Self::Level),
            "volume" => Some(Self::Volume),
            "tensao" | "voltage" => Some(Self::Voltage),
            "corrente" | "current" => Some(Self::Current),
            "potencia" | "power" => Some(Self::Power),
            "consumo" | "consumption" => Some(Self::Consumption),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Reservoir(ReservoirType),
    Pump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableRef {
    pub measurement: Measurement,
    pub target: Target,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("'{0}' is not a symbolic variable")]
    Unparseable(String),
    #[error("no register matches {0}")]
    NoMatch(VariableRef),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Lower-case and strip the accents used in the legacy names.
fn fold(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'â' | 'ã' | 'à' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'ô' | 'õ' => 'o',
            'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

impl FromStr for VariableRef {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unparseable = || ResolveError::Unparseable(s.to_string());
        let mut parts = s.split('_');

        let measurement = parts
            .next()
            .and_then(Measurement::from_legacy)
            .ok_or_else(unparseable)?;

        let target = match (parts.next().map(fold).as_deref(), parts.next(), parts.next()) {
            (Some("motobomba" | "pump"), None, _) => Target::Pump,
            (Some("reservatorio" | "reservoir"), Some(kind), None) => {
                Target::Reservoir(kind.parse().map_err(|_| unparseable())?)
            }
            _ => return Err(unparseable()),
        };

        Ok(Self {
            measurement,
            target,
        })
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Pump => write!(f, "{}_Motobomba", self.measurement.legacy()),
            Target::Reservoir(t) => {
                write!(f, "{}_Reservatorio_{}", self.measurement.legacy(), t.legacy())
            }
        }
    }
}

/// First register (lowest id) whose name denotes `measurement`.
pub fn pick(registers: &[Register], measurement: Measurement) -> Option<&Register> {
    registers.iter().find(|r| measurement.matches(&r.name))
}

/// Resolve a symbolic variable to a concrete register.
pub async fn resolve(db: &Db, var: &VariableRef) -> Result<Register, ResolveError> {
    let candidates = match var.target {
        Target::Reservoir(t) => db.registers_for_reservoir_type(t.as_str()).await?,
        Target::Pump => db.registers_for_category("pump").await?,
    };

    let matching: Vec<&Register> = candidates
        .iter()
        .filter(|r| var.measurement.matches(&r.name))
        .collect();

    match matching.as_slice() {
        [] => Err(ResolveError::NoMatch(*var)),
        [first, rest @ ..] => {
            if !rest.is_empty() {
                debug!(variable = %var, register = first.id, candidates = matching.len(), "ambiguous variable, using first match");
            }
            Ok((*first).clone())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
