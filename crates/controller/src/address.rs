//! Modicon register addressing.
//!
//! Configured registers carry "protocol" addresses where the leading digit
//! encodes the register class (coils from 1, discrete inputs from 10001,
//! input registers from 30001, holding registers from 40001).  The wire
//! protocol wants a zero-based offset within the class.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Register class for a read function code (1-4).
    pub fn from_function_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Coil),
            2 => Some(Self::DiscreteInput),
            3 => Some(Self::HoldingRegister),
            4 => Some(Self::InputRegister),
            _ => None,
        }
    }

    pub fn function_code(self) -> u8 {
        match self {
            Self::Coil => 1,
            Self::DiscreteInput => 2,
            Self::HoldingRegister => 3,
            Self::InputRegister => 4,
        }
    }

    /// First protocol address of the class.
    pub fn base_address(self) -> u16 {
        match self {
            Self::Coil => 1,
            Self::DiscreteInput => 10001,
            Self::HoldingRegister => 40001,
            Self::InputRegister => 30001,
        }
    }

    /// Single-bit classes are read as bits, the others as 16-bit words.
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coil => write!(f, "coil"),
            Self::DiscreteInput => write!(f, "discrete_input"),
            Self::HoldingRegister => write!(f, "holding_register"),
            Self::InputRegister => write!(f, "input_register"),
        }
    }
}

/// Convert a protocol address into the zero-based offset sent on the wire.
///
/// An unknown kind leaves the address untouched, and so does an address that
/// is already below its class base (it is taken to be zero-based already).
pub fn physical_offset(address: u16, kind: Option<RegisterKind>) -> u16 {
    match kind {
        Some(kind) => {
            let base = kind.base_address();
            if address >= base {
                address - base
            } else {
                address
            }
        }
        None => address,
    }
}

/// Next free protocol address for a (device, function code) pair given the
/// highest address already in use there.  `None` once the address space
/// above `existing_max` is used up.
pub fn next_free_address(existing_max: Option<u16>, kind: RegisterKind) -> Option<u16> {
    match existing_max {
        Some(max) => max.checked_add(1),
        None => Some(kind.base_address()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
