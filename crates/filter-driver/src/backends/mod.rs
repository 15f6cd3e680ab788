// SPDX-License-Identifier: AGPL-3.0-only

//! Card driver backends
//!
//! Two backends available:
//! - **ADM-XRC2**: vendor driver library, loaded at runtime (real hardware)
//! - **Simulated**: pure Rust model of the card and filter logic (CI, development)

pub mod admxrc2;
pub mod simulated;

pub use admxrc2::Admxrc2Card;
pub use simulated::{Access, FailurePoint, SimConfig, SimProbe, SimRegisters, SimulatedCard};

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Vendor driver library
    #[default]
    Admxrc2,
    /// Simulated card
    Simulated,
}

impl std::str::FromStr for BackendSelection {
    type Err = crate::FilterError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "admxrc2" | "hardware" => Ok(Self::Admxrc2),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(crate::FilterError::invalid_config(format!(
                "unknown backend '{other}' (admxrc2, simulated)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("sim".parse::<BackendSelection>().unwrap(), BackendSelection::Simulated);
        assert_eq!("ADMXRC2".parse::<BackendSelection>().unwrap(), BackendSelection::Admxrc2);
        assert!("vfio".parse::<BackendSelection>().is_err());
    }
}
