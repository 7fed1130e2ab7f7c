use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::fmt;

/// The closed set of region types a device can be built from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegionKind {
    Semiconductor,
    Insulator,
    Electrode,
    Vacuum,
    Pml,
}

impl RegionKind {
    /// Ordering used to sort the regions sharing a boundary node: index 0 is the reference region
    pub fn reference_priority(&self) -> u8 {
        match self {
            Self::Insulator => 0,
            Self::Electrode => 1,
            Self::Semiconductor => 2,
            Self::Vacuum => 3,
            Self::Pml => 4,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "semiconductor" => Some(Self::Semiconductor),
            "insulator" => Some(Self::Insulator),
            "electrode" | "conductor" => Some(Self::Electrode),
            "vacuum" => Some(Self::Vacuum),
            "pml" => Some(Self::Pml),
            _ => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Semiconductor => "semiconductor",
            Self::Insulator => "insulator",
            Self::Electrode => "electrode",
            Self::Vacuum => "vacuum",
            Self::Pml => "pml",
        };
        write!(f, "{}", name)
    }
}

/// Unknowns which can be solved for at a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variable {
    Potential,
    ElectronDensity,
    HoleDensity,
    Temperature,
    ElectronTemperature,
    HoleTemperature,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Potential => "potential",
            Self::ElectronDensity => "electron density",
            Self::HoleDensity => "hole density",
            Self::Temperature => "lattice temperature",
            Self::ElectronTemperature => "electron temperature",
            Self::HoleTemperature => "hole temperature",
        };
        write!(f, "{}", name)
    }
}

/// Optional physical models of a region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdvancedModel {
    /// Solve for the lattice temperature
    pub enable_tl: bool,
    /// Solve for the electron temperature (semiconductors only)
    pub enable_tn: bool,
    /// Solve for the hole temperature (semiconductors only)
    pub enable_tp: bool,
}

/// A material region of the device
///
/// The region fixes which [`Variable`]s are solved on its nodes and in which order they sit
/// inside a node's block of unknowns.
#[derive(Clone, Debug)]
pub struct Region {
    pub id: usize,
    pub name: String,
    kind: RegionKind,
    advanced: AdvancedModel,
    variables: Vec<Variable>,
    material: BTreeMap<String, f64>,
}

impl Region {
    pub fn new(id: usize, name: impl Into<String>, kind: RegionKind, advanced: AdvancedModel) -> Self {
        let variables = match kind {
            RegionKind::Semiconductor => {
                let mut vars = vec![
                    Variable::Potential,
                    Variable::ElectronDensity,
                    Variable::HoleDensity,
                ];
                if advanced.enable_tl {
                    vars.push(Variable::Temperature);
                }
                if advanced.enable_tn {
                    vars.push(Variable::ElectronTemperature);
                }
                if advanced.enable_tp {
                    vars.push(Variable::HoleTemperature);
                }
                vars
            }
            RegionKind::Insulator | RegionKind::Electrode => {
                if advanced.enable_tl {
                    vec![Variable::Potential, Variable::Temperature]
                } else {
                    vec![Variable::Potential]
                }
            }
            RegionKind::Vacuum | RegionKind::Pml => Vec::new(),
        };

        Self {
            id,
            name: name.into(),
            kind,
            advanced,
            variables,
            material: BTreeMap::new(),
        }
    }

    /// Set a material coefficient (e.g. `"permittivity"`, `"thermal_conductivity"`)
    pub fn with_property(mut self, name: impl Into<String>, value: f64) -> Self {
        self.material.insert(name.into(), value);
        self
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn advanced_model(&self) -> &AdvancedModel {
        &self.advanced
    }

    /// Number of unknowns at each node of this region
    pub fn n_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Position of a variable inside a node's block of unknowns
    pub fn variable_offset(&self, variable: Variable) -> Result<usize> {
        self.variables
            .iter()
            .position(|v| *v == variable)
            .ok_or_else(|| Error::MissingVariable {
                region: self.name.clone(),
                variable: variable.to_string(),
            })
    }

    pub fn material_property(&self, name: &str) -> Option<f64> {
        self.material.get(name).copied()
    }

    /// Absolute permittivity; defaults to 1 when the material does not set one
    pub fn permittivity(&self) -> f64 {
        self.material_property("permittivity").unwrap_or(1.0)
    }

    pub fn thermal_conductivity(&self) -> f64 {
        self.material_property("thermal_conductivity").unwrap_or(0.0)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}, {} variables)", self.name, self.kind, self.variables.len())
    }
}
