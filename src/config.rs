use crate::assembly::{Clock, TimeScheme};
use crate::circuit::Waveform;
use crate::domain::boundary::GateParameters;
use crate::domain::region::{AdvancedModel, Region, RegionKind};
use crate::error::{Error, Result};

use json::JsonValue;
use std::fs::read_to_string;

/// How a gate's external circuit is driven, with the hub referenced by name
#[derive(Clone, Debug, PartialEq)]
pub enum CircuitModeConfig {
    Voltage,
    Current,
    InterConnect { hub: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitConfig {
    pub mode: CircuitModeConfig,
    pub r: f64,
    pub l: f64,
    pub c: f64,
    /// Applied voltage (voltage driven) or current (current driven)
    pub source: Waveform,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GateConfig {
    pub name: String,
    /// Mesh label holding the gate's nodes
    pub label: String,
    pub params: GateParameters,
    pub circuit: CircuitConfig,
}

#[derive(Clone, Debug)]
pub struct RegionConfig {
    pub name: String,
    pub kind: RegionKind,
    pub advanced: AdvancedModel,
    pub material: Vec<(String, f64)>,
}

impl RegionConfig {
    pub fn build(&self, id: usize) -> Region {
        self.material.iter().fold(
            Region::new(id, self.name.clone(), self.kind, self.advanced),
            |region, (name, value)| region.with_property(name.clone(), *value),
        )
    }
}

/// Device description read from a JSON document
///
/// ```text
/// {
///   "regions": [
///     { "name": "oxide", "kind": "insulator", "lattice_temperature": false,
///       "material": { "permittivity": 3.45e-13 } },
///     { "name": "poly", "kind": "electrode" }
///   ],
///   "hubs": ["vdd"],
///   "gates": [
///     { "name": "gate", "label": "gate", "work_function": 4.17, "z_width": 1.0,
///       "circuit": { "mode": "voltage", "r": 0.0, "l": 0.0, "c": 0.0,
///                    "source": { "type": "dc", "value": 1.0 } } }
///   ],
///   "clock": { "transient": true, "dt": 1e-12, "scheme": "bdf2" }
/// }
/// ```
///
/// Region `i` of the list is region `i` of the mesh's elements.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub regions: Vec<RegionConfig>,
    pub hubs: Vec<String>,
    pub gates: Vec<GateConfig>,
    pub clock: Clock,
}

impl SimulationConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let doc = json::parse(contents)?;

        if !doc["regions"].is_array() {
            return Err(Error::Config("'regions' must be an array".into()));
        }
        let regions = doc["regions"]
            .members()
            .map(parse_region)
            .collect::<Result<Vec<_>>>()?;

        let hubs = doc["hubs"]
            .members()
            .map(|hub| {
                hub.as_str()
                    .map(String::from)
                    .ok_or_else(|| Error::Config("hub names must be strings".into()))
            })
            .collect::<Result<Vec<_>>>()?;

        let gates = doc["gates"]
            .members()
            .map(|gate| parse_gate(gate, &hubs))
            .collect::<Result<Vec<_>>>()?;

        let clock = parse_clock(&doc["clock"])?;

        log::info!(
            "configuration: {} regions, {} gates, {} hubs",
            regions.len(),
            gates.len(),
            hubs.len()
        );

        Ok(Self {
            regions,
            hubs,
            gates,
            clock,
        })
    }

    pub fn build_regions(&self) -> Vec<Region> {
        self.regions
            .iter()
            .enumerate()
            .map(|(id, config)| config.build(id))
            .collect()
    }
}

fn required_str<'a>(value: &'a JsonValue, key: &str, context: &str) -> Result<&'a str> {
    value[key]
        .as_str()
        .ok_or_else(|| Error::Config(format!("{} is missing the string '{}'", context, key)))
}

fn number_or(value: &JsonValue, key: &str, default: f64) -> Result<f64> {
    match &value[key] {
        JsonValue::Null => Ok(default),
        v => v
            .as_f64()
            .ok_or_else(|| Error::Config(format!("'{}' must be a number", key))),
    }
}

fn parse_region(value: &JsonValue) -> Result<RegionConfig> {
    let name = required_str(value, "name", "region")?.to_string();
    let kind_name = required_str(value, "kind", &format!("region '{}'", name))?;
    let kind = RegionKind::parse(kind_name)
        .ok_or_else(|| Error::Config(format!("unknown region kind '{}'", kind_name)))?;

    let advanced = AdvancedModel {
        enable_tl: value["lattice_temperature"].as_bool().unwrap_or(false),
        enable_tn: value["electron_temperature"].as_bool().unwrap_or(false),
        enable_tp: value["hole_temperature"].as_bool().unwrap_or(false),
    };

    let material = value["material"]
        .entries()
        .map(|(key, v)| {
            v.as_f64().map(|v| (key.to_string(), v)).ok_or_else(|| {
                Error::Config(format!("material property '{}' of '{}' must be a number", key, name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RegionConfig {
        name,
        kind,
        advanced,
        material,
    })
}

fn parse_gate(value: &JsonValue, hubs: &[String]) -> Result<GateConfig> {
    let name = required_str(value, "name", "gate")?.to_string();
    let label = value["label"].as_str().unwrap_or(name.as_str()).to_string();
    let defaults = GateParameters::default();

    let params = GateParameters {
        work_function: number_or(value, "work_function", defaults.work_function)?,
        heat_transfer: number_or(value, "heat_transfer", defaults.heat_transfer)?,
        t_external: number_or(value, "t_external", defaults.t_external)?,
        z_width: number_or(value, "z_width", defaults.z_width)?,
    };

    let circuit = &value["circuit"];
    let mode = match circuit["mode"].as_str().unwrap_or("voltage") {
        "voltage" => CircuitModeConfig::Voltage,
        "current" => CircuitModeConfig::Current,
        "inter_connect" => {
            let hub = required_str(circuit, "hub", &format!("inter-connect gate '{}'", name))?;
            if !hubs.iter().any(|h| h == hub) {
                return Err(Error::Config(format!(
                    "gate '{}' references unknown hub '{}'",
                    name, hub
                )));
            }
            CircuitModeConfig::InterConnect {
                hub: hub.to_string(),
            }
        }
        other => return Err(Error::Config(format!("unknown circuit mode '{}'", other))),
    };

    let source = match &circuit["source"] {
        JsonValue::Null => Waveform::constant(0.0),
        source => parse_waveform(source)?,
    };

    Ok(GateConfig {
        name,
        label,
        params,
        circuit: CircuitConfig {
            mode,
            r: number_or(circuit, "r", 0.0)?,
            l: number_or(circuit, "l", 0.0)?,
            c: number_or(circuit, "c", 0.0)?,
            source,
        },
    })
}

fn parse_waveform(value: &JsonValue) -> Result<Waveform> {
    let delay = number_or(value, "delay", 0.0)?;
    match required_str(value, "type", "source")? {
        "dc" => Ok(Waveform::Dc {
            delay,
            value: number_or(value, "value", 0.0)?,
        }),
        "sin" => Ok(Waveform::Sin {
            delay,
            offset: number_or(value, "offset", 0.0)?,
            amplitude: number_or(value, "amplitude", 0.0)?,
            frequency: number_or(value, "frequency", 0.0)?,
            damping: number_or(value, "damping", 0.0)?,
        }),
        "pulse" => Ok(Waveform::Pulse {
            delay,
            low: number_or(value, "low", 0.0)?,
            high: number_or(value, "high", 0.0)?,
            rise: number_or(value, "rise", 0.0)?,
            fall: number_or(value, "fall", 0.0)?,
            width: number_or(value, "width", 0.0)?,
            period: number_or(value, "period", 0.0)?,
        }),
        "exp" => Ok(Waveform::Exp {
            delay,
            low: number_or(value, "low", 0.0)?,
            high: number_or(value, "high", 0.0)?,
            rise_tau: number_or(value, "rise_tau", 1.0)?,
            fall_delay: number_or(value, "fall_delay", f64::INFINITY)?,
            fall_tau: number_or(value, "fall_tau", 1.0)?,
        }),
        other => Err(Error::Config(format!("unknown source type '{}'", other))),
    }
}

fn parse_clock(value: &JsonValue) -> Result<Clock> {
    if value.is_null() || !value["transient"].as_bool().unwrap_or(false) {
        return Ok(Clock::steady_state());
    }

    let dt = number_or(value, "dt", 0.0)?;
    if dt <= 0.0 {
        return Err(Error::Config("a transient clock needs a positive 'dt'".into()));
    }
    let scheme = match value["scheme"].as_str().unwrap_or("bdf1") {
        "bdf1" => TimeScheme::Bdf1,
        "bdf2" => TimeScheme::Bdf2,
        other => return Err(Error::Config(format!("unknown time scheme '{}'", other))),
    };

    let mut clock = Clock::transient(dt, scheme);
    clock.bdf2_lower_order = value["lower_order"]
        .as_bool()
        .unwrap_or(clock.bdf2_lower_order);
    Ok(clock)
}
