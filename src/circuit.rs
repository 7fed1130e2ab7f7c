use num_dual::DualNum;
use std::f64::consts::PI;
use std::fmt;

/// How the lumped network drives an electrode
///
/// ```text
///  voltage driven                          current driven
///         _____             Ve                            Ve
///   -----|_____|---/\/\/\---+--> gate      -->------------+--> gate
///   | +    R         L      |              |              |
///  Vapp                  C ===            Iapp         C ===
///   | -                     |              |              |
///   |_______________________|              |______________|
///
///  inter-connect
///         _____             Ve
///   -----|_____|---------------> gate
///   |      R
///  V_ic (hub)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitMode {
    VoltageDriven,
    CurrentDriven,
    /// Tied through `R` to an inter-connect hub unknown
    InterConnect { hub: usize },
}

impl fmt::Display for CircuitMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::VoltageDriven => write!(f, "voltage driven"),
            Self::CurrentDriven => write!(f, "current driven"),
            Self::InterConnect { hub } => write!(f, "inter-connect (hub {})", hub),
        }
    }
}

/// A time dependent source
#[derive(Clone, Debug, PartialEq)]
pub enum Waveform {
    /// `value` from `delay` onwards, zero before
    Dc { delay: f64, value: f64 },
    /// Damped sine on top of `offset`, starting at `delay`
    Sin {
        delay: f64,
        offset: f64,
        amplitude: f64,
        frequency: f64,
        damping: f64,
    },
    /// Trapezoidal pulse train between `low` and `high`
    Pulse {
        delay: f64,
        low: f64,
        high: f64,
        rise: f64,
        fall: f64,
        width: f64,
        period: f64,
    },
    /// Exponential rise from `low` towards `high` after `delay`, and back after `fall_delay`
    Exp {
        delay: f64,
        low: f64,
        high: f64,
        rise_tau: f64,
        fall_delay: f64,
        fall_tau: f64,
    },
}

impl Waveform {
    pub fn constant(value: f64) -> Self {
        Self::Dc { delay: 0.0, value }
    }

    /// Value of the source at time `t`
    pub fn value(&self, t: f64) -> f64 {
        match *self {
            Self::Dc { delay, value } => {
                if t >= delay {
                    value
                } else {
                    0.0
                }
            }
            Self::Sin {
                delay,
                offset,
                amplitude,
                frequency,
                damping,
            } => {
                if t >= delay {
                    let dt = t - delay;
                    offset + amplitude * (-damping * dt).exp() * (2.0 * PI * frequency * dt).sin()
                } else {
                    offset
                }
            }
            Self::Pulse {
                delay,
                low,
                high,
                rise,
                fall,
                width,
                period,
            } => {
                if t < delay {
                    return low;
                }
                let t = if period > 0.0 {
                    (t - delay) % period
                } else {
                    t - delay
                };

                if t < rise {
                    low + t * (high - low) / rise
                } else if t < rise + width {
                    high
                } else if t < rise + width + fall {
                    high - (t - rise - width) * (high - low) / fall
                } else {
                    low
                }
            }
            Self::Exp {
                delay,
                low,
                high,
                rise_tau,
                fall_delay,
                fall_tau,
            } => {
                if t <= delay {
                    low
                } else {
                    let rising = low + (high - low) * (1.0 - (-(t - delay) / rise_tau).exp());
                    if t <= fall_delay {
                        rising
                    } else {
                        rising + (low - high) * (1.0 - (-(t - fall_delay) / fall_tau).exp())
                    }
                }
            }
        }
    }
}

/// Lumped R/L/C network attached to an electrode
///
/// Values with an `_itering` suffix belong to the Newton iteration in progress; the others to the
/// last accepted step.
#[derive(Clone, Debug)]
pub struct ExternalCircuit {
    pub mode: CircuitMode,
    pub r: f64,
    pub l: f64,
    pub c: f64,
    voltage_source: Waveform,
    current_source: Waveform,
    vapp: f64,
    iapp: f64,
    potential: f64,
    current: f64,
    potential_last: f64,
    current_last: f64,
    cap_current: f64,
    potential_itering: f64,
    current_itering: f64,
}

impl ExternalCircuit {
    pub fn new(mode: CircuitMode, r: f64, l: f64, c: f64) -> Self {
        assert!(
            r >= 0.0 && l >= 0.0 && c >= 0.0,
            "External circuit elements must be non-negative!"
        );
        Self {
            mode,
            r,
            l,
            c,
            voltage_source: Waveform::constant(0.0),
            current_source: Waveform::constant(0.0),
            vapp: 0.0,
            iapp: 0.0,
            potential: 0.0,
            current: 0.0,
            potential_last: 0.0,
            current_last: 0.0,
            cap_current: 0.0,
            potential_itering: 0.0,
            current_itering: 0.0,
        }
    }

    pub fn voltage_driven(r: f64, l: f64, c: f64) -> Self {
        Self::new(CircuitMode::VoltageDriven, r, l, c)
    }

    pub fn current_driven(c: f64) -> Self {
        Self::new(CircuitMode::CurrentDriven, 0.0, 0.0, c)
    }

    pub fn inter_connect(hub: usize, r: f64) -> Self {
        Self::new(CircuitMode::InterConnect { hub }, r, 0.0, 0.0)
    }

    pub fn with_voltage_source(mut self, source: Waveform) -> Self {
        self.vapp = source.value(0.0);
        self.voltage_source = source;
        self
    }

    pub fn with_current_source(mut self, source: Waveform) -> Self {
        self.iapp = source.value(0.0);
        self.current_source = source;
        self
    }

    /// Start from a known electrode potential (e.g. a restart or a previous bias point)
    pub fn with_potential(mut self, potential: f64) -> Self {
        self.potential = potential;
        self.potential_last = potential;
        self.potential_itering = potential;
        self
    }

    pub fn is_voltage_driven(&self) -> bool {
        self.mode == CircuitMode::VoltageDriven
    }

    pub fn is_current_driven(&self) -> bool {
        self.mode == CircuitMode::CurrentDriven
    }

    pub fn inter_connect_hub(&self) -> Option<usize> {
        match self.mode {
            CircuitMode::InterConnect { hub } => Some(hub),
            _ => None,
        }
    }

    /// Evaluate the sources at time `t`
    pub fn set_time(&mut self, t: f64) {
        self.vapp = self.voltage_source.value(t);
        self.iapp = self.current_source.value(t);
    }

    pub fn vapp(&self) -> f64 {
        self.vapp
    }

    pub fn iapp(&self) -> f64 {
        self.iapp
    }

    /// Override the applied voltage (DC sweeps)
    pub fn set_vapp(&mut self, vapp: f64) {
        self.vapp = vapp;
    }

    pub fn set_iapp(&mut self, iapp: f64) {
        self.iapp = iapp;
    }

    /// Electrode potential at the last accepted step
    pub fn potential(&self) -> f64 {
        self.potential
    }

    /// Current into the electrode at the last accepted step
    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn potential_last(&self) -> f64 {
        self.potential_last
    }

    pub fn current_last(&self) -> f64 {
        self.current_last
    }

    /// Current through the capacitor to ground at the last accepted step
    pub fn cap_current(&self) -> f64 {
        self.cap_current
    }

    pub fn potential_itering(&self) -> f64 {
        self.potential_itering
    }

    pub fn current_itering(&self) -> f64 {
        self.current_itering
    }

    /// Save the electrode state seen by the current Newton iteration
    pub fn record_iteration(&mut self, potential: f64, current: f64) {
        self.potential_itering = potential;
        self.current_itering = current;
    }

    /// Replace the iteration current with the total over every processor
    pub fn set_current_itering(&mut self, current: f64) {
        self.current_itering = current;
    }

    /// Factor multiplying the electrode current in the electrode equation
    ///
    /// `inv_dt` is `1/dt`, or 0 for a steady state solve.
    pub fn current_factor(&self, inv_dt: f64) -> f64 {
        match self.mode {
            CircuitMode::VoltageDriven => self.l * inv_dt + self.r,
            CircuitMode::CurrentDriven => 1.0,
            CircuitMode::InterConnect { .. } => self.r,
        }
    }

    /// Residual of the circuit part of the electrode equation (without the electrode current)
    ///
    /// `hub_potential` is only read in inter-connect mode.
    pub fn residual<T: DualNum<f64>>(&self, ve: T, hub_potential: T, inv_dt: f64) -> T {
        match self.mode {
            CircuitMode::VoltageDriven => {
                let z = self.l * inv_dt + self.r;
                ve.clone() * (1.0 + z * self.c * inv_dt)
                    - self.vapp
                    - z * self.c * inv_dt * self.potential
                    - self.l * inv_dt * (self.current + self.cap_current)
            }
            CircuitMode::CurrentDriven => <T as From<f64>>::from(self.cap_current - self.iapp),
            CircuitMode::InterConnect { .. } => ve - hub_potential,
        }
    }

    /// Accept the iteration values as the new step
    pub fn update(&mut self, inv_dt: f64) {
        self.cap_current = self.c * (self.potential_itering - self.potential) * inv_dt;
        self.potential_last = self.potential;
        self.current_last = self.current;
        self.potential = self.potential_itering;
        self.current = self.current_itering;

        log::debug!(
            "circuit ({}) accepted: V = {:.6e}, I = {:.6e}, Ic = {:.6e}",
            self.mode,
            self.potential,
            self.current,
            self.cap_current
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_train() {
        let pulse = Waveform::Pulse {
            delay: 1.0,
            low: 0.0,
            high: 2.0,
            rise: 1.0,
            fall: 1.0,
            width: 2.0,
            period: 10.0,
        };

        assert_eq!(pulse.value(0.5), 0.0);
        assert!((pulse.value(1.5) - 1.0).abs() < 1e-15);
        assert_eq!(pulse.value(3.0), 2.0);
        assert!((pulse.value(4.5) - 1.0).abs() < 1e-15);
        assert_eq!(pulse.value(8.0), 0.0);
        assert_eq!(pulse.value(13.0), 2.0);
    }

    #[test]
    fn exponential_and_sine_sources() {
        let exp = Waveform::Exp {
            delay: 0.0,
            low: 1.0,
            high: 3.0,
            rise_tau: 1.0,
            fall_delay: 1e3,
            fall_tau: 1.0,
        };
        assert_eq!(exp.value(0.0), 1.0);
        assert!((exp.value(1.0) - (1.0 + 2.0 * (1.0 - (-1.0_f64).exp()))).abs() < 1e-14);
        assert!((exp.value(100.0) - 3.0).abs() < 1e-12);

        let sin = Waveform::Sin {
            delay: 0.0,
            offset: 0.5,
            amplitude: 1.0,
            frequency: 0.25,
            damping: 0.0,
        };
        assert!((sin.value(1.0) - 1.5).abs() < 1e-14);
        assert_eq!(Waveform::Dc { delay: 2.0, value: 4.0 }.value(1.0), 0.0);
    }

    #[test]
    fn voltage_driven_without_inductor() {
        let (r, c, dt) = (50.0, 1e-3, 1e-2);
        let mut circuit = ExternalCircuit::voltage_driven(r, 0.0, c)
            .with_voltage_source(Waveform::constant(1.0))
            .with_potential(0.2);

        let ve = 0.7;
        let f = circuit.residual(ve, 0.0, 1.0 / dt);
        let expected = (ve - 1.0) + r * c / dt * ve - r * c / dt * 0.2;
        assert!((f - expected).abs() < 1e-12);
        assert!((circuit.current_factor(1.0 / dt) - r).abs() < 1e-15);

        circuit.record_iteration(ve, 3.0);
        circuit.update(1.0 / dt);
        assert_eq!(circuit.potential(), ve);
        assert_eq!(circuit.potential_last(), 0.2);
        assert_eq!(circuit.current(), 3.0);
        assert!((circuit.cap_current() - c * 0.5 / dt).abs() < 1e-12);
    }

    #[test]
    fn steady_state_opens_the_capacitor() {
        let mut circuit = ExternalCircuit::voltage_driven(10.0, 1e-6, 1e-3)
            .with_voltage_source(Waveform::constant(2.0));

        assert!((circuit.residual(1.5, 0.0, 0.0) + 0.5).abs() < 1e-15);
        assert_eq!(circuit.current_factor(0.0), 10.0);

        circuit.record_iteration(1.5, 0.1);
        circuit.update(0.0);
        assert_eq!(circuit.cap_current(), 0.0);
    }

    #[test]
    fn sources_follow_time() {
        let mut circuit = ExternalCircuit::current_driven(0.0).with_current_source(Waveform::Dc {
            delay: 1.0,
            value: 1e-3,
        });
        assert_eq!(circuit.iapp(), 0.0);
        circuit.set_time(2.0);
        assert_eq!(circuit.iapp(), 1e-3);
        assert!((circuit.residual(0.0, 0.0, 1.0) + 1e-3).abs() < 1e-18);

        let ic = ExternalCircuit::inter_connect(0, 5.0);
        assert_eq!(ic.inter_connect_hub(), Some(0));
        assert_eq!(ic.residual(1.0, 0.25, 1.0), 0.75);
    }

    #[test]
    #[should_panic]
    fn negative_resistance() {
        let _ = ExternalCircuit::voltage_driven(-1.0, 0.0, 0.0);
    }
}
