//! Keithley 2400-series source-measure unit driver.
//!
//! ## Ordering rules the hardware imposes
//!
//! - The sense range only follows the compliance value when a protection write
//!   happens *after* the range mode is chosen, so protection is always written
//!   twice: before and after the range commands.
//! - Auto-zero is disabled during setup and forced once (`:system:azero once`)
//!   at the end of every DC or sweep configuration.
//! - Sweeps arm on the bus so `:init` waits for the trigger; DC levels arm
//!   immediately so `:read?` triggers itself.
//! - The instrument emits the reading elements in a fixed order (voltage,
//!   current, time, status) whatever order they were requested in.

use log::{debug, info};
use std::time::Duration;

use super::link::InstrumentLink;
use super::SourceMeter;
use crate::error::{AppResult, DaqError};
use crate::measurement::{Sample, SenseRange, StepDelay, SweepSpec, VALUES_PER_SAMPLE};

/// Driver for a Keithley 2400 on an open [`InstrumentLink`].
#[derive(Debug)]
pub struct Keithley2400 {
    link: InstrumentLink,
    acquisition_timeout: Duration,
    source_voltage: bool,
}

fn functions(source_voltage: bool) -> (&'static str, &'static str) {
    if source_voltage {
        ("voltage", "current")
    } else {
        ("current", "voltage")
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

impl Keithley2400 {
    /// Reset and verify the instrument, then put the session into its data format.
    ///
    /// Fails with a connection error, having sent nothing past `*IDN?`, when the
    /// instrument does not identify as a Keithley.
    pub fn connect(mut link: InstrumentLink, acquisition_timeout: Duration) -> AppResult<Self> {
        link.reset()?;

        link.write(":trace:clear")?;
        link.write(":output:smode himpedance")?;
        for command in link.encoding().format_commands() {
            link.write(command)?;
        }
        link.write("source:clear:auto off")?;

        let mode = link.query(":source:function:mode?")?;
        let source_voltage = !mode.to_ascii_uppercase().starts_with("CURR");
        debug!("source function on connect: {}", mode);

        Ok(Self {
            link,
            acquisition_timeout,
            source_voltage,
        })
    }

    /// Terminal routing.
    pub fn set_terminals(&mut self, front: bool) -> AppResult<()> {
        self.link
            .write(if front { ":rout:term front" } else { ":rout:term rear" })
    }

    /// Remote (4-wire) sensing.
    pub fn set_wires(&mut self, four_wire: bool) -> AppResult<()> {
        self.link.write(&format!(":system:rsense {}", on_off(four_wire)))
    }

    /// Raw GPIB command byte.
    pub fn send_bus_command(&mut self, byte: u8) -> AppResult<()> {
        self.link.send_bus_command(byte)
    }

    /// Underlying session.
    pub fn link(&self) -> &InstrumentLink {
        &self.link
    }

    /// Source function currently selected.
    pub fn sourcing_voltage(&self) -> bool {
        self.source_voltage
    }

    fn set_sense_range(&mut self, sense: &str, range: SenseRange) -> AppResult<()> {
        match range {
            SenseRange::FollowCompliance => {
                self.link.write(&format!(":sense:{}:range:auto off", sense))?;
                self.link
                    .write(&format!(":sense:{}:protection:rsynchronize on", sense))
            }
            SenseRange::Auto => self.link.write(&format!(":sense:{}:range:auto on", sense)),
            SenseRange::Fixed(value) => self.link.write(&format!(":sense:{}:range {:.8}", sense, value)),
        }
    }

    fn write_protection(&mut self, sense: &str, compliance: f64) -> AppResult<()> {
        self.link
            .write(&format!(":sense:{}:protection {:.8}", sense, compliance))
    }
}

impl SourceMeter for Keithley2400 {
    fn configure_baseline(&mut self, front_terminals: bool, four_wire: bool) -> AppResult<()> {
        self.link.set_timeout(self.acquisition_timeout)?;
        self.set_terminals(front_terminals)?;
        self.set_wires(four_wire)?;
        self.link.write(":sense:function:concurrent on")?;
        self.link.write(":sense:function \"current:dc\", \"voltage:dc\"")?;
        self.link.write(":format:elements time,voltage,current,status")?;
        self.link.write(":system:beeper:state off")?;
        self.link.write(":system:lfrequency:auto on")?;
        self.link.write(":system:time:reset")?;
        self.link.write(":system:azero off")?;
        self.link.write(":system:azero:caching on")?;
        info!(
            "Baseline: {} terminals, {}-wire sensing",
            if front_terminals { "front" } else { "rear" },
            if four_wire { 4 } else { 2 }
        );
        Ok(())
    }

    fn set_integration_time(&mut self, nplc: f64) -> AppResult<()> {
        if !(nplc > 0.0) {
            return Err(DaqError::InvalidSweep(format!("NPLC must be positive, got {}", nplc)));
        }
        self.link.write(&format!(":sense:current:nplcycles {}", nplc))?;
        self.link.write(&format!(":sense:voltage:nplcycles {}", nplc))?;
        let digits = if nplc < 1.0 { 5 } else { 7 };
        self.link.write(&format!(":display:digits {}", digits))
    }

    fn configure_dc_level(
        &mut self,
        source_voltage: bool,
        compliance: f64,
        set_point: f64,
        sense_range: SenseRange,
    ) -> AppResult<()> {
        if !(compliance > 0.0) {
            return Err(DaqError::InvalidSweep(format!(
                "compliance must be positive, got {}",
                compliance
            )));
        }
        let (src, sense) = functions(source_voltage);

        self.link.write(":arm:source immediate")?;
        self.link.write(&format!(":source:function {}", src))?;
        self.link.write(&format!(":source:{}:mode fixed", src))?;
        self.link.write(&format!(":source:{} {:.8}", src, set_point))?;
        self.link.write(":source:delay:auto on")?;

        self.write_protection(sense, compliance)?;
        self.set_sense_range(sense, sense_range)?;
        self.write_protection(sense, compliance)?;

        self.link.write(":output on")?;
        self.link.write(":trigger:count 1")?;
        self.link.write(":system:azero once")?;

        self.source_voltage = source_voltage;
        debug!(
            "DC level: {} {:.6}, {} compliance {:.3e}, range {:?}",
            src, set_point, sense, compliance, sense_range
        );
        Ok(())
    }

    fn configure_sweep(&mut self, spec: &SweepSpec) -> AppResult<f64> {
        spec.validate()?;
        let (src, sense) = functions(spec.source_voltage);

        self.link.write(&format!(":source:function {}", src))?;
        self.link.write(&format!(":source:{} {:.8}", src, spec.start))?;

        self.write_protection(sense, spec.compliance)?;
        self.set_sense_range(sense, spec.sense_range)?;
        self.write_protection(sense, spec.compliance)?;

        self.link.write(":output on")?;
        self.link.write(&format!(":source:{}:mode sweep", src))?;
        self.link.write(":source:sweep:spacing linear")?;
        match spec.step_delay {
            StepDelay::Auto => self.link.write(":source:delay:auto on")?,
            StepDelay::Seconds(delay) => {
                self.link.write(":source:delay:auto off")?;
                self.link.write(&format!(":source:delay {:.6}", delay))?;
            }
        }
        self.link.write(&format!(":trigger:count {}", spec.points))?;
        self.link.write(&format!(":source:sweep:points {}", spec.points))?;
        self.link.write(&format!(":source:{}:start {:.6}", src, spec.start))?;
        self.link.write(&format!(":source:{}:stop {:.6}", src, spec.end))?;

        let reply = self.link.query(&format!(":source:{}:step?", src))?;
        let step = reply
            .trim()
            .parse::<f64>()
            .map(f64::abs)
            .map_err(|e| DaqError::Bus(format!("bad step reply '{}': {}", reply, e)))?;

        self.link.write(":source:sweep:ranging best")?;
        self.link.write(":arm:source bus")?;
        self.link.write(":system:azero once")?;

        self.source_voltage = spec.source_voltage;
        info!(
            "Sweep: {} {:.4} -> {:.4} in {} points, step {:.3e}",
            src, spec.start, spec.end, spec.points, step
        );
        Ok(step)
    }

    fn arm(&mut self) -> AppResult<()> {
        self.link.write(":init")
    }

    fn trigger(&mut self) -> AppResult<()> {
        self.link.trigger()
    }

    fn opc(&mut self) -> AppResult<()> {
        let reply = self.link.query("*OPC?")?;
        if reply.trim() == "1" {
            Ok(())
        } else {
            Err(DaqError::Bus(format!("unexpected *OPC? reply '{}'", reply)))
        }
    }

    fn fetch(&mut self, expected: usize) -> AppResult<Vec<Sample>> {
        let values = self
            .link
            .query_values(":fetch?", Some(expected * VALUES_PER_SAMPLE))?;
        let samples = Sample::from_values(&values)?;
        if samples.len() != expected {
            return Err(DaqError::Bus(format!(
                "fetched {} samples, expected {}",
                samples.len(),
                expected
            )));
        }
        Ok(samples)
    }

    fn read_one(&mut self) -> AppResult<Sample> {
        let values = self.link.query_values(":read?", Some(VALUES_PER_SAMPLE))?;
        Sample::from_values(&values)?
            .first()
            .copied()
            .ok_or_else(|| DaqError::Bus("empty :read? reply".into()))
    }

    fn set_source_level(&mut self, level: f64) -> AppResult<()> {
        let (src, _) = functions(self.source_voltage);
        self.link.write(&format!(":source:{} {:.8}", src, level))
    }

    fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.link.write(&format!(":output {}", on_off(on)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CommandLog, MockAdapter};
    use crate::instrument::link::ConnectionParameters;

    fn serial_smu((mock, log): (MockAdapter, CommandLog)) -> (Keithley2400, CommandLog) {
        let params = ConnectionParameters::new("ASRL1::INSTR", "\n", 57600, Duration::from_millis(300));
        let link = InstrumentLink::with_adapter(params, Box::new(mock)).unwrap();
        (Keithley2400::connect(link, Duration::from_secs(50)).unwrap(), log)
    }

    fn scripted() -> (MockAdapter, CommandLog) {
        let (mock, log) = MockAdapter::new();
        let mock = mock
            .with_response("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234567,C30")
            .with_response(":source:function:mode?", "VOLT")
            .with_response(":source:voltage:step?", "-1.000000E-02")
            .with_response("*OPC?", "1");
        (mock, log)
    }

    #[test]
    fn test_connect_sends_ascii_format_on_serial() {
        let (smu, log) = serial_smu(scripted());
        assert!(smu.sourcing_voltage());
        assert_eq!(log.count("format:data ascii"), 1);
        assert!(!log.any_starts_with(":format:border"));
    }

    #[test]
    fn test_follow_compliance_writes_protection_twice() {
        let (mut smu, log) = serial_smu(scripted());
        log.clear();
        smu.configure_dc_level(true, 0.04, 0.0, SenseRange::FollowCompliance)
            .unwrap();

        let entries = log.entries();
        let protection = ":sense:current:protection 0.04000000";
        let writes: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_str() == protection)
            .map(|(i, _)| i)
            .collect();
        let range = log.position(":sense:current:range:auto off").unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes[0] < range && range < writes[1]);
    }

    #[test]
    fn test_integration_time_picks_display_digits() {
        let (mut smu, log) = serial_smu(scripted());
        smu.set_integration_time(0.1).unwrap();
        smu.set_integration_time(10.0).unwrap();
        assert_eq!(log.count(":display:digits 5"), 1);
        assert_eq!(log.count(":display:digits 7"), 1);
        assert!(smu.set_integration_time(0.0).is_err());
    }

    #[test]
    fn test_sweep_reads_back_absolute_step() {
        let (mut smu, log) = serial_smu(scripted());
        let spec = SweepSpec {
            step_delay: StepDelay::Seconds(0.005),
            ..SweepSpec::voltage(0.04, 101, 1.0, 0.0)
        };
        let step = smu.configure_sweep(&spec).unwrap();
        assert!((step - 0.01).abs() < 1e-12);
        assert_eq!(log.count(":trigger:count 101"), 1);
        assert_eq!(log.count(":source:sweep:points 101"), 1);
        assert_eq!(log.count(":source:delay 0.005000"), 1);
        assert_eq!(log.count(":arm:source bus"), 1);
    }

    #[test]
    fn test_invalid_sweep_sends_nothing() {
        let (mut smu, log) = serial_smu(scripted());
        log.clear();
        let spec = SweepSpec::voltage(0.04, 1, 1.0, 0.0);
        assert!(matches!(
            smu.configure_sweep(&spec),
            Err(DaqError::InvalidSweep(_))
        ));
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_read_one_decodes_instrument_order() {
        let (mock, log) = scripted();
        let mock = mock.with_response(":read?", "5.0E-01,-2.0E-02,1.5E+00,0.0E+00");
        let (mut smu, _log) = serial_smu((mock, log));
        let sample = smu.read_one().unwrap();
        assert_eq!(sample.voltage, 0.5);
        assert_eq!(sample.current, -0.02);
        assert_eq!(sample.timestamp, 1.5);
    }
}
