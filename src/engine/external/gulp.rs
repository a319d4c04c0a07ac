use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use nalgebra::Vector3;
use regex::Regex;

use crate::core::domain::{Configuration, Forces, Sample, System};
use crate::core::error::EvaluationError;
use crate::engine::evaluator::ReferenceEvaluator;

/// Single-point wrapper around GULP.
/// Streams input/output via pipes; no files are written.
pub struct GulpEvaluator {
    executable: String,
    potential_parameters: String,
    system: System,
    timeout: Option<Duration>,
    energy_re: Regex,
    derivative_re: Regex,
}

impl GulpEvaluator {
    /// Creates a new evaluator.
    ///
    /// # Arguments
    /// * `executable` - Path to GULP binary (e.g., "gulp").
    /// * `potential_parameters` - The potential block (buckingham, spring, etc.).
    /// * `system` - Species table matching the element ids of evaluated configurations.
    pub fn new(executable: &str, potential_parameters: &str, system: System) -> Result<Self, regex::Error> {
        Ok(Self {
            executable: executable.to_string(),
            potential_parameters: potential_parameters.to_string(),
            system,
            timeout: None,
            energy_re: Regex::new(r"Total lattice energy\s*=\s*(\S+)\s+eV")?,
            derivative_re: Regex::new(r"^\s*(\d+)\s+(\S+)\s+([cs])\s+(\S+)\s+(\S+)\s+(\S+)")?,
        })
    }

    /// Kills the GULP process if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Constructs the GULP input string.
    fn generate_input(&self, config: &Configuration) -> Result<String, EvaluationError> {
        let mut s = String::with_capacity(1024);

        // 1. Header Keywords: single point with analytic gradients
        s.push_str("grad\n");

        // 2. Lattice Vectors (if periodic)
        if let Some(lat) = config.lattice() {
            s.push_str("vectors\n");
            let v = lat.vectors;
            // GULP reads vectors as rows
            for c in 0..3 {
                s.push_str(&format!("{:.9} {:.9} {:.9}\n", v[(0, c)], v[(1, c)], v[(2, c)]));
            }
        }

        // 3. Coordinates
        s.push_str("cartesian\n");
        for (&id, p) in config.element_ids().iter().zip(config.positions()) {
            let symbol = self
                .system
                .symbol(id)
                .ok_or_else(|| EvaluationError::Malformed(format!("invalid element id {}", id)))?;
            s.push_str(&format!("{:<3} core {:.9} {:.9} {:.9}\n", symbol, p.x, p.y, p.z));
        }

        // 4. Potentials
        s.push('\n');
        s.push_str(&self.potential_parameters);
        s.push('\n');

        Ok(s)
    }

    /// Executes GULP via stdin/stdout piping.
    fn run_process(&self, input_data: &str) -> Result<String, EvaluationError> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EvaluationError::Process(format!("failed to spawn GULP executable: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input_data.as_bytes())
                .map_err(|e| EvaluationError::Process(format!("failed to write to GULP stdin: {}", e)))?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvaluationError::Process("GULP stdout not captured".to_string()))?;

        // Drained on its own thread so a chatty stderr cannot stall stdout
        let stderr_pipe = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let mut buf = String::new();
            let result = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(result);
        });

        let received = match self.timeout {
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(r) => r,
                Err(RecvTimeoutError::Timeout) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EvaluationError::Timeout(limit.as_secs_f64()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EvaluationError::Process("GULP output reader vanished".to_string()))
                }
            },
            None => rx
                .recv()
                .map_err(|_| EvaluationError::Process("GULP output reader vanished".to_string()))?,
        };
        let stdout = received.map_err(|e| EvaluationError::Process(format!("failed to read GULP output: {}", e)))?;

        let stderr = stderr_reader.join().unwrap_or_default();

        let status = child
            .wait()
            .map_err(|e| EvaluationError::Process(format!("failed to wait for GULP: {}", e)))?;
        if !status.success() {
            return Err(EvaluationError::Solver(format!("GULP exited with error: {}", stderr.trim())));
        }

        Ok(stdout)
    }

    fn parse_energy(&self, output: &str) -> Result<f64, EvaluationError> {
        let caps = self
            .energy_re
            .captures(output)
            .ok_or_else(|| EvaluationError::Malformed("could not find total energy in GULP output".to_string()))?;
        caps[1]
            .parse::<f64>()
            .map_err(|_| EvaluationError::Malformed(format!("unparsable GULP energy `{}`", &caps[1])))
    }

    /// Reads the Cartesian derivative table and converts it to forces.
    fn parse_forces(&self, output: &str, n_atoms: usize) -> Result<Forces, EvaluationError> {
        let lines: Vec<&str> = output.lines().collect();
        let start = lines
            .iter()
            .rposition(|l| l.to_ascii_lowercase().contains("final cartesian derivatives"))
            .ok_or_else(|| EvaluationError::Malformed("no Cartesian derivatives in GULP output".to_string()))?;

        let mut forces = Vec::with_capacity(n_atoms);
        for line in &lines[start + 1..] {
            if forces.len() == n_atoms {
                break;
            }
            let Some(caps) = self.derivative_re.captures(line) else {
                continue;
            };
            // Skip shells, forces are reported on cores only
            if &caps[3] == "s" {
                continue;
            }
            let mut g = [0.0; 3];
            for (k, slot) in g.iter_mut().enumerate() {
                *slot = caps[4 + k]
                    .parse::<f64>()
                    .map_err(|_| EvaluationError::Malformed(format!("unparsable GULP derivative `{}`", &caps[4 + k])))?;
            }
            forces.push(-Vector3::new(g[0], g[1], g[2]));
        }

        // STRICT VALIDATION
        if forces.len() != n_atoms {
            return Err(EvaluationError::Malformed(format!(
                "GULP derivative count mismatch: expected {}, got {}",
                n_atoms,
                forces.len()
            )));
        }
        Ok(forces)
    }

    fn check_errors(&self, output: &str) -> Result<(), EvaluationError> {
        if output.contains("Interatomic distance too small") {
            return Err(EvaluationError::Malformed("geometric collapse".to_string()));
        }
        if output.contains("Dump of error info") || output.contains("!! ERROR") {
            return Err(EvaluationError::Solver("internal GULP error".to_string()));
        }
        Ok(())
    }

    /// Energy and forces from a captured GULP output.
    pub fn parse_output(&self, output: &str, config: &Configuration) -> Result<Sample, EvaluationError> {
        self.check_errors(output)?;
        let energy = self.parse_energy(output)?;
        let forces = self.parse_forces(output, config.n_atoms())?;
        Sample::new(config.clone(), energy, forces, self.name())
    }
}

impl ReferenceEvaluator for GulpEvaluator {
    fn name(&self) -> &str {
        "GULP (Pipe)"
    }

    fn evaluate(&self, configuration: &Configuration) -> Result<Sample, EvaluationError> {
        let input_str = self.generate_input(configuration)?;
        let output_str = self.run_process(&input_str)?;
        self.parse_output(&output_str, configuration)
    }
}
