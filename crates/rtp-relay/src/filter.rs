//! Pluggable inbound payload pre-filter.
//!
//! A filter may zero out or attenuate payload bytes in place before they
//! reach the accumulation buffer. It must be transparent to downstream
//! framing: same packet cadence, same chunk sizes, only payload content may
//! change.

/// In-place payload filter applied to each accepted packet.
pub trait AudioPreFilter: Send + Sync {
    /// Process one packet's payload in place. The slice length never
    /// changes.
    fn process(&mut self, payload: &mut [u8]);

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Pass-through filter; the default.
pub struct NoopFilter;

impl AudioPreFilter for NoopFilter {
    fn process(&mut self, _payload: &mut [u8]) {}

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Configuration for [`EnergyGateFilter`].
#[derive(Debug, Clone)]
pub struct EnergyGateConfig {
    /// RMS threshold (linear PCM amplitude) below which a packet counts as
    /// silence.
    pub rms_threshold: f32,
    /// Consecutive sub-threshold packets tolerated before gating engages.
    pub hangover_packets: u32,
}

impl Default for EnergyGateConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 200.0,
            hangover_packets: 5,
        }
    }
}

/// Energy-based noise gate for G.711 μ-law payloads.
///
/// Packets whose decoded RMS energy stays below the threshold for longer
/// than the hangover window are rewritten to μ-law silence. The hangover
/// keeps trailing word endings intact.
pub struct EnergyGateFilter {
    config: EnergyGateConfig,
    quiet_run: u32,
}

/// μ-law byte encoding a zero-amplitude sample.
const ULAW_SILENCE: u8 = 0xFF;

impl EnergyGateFilter {
    pub fn new(config: EnergyGateConfig) -> Self {
        Self {
            config,
            quiet_run: 0,
        }
    }

    fn rms(payload: &[u8]) -> f32 {
        if payload.is_empty() {
            return 0.0;
        }
        let sum: f64 = payload
            .iter()
            .map(|&b| {
                let s = ulaw_to_linear(b) as f64;
                s * s
            })
            .sum();
        (sum / payload.len() as f64).sqrt() as f32
    }
}

impl AudioPreFilter for EnergyGateFilter {
    fn process(&mut self, payload: &mut [u8]) {
        if Self::rms(payload) < self.config.rms_threshold {
            self.quiet_run = self.quiet_run.saturating_add(1);
            if self.quiet_run > self.config.hangover_packets {
                payload.fill(ULAW_SILENCE);
            }
        } else {
            self.quiet_run = 0;
        }
    }

    fn name(&self) -> &'static str {
        "energy-gate"
    }
}

/// Expand one G.711 μ-law byte to a linear 16-bit sample.
fn ulaw_to_linear(encoded: u8) -> i16 {
    const BIAS: i32 = 0x84;
    let inverted = !encoded;
    let sign = inverted & 0x80;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = ((mantissa << 3) + BIAS) << exponent;
    let sample = magnitude - BIAS;
    if sign != 0 {
        -(sample as i16)
    } else {
        sample as i16
    }
}
