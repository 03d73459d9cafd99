use anyhow::{Context, Result};
use serde_json::json;

/// Area-normalised Gaussian scaled to `area`.
fn gaussian(x: f64, center: f64, fwhm: f64, area: f64) -> f64 {
    let sigma = fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
    area * (-(x - center).powi(2) / (2.0 * sigma.powi(2))).exp()
        / (sigma * (2.0 * std::f64::consts::PI).sqrt())
}

/// Peaks plus a Shirley-like step: the background rises by `step` times the
/// peak area accumulated from the low binding energy side.
fn generate_spectrum(
    energies: &[f64],
    peaks: &[(f64, f64, f64)],
    offset: f64,
    step: f64,
    noise_level: f64,
    rng: &mut SimpleRng,
) -> Vec<f64> {
    let signal: Vec<f64> = energies
        .iter()
        .map(|&e| peaks.iter().map(|&(c, w, a)| gaussian(e, c, w, a)).sum())
        .collect();
    // energies run high → low, so accumulate from the end
    let mut accumulated = vec![0.0; signal.len()];
    let mut acc = 0.0;
    for (slot, s) in accumulated.iter_mut().zip(&signal).rev() {
        acc += s;
        *slot = acc;
    }
    signal
        .iter()
        .zip(&accumulated)
        .map(|(s, a)| {
            let clean = offset + s + step * a;
            (clean + rng.gauss(0.0, noise_level * clean.sqrt())).max(0.0)
        })
        .collect()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let mut rng = SimpleRng::new(42);

    // (name, eis region, window, peaks as (center, fwhm, area))
    let lines: [(&str, i64, (f64, f64), Vec<(f64, f64, f64)>); 3] = [
        ("C 1s", 1, (295.0, 280.0), vec![(284.8, 1.1, 900.0), (286.3, 1.2, 250.0), (288.9, 1.3, 120.0)]),
        ("O 1s", 2, (538.0, 525.0), vec![(530.1, 1.2, 700.0), (532.0, 1.5, 400.0)]),
        ("Au 4f", 3, (95.0, 80.0), vec![(84.0, 0.9, 1500.0), (87.7, 0.9, 1125.0)]),
    ];
    let sweeps = [1u32, 4, 16];

    let mut records = Vec::new();
    for (name, eis_region, (high, low), peaks) in &lines {
        let n = ((high - low) / 0.05).round() as usize + 1;
        let energies: Vec<f64> = (0..n).map(|i| high - i as f64 * 0.05).collect();
        for &sweep in &sweeps {
            let noise = 1.0 / f64::from(sweep).sqrt();
            let intensity = generate_spectrum(&energies, peaks, 150.0, 0.002, noise, &mut rng);
            records.push(json!({
                "energy": energies,
                "intensity": intensity,
                "name": format!("{name} ({sweep} sweeps)"),
                "eis_region": eis_region,
                "sweeps": sweep,
                "dwelltime": 0.1,
                "passenergy": 20.0,
            }));
        }
    }

    let output_path = std::env::args().nth(1).unwrap_or_else(|| "sample_xps.json".to_string());
    let text = serde_json::to_string_pretty(&records).context("serializing spectra")?;
    std::fs::write(&output_path, text).with_context(|| format!("writing {output_path}"))?;

    println!("Wrote {} spectra to {output_path}", records.len());
    Ok(())
}
