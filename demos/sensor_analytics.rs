//! Simulated temperature readings run through the plumbing stages.
//!
//! ```text
//! sensor -> throttle(20ms) -> reliever(per sensor) -> concurrent_map -> sink
//!                                                    |- fahrenheit -> celsius
//!                                                    |- alarm band
//!                                                    `- drift from baseline
//! ```
//!
//! Run with `RUST_LOG=stream_plumbing=debug` to see stages being wired.

use std::time::Duration;
use stream_plumbing::{
    blocking_throttle, concurrent_map, pressure_reliever, Mapper, Result, Topology,
};
use tracing_subscriber::EnvFilter;

const READINGS: usize = 60;
const LOW: f64 = 28.0;
const HIGH: f64 = 112.0;

/// Temperature random walk bounded to `[LOW, HIGH]`, seeded so every run
/// produces the same readings
struct SimulatedSensor {
    id: &'static str,
    temp: f64,
    state: u64,
}

impl SimulatedSensor {
    fn new(id: &'static str, temp: f64, seed: u64) -> Self {
        Self {
            id,
            temp,
            state: seed,
        }
    }

    fn next_unit(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl Iterator for SimulatedSensor {
    type Item = (&'static str, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let delta = self.next_unit() * 2.0 - 1.0;
        let next = self.temp + delta;
        if (LOW..=HIGH).contains(&next) {
            self.temp = next;
        }
        Some((self.id, (self.temp * 10.0).round() / 10.0))
    }
}

#[derive(Debug, Clone)]
struct Summary {
    sensor: &'static str,
    celsius: f64,
    alarm: bool,
    drift: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let topology = Topology::builder().name("sensors").build()?;
    let readings = SimulatedSensor::new("attic", 80.0, 7)
        .take(READINGS / 2)
        .zip(SimulatedSensor::new("cellar", 55.0, 11).take(READINGS / 2))
        .flat_map(|(a, b)| [a, b]);

    let source = topology.source_iter(readings).tag("readings");
    let paced = blocking_throttle(&source, Duration::from_millis(20));
    let fresh = pressure_reliever(&paced, |(sensor, _)| *sensor, 2);

    // Every mapper echoes the sensor id so the combiner can label the row.
    let mappers: Vec<Mapper<(&'static str, f64), (&'static str, f64)>> = vec![
        Box::new(|(sensor, f): (&'static str, f64)| Some((sensor, (f - 32.0) * 5.0 / 9.0))),
        Box::new(|(sensor, f): (&'static str, f64)| {
            let alarm = if (50.0..=90.0).contains(&f) { 0.0 } else { 1.0 };
            Some((sensor, alarm))
        }),
        Box::new(|(sensor, f): (&'static str, f64)| {
            let baseline = match sensor {
                "attic" => 80.0,
                _ => 55.0,
            };
            Some((sensor, f - baseline))
        }),
    ];

    let summaries = concurrent_map(&fresh, mappers, |r| Summary {
        sensor: r[0].0,
        celsius: r[0].1,
        alarm: r[1].1 > 0.0,
        drift: r[2].1,
    })?;

    summaries.sink(|s| {
        println!(
            "{:>6}  {:6.1}C  drift {:+5.1}{}",
            s.sensor,
            s.celsius,
            s.drift,
            if s.alarm { "  ALARM" } else { "" }
        );
    });

    let running = topology.start()?;
    std::thread::sleep(Duration::from_millis(20 * READINGS as u64 + 200));
    println!("{}", running.metrics_summary());
    running.shutdown()
}
