#![allow(dead_code)]

use foehnix::TimeSeries;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

pub const DAY: i64 = 86_400;

pub fn regular_index(n: usize, step: i64) -> Vec<i64> {
    (0..n as i64).map(|i| i * step).collect()
}

/// Synthetic station data. Every fourth row is foehn: `ff` is drawn from the
/// `foehn` (mean, sd) pair, `dd` from a southerly sector and `rh` is dry. Other
/// rows draw `ff` from `background`, any wind direction and moist air.
pub fn synthetic(index: Vec<i64>, background: (f64, f64), foehn: (f64, f64), seed: u64) -> TimeSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let ff_background = Normal::new(background.0, background.1).unwrap();
    let ff_foehn = Normal::new(foehn.0, foehn.1).unwrap();
    let rh_background = Normal::new(75.0, 10.0).unwrap();
    let rh_foehn = Normal::new(45.0, 10.0).unwrap();
    let dd_background = Uniform::new(0.0, 360.0);
    let dd_foehn = Uniform::new(150.0, 210.0);
    let unit = Uniform::new(0.0, 1.0);

    let n = index.len();
    let (mut ff, mut dd, mut rh, mut noise) = (
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
    );
    for i in 0..n {
        if i % 4 == 0 {
            ff.push(ff_foehn.sample(&mut rng));
            dd.push(dd_foehn.sample(&mut rng));
            rh.push(rh_foehn.sample(&mut rng));
        } else {
            ff.push(ff_background.sample(&mut rng));
            dd.push(dd_background.sample(&mut rng));
            rh.push(rh_background.sample(&mut rng));
        }
        noise.push(unit.sample(&mut rng));
    }

    TimeSeries::new(
        index,
        vec![
            ("ff".to_string(), ff),
            ("dd".to_string(), dd),
            ("rh".to_string(), rh),
            ("rand".to_string(), noise),
        ],
    )
    .unwrap()
}

/// Clearly separated regimes, hourly.
pub fn separated(n: usize, seed: u64) -> TimeSeries {
    synthetic(regular_index(n, 3600), (5.0, 1.5), (20.0, 3.0), seed)
}

/// A copy of `data` with `name` replaced, or appended if it does not exist.
pub fn with_column(data: &TimeSeries, name: &str, values: Vec<f64>) -> TimeSeries {
    let mut columns: Vec<(String, Vec<f64>)> = data
        .column_names()
        .iter()
        .filter(|c| c.as_str() != name)
        .map(|c| (c.clone(), data.column(c).unwrap().to_vec()))
        .collect();
    columns.push((name.to_string(), values));
    TimeSeries::new(data.index().to_vec(), columns).unwrap()
}
