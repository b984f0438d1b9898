use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use foehnix::{Control, FitSpec, TimeSeries, Verbosity, fit};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn station_data(n: usize) -> TimeSeries {
    let mut rng = StdRng::seed_from_u64(0x5EED_F0E + n as u64);
    let background = Normal::new(10.0, 4.0).unwrap();
    let foehn = Normal::new(25.0, 7.0).unwrap();
    let index = (0..n as i64).map(|i| i * 600).collect();
    let mut ff = Vec::with_capacity(n);
    let mut rh = Vec::with_capacity(n);
    for _ in 0..n {
        if rng.gen_bool(0.25) {
            ff.push(foehn.sample(&mut rng));
            rh.push(45.0 + 10.0 * rng.r#gen::<f64>());
        } else {
            ff.push(background.sample(&mut rng));
            rh.push(70.0 + 10.0 * rng.r#gen::<f64>());
        }
    }
    TimeSeries::new(index, vec![("ff".to_string(), ff), ("rh".to_string(), rh)]).unwrap()
}

fn benchmark_fit(c: &mut Criterion) {
    let sizes = [1_000_usize, 10_000, 50_000];
    let datasets: Vec<_> = sizes.iter().map(|&n| (n, station_data(n))).collect();
    let control = Control::builder("gaussian", false)
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let plain = FitSpec::new("ff");
    let with_rh = FitSpec::new("ff").concomitant("rh");

    let mut group = c.benchmark_group("fit");
    group.sample_size(10);
    for (n, data) in datasets.iter() {
        group.throughput(Throughput::Elements(*n as u64));

        group.bench_with_input(BenchmarkId::new("no_concomitant", n), data, |b, input| {
            b.iter(|| {
                let model = fit(black_box(input), &plain, &control).unwrap();
                black_box(model.optimizer().loglik);
            });
        });

        group.bench_with_input(BenchmarkId::new("concomitant_rh", n), data, |b, input| {
            b.iter(|| {
                let model = fit(black_box(input), &with_rh, &control).unwrap();
                black_box(model.optimizer().loglik);
            });
        });
    }
    group.finish();
}

criterion_group!(fit_benchmark, benchmark_fit);
criterion_main!(fit_benchmark);
