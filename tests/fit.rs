mod common;

use approx::assert_abs_diff_eq;
use common::{DAY, regular_index, separated, synthetic, with_column};
use foehnix::data::DataError;
use foehnix::em::EmError;
use foehnix::iwls::IwlsError;
use foehnix::model::INTERCEPT;
use foehnix::{Control, FitError, FitSpec, ModelArtifact, RowFilter, Verbosity, fit};
use tempfile::tempdir;

fn quiet(switch: bool) -> Control {
    Control::builder("gaussian", switch)
        .verbose(Verbosity::Silent)
        .build()
        .unwrap()
}

#[test]
fn missing_columns_are_reported() {
    let data = separated(200, 1);

    let err = fit(&data, &FitSpec::new("foo"), &quiet(false)).unwrap_err();
    assert!(err.to_string().contains("Predictor variable not found in data"));

    let spec = FitSpec::new("ff").concomitants(["rh", "foo"]);
    let err = fit(&data, &spec, &quiet(false)).unwrap_err();
    assert!(err.to_string().contains("Concomitant \"foo\" not found in data"));
}

#[test]
fn a_filter_that_removes_everything_is_an_error() {
    let data = separated(400, 2);
    let dd: Vec<f64> = data
        .column("dd")
        .unwrap()
        .iter()
        .map(|&v| if v <= 90.0 { f64::NAN } else { v })
        .collect();
    let data = with_column(&data, "dd", dd);

    let spec = FitSpec::new("ff").filter(RowFilter::new("dd", 0.0, 90.0));
    let err = fit(&data, &spec, &quiet(false)).unwrap_err();
    assert!(matches!(err, FitError::Data(DataError::NoDataAfterFiltering)));
    assert!(err.to_string().contains("No data left after applying required filters"));
}

#[test]
fn constant_concomitants_are_rejected() {
    let data = separated(400, 3);
    let data = with_column(&data, "constant", vec![1.0; data.len()]);
    let spec = FitSpec::new("ff")
        .concomitant("constant")
        .filter(RowFilter::new("dd", 180.0, 360.0));
    let err = fit(&data, &spec, &quiet(false)).unwrap_err();
    assert!(err.to_string().contains("Columns with constant values in the data!"));
}

#[test]
fn iteration_limits_emit_warnings() {
    let data = separated(400, 4);

    let control = Control::builder("gaussian", false)
        .maxit(&[1])
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    assert!(model.diagnostics().contains("The EM algorithm stopped after one iteration!"));
    assert!(!model.optimizer().converged);
    assert_eq!(model.optimizer().iter, 1);

    let control = Control::builder("gaussian", false)
        .maxit(&[0, 100])
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    assert!(model.diagnostics().contains("Iteration limit for the EM algorithm is turned off!"));
    assert!(model.optimizer().converged);

    let control = Control::builder("gaussian", false)
        .maxit(&[100, 0])
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    assert!(model.diagnostics().contains("Iteration limit for the IWLS solver is turned off!"));
}

#[test]
fn irregular_index_is_sorted_checked_and_inflated() {
    // daily data for 100 days plus one extra row at day 98.4, appended out of order
    let mut index = regular_index(100, DAY);
    index.push(98 * DAY + 2 * DAY / 5);
    let data = synthetic(index, (5.0, 1.5), (20.0, 3.0), 5);

    let err = fit(&data, &FitSpec::new("ff"), &quiet(false)).unwrap_err();
    assert!(matches!(err, FitError::Data(DataError::IndexNotMonotonic)));
    assert_eq!(err.to_string(), "DataFrame index is not monotonic increasing!");

    let data = data.sorted_by_index();
    let err = fit(&data, &FitSpec::new("ff"), &quiet(false)).unwrap_err();
    assert!(err.to_string().contains("foehnix tries to inflate the time series"));

    let control = Control::builder("gaussian", false)
        .force_inflate(true)
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    assert!(model.working_data().len() > 2 * data.len());
    assert_eq!(model.working_data().len(), 248);
    assert_eq!(model.inflated(), 147);
    assert!(model.diagnostics().contains("foehnix tries to inflate the time series"));

    // the probability table follows the caller's rows; odd days are off the grid
    assert_eq!(model.prob().len(), 101);
    assert_eq!(model.prob().index, data.index());
    assert!(model.prob().prob[1].is_nan());
    assert!(model.prob().flag[2].is_some());
    assert_eq!(model.working_prob().len(), 248);
}

#[test]
fn separated_regimes_give_a_quarter_foehn() {
    let data = separated(4000, 6);
    let control = Control::builder("gaussian", false)
        .maxit(&[150])
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    let opt = model.optimizer();

    assert!(opt.converged);
    assert!(opt.iter < 150);
    assert_eq!(opt.edf, 4);
    assert_eq!(opt.aic, -2.0 * opt.loglik + 2.0 * opt.edf as f64);
    let n_classified = model.prob().n_classified();
    assert_eq!(n_classified, 4000);
    assert_eq!(
        opt.bic,
        -2.0 * opt.loglik + opt.edf as f64 * (n_classified as f64).ln()
    );

    assert_abs_diff_eq!(100.0 * model.prob().occurrence(), 25.0, epsilon = 1.0);
    assert_abs_diff_eq!(100.0 * model.prob().mean_prob(), 25.0, epsilon = 1.0);
    assert_abs_diff_eq!(opt.theta.mu1, 5.0, epsilon = 0.2);
    assert_abs_diff_eq!(opt.theta.mu2, 20.0, epsilon = 0.4);
    assert!(model.summary().contains("Climatological foehn occurrence"));
}

#[test]
fn overlapping_regimes_recover_the_generating_parameters() {
    let data = synthetic(regular_index(5000, 600), (10.0, 4.0), (25.0, 7.0), 7);
    let control = Control::builder("gaussian", false)
        .maxit(&[1000, 100])
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    let theta = &model.optimizer().theta;

    assert_abs_diff_eq!(theta.mu1, 10.0, epsilon = 0.5);
    assert_abs_diff_eq!(theta.mu2, 25.0, epsilon = 1.0);
    assert_abs_diff_eq!(theta.logsd1, 4.0_f64.ln(), epsilon = 0.1);
    assert_abs_diff_eq!(theta.logsd2, 7.0_f64.ln(), epsilon = 0.1);
    assert_abs_diff_eq!(model.prob().mean_prob(), 0.25, epsilon = 0.03);
}

#[test]
fn switch_turns_the_low_regime_into_foehn() {
    let data = separated(2000, 8);
    let model = fit(&data, &FitSpec::new("ff"), &quiet(true)).unwrap();
    let theta = &model.optimizer().theta;
    assert!(theta.mu2 < theta.mu1);
    assert_abs_diff_eq!(model.prob().occurrence(), 0.75, epsilon = 0.01);
}

#[test]
fn concomitants_drive_the_mixing_probability() {
    let data = separated(3000, 9);
    let spec = FitSpec::new("ff").concomitant("rh");
    let model = fit(&data, &spec, &quiet(false)).unwrap();
    let opt = model.optimizer();

    assert_eq!(opt.edf, 6);
    assert!(opt.iwls_converged.is_some());
    assert!(opt.theta.mixing_prob.is_none());
    assert_eq!(opt.theta.coefficients[0].name, INTERCEPT);
    // foehn air is dry
    assert!(opt.theta.coefficient("rh").unwrap() < 0.0);
    assert_abs_diff_eq!(opt.loglik, opt.loglik_component + opt.loglik_concomitant, epsilon = 1e-8);
    assert!(model.summary().contains("ff ~ rh"));
}

#[test]
fn filtered_and_missing_rows_are_marked() {
    let data = separated(1000, 10);
    let mut ff = data.column("ff").unwrap().to_vec();
    ff[3] = f64::NAN;
    let data = with_column(&data, "ff", ff);

    let spec = FitSpec::new("ff").filter(RowFilter::new("dd", 180.0, 360.0));
    let model = fit(&data, &spec, &quiet(false)).unwrap();
    let table = model.prob();
    let dd = data.column("dd").unwrap();

    assert!(table.prob[3].is_nan());
    assert_eq!(table.flag[3], None);
    for i in (0..data.len()).filter(|&i| i != 3) {
        if dd[i] >= 180.0 {
            assert!(table.flag[i].is_some());
        } else {
            assert_eq!(table.prob[i], 0.0);
            assert_eq!(table.flag[i], None);
        }
    }
    assert_eq!(model.optimizer().nobs, table.n_classified());
}

#[test]
fn the_callers_table_is_not_modified() {
    let data = separated(500, 11);
    let copy = data.clone();
    let spec = FitSpec::new("ff").concomitant("rh");
    let model = fit(&data, &spec, &quiet(false)).unwrap();
    assert_eq!(data, copy);
    assert_eq!(model.working_data().len(), data.len());
}

#[test]
fn left_censored_fit_stays_finite() {
    let data = synthetic(regular_index(2000, 600), (3.0, 2.0), (20.0, 3.0), 12);
    let ff: Vec<f64> = data.column("ff").unwrap().iter().map(|v| v.max(0.0)).collect();
    let data = with_column(&data, "ff", ff);

    let control = Control::builder("gaussian", false)
        .left(0.0)
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let model = fit(&data, &FitSpec::new("ff"), &control).unwrap();
    let theta = &model.optimizer().theta;
    assert!(theta.mu1.is_finite() && theta.logsd1.is_finite());
    assert_abs_diff_eq!(theta.mu1, 3.0, epsilon = 0.5);
    assert_abs_diff_eq!(theta.mu2, 20.0, epsilon = 0.7);
}

#[test]
fn saved_models_predict_like_the_fit() {
    let data = separated(1500, 13);
    let spec = FitSpec::new("ff").concomitant("rh");
    let model = fit(&data, &spec, &quiet(false)).unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let artifact = ModelArtifact::load(&path).unwrap();
    assert_eq!(artifact, model.artifact());

    let predicted = artifact.predict(&data).unwrap();
    assert_eq!(predicted.len(), model.prob().len());
    for (a, b) in predicted.prob.iter().zip(&model.prob().prob) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }

    let out = dir.path().join("prob.tsv");
    model.prob().write_tsv(&out).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    assert_eq!(text.lines().count(), data.len() + 1);
    assert!(text.starts_with("time\tprob\tflag\n"));
}

#[test]
fn collinear_concomitants_abort_the_fit() {
    let data = separated(800, 14);
    let rh2: Vec<f64> = data.column("rh").unwrap().iter().map(|v| 2.0 * v).collect();
    let data = with_column(&data, "rh2", rh2);

    let spec = FitSpec::new("ff").concomitants(["rh", "rh2"]);
    let err = fit(&data, &spec, &quiet(false)).unwrap_err();
    assert!(matches!(
        err,
        FitError::Em(EmError::Iwls(IwlsError::SingularDesign { .. }))
    ));
}

#[test]
fn overflowing_predictor_is_a_failed_fit() {
    // (y - mean)^2 overflows, so the component scale and the log-likelihood do too
    let data = separated(400, 15);
    let ff: Vec<f64> = (0..data.len())
        .map(|i| if i % 4 == 0 { 1e200 } else { (i % 7) as f64 })
        .collect();
    let data = with_column(&data, "ff", ff);

    let control = Control::builder("gaussian", false)
        .standardize(false)
        .verbose(Verbosity::Silent)
        .build()
        .unwrap();
    let err = fit(&data, &FitSpec::new("ff"), &control).unwrap_err();
    assert!(matches!(err, FitError::Em(EmError::NonFiniteLoglik { .. })));
}
