use foehnix::control::{Control, ControlError, parse_maxit, parse_switch, parse_tol};
use foehnix::family::{Censoring, Family, FamilyKind};
use foehnix::Verbosity;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn family_and_switch_are_mandatory() {
    let err = Control::from_toml_str("family = \"gaussian\"").unwrap_err();
    assert!(matches!(err, ControlError::MissingArgument("switch")));

    let err = Control::from_toml_str("").unwrap_err();
    assert!(matches!(err, ControlError::MissingArgument(_)));

    let err = Control::from_toml_str("family = \"gaussian\"\nswitch = 1").unwrap_err();
    assert!(err.to_string().contains("switch is mandatory and either True or False"));
    assert!(parse_switch("1").is_err());
}

#[test]
fn invalid_settings_are_rejected_with_their_messages() {
    let err = Control::new("gausdistribution", true).unwrap_err();
    assert!(err.to_string().contains("family must be a foehnix-family object or one of"));

    let err = "aus".parse::<Verbosity>().unwrap_err();
    assert!(err.to_string().contains("verbose must be one of true, false or"));

    let err = parse_maxit("1.2").unwrap_err();
    assert!(err.to_string().contains("maxit must be single integer or list of len 2"));
    let err = Control::builder("logistic", true).maxit(&[1, 2, 3]).build().unwrap_err();
    assert!(matches!(err, ControlError::InvalidMaxit(_)));

    let err = parse_tol("Inf").unwrap_err();
    assert!(err.to_string().contains("tol must be single float or list of length 2"));
    let err = Control::builder("gaussian", true).tol(&[0.0]).build().unwrap_err();
    assert!(matches!(err, ControlError::InvalidTol(_)));

    let err = Control::builder("gaussian", true)
        .left(10.0)
        .right(-10.0)
        .build()
        .unwrap_err();
    assert_eq!(err.to_string(), "left must be smaller than right.");

    let err = Control::builder("gaussian", true)
        .left(-10.0)
        .right(10.0)
        .build()
        .unwrap_err();
    assert!(matches!(err, ControlError::TwoSidedBoundsNotImplemented { .. }));
}

#[test]
fn defaults_of_a_basic_control() {
    let control = Control::new("gaussian", true).unwrap();
    assert_eq!(control.family().kind(), FamilyKind::Gaussian);
    assert_eq!(control.family().censoring(), Censoring::None);
    assert!(control.left().is_infinite() && control.left() < 0.0);
    assert!(control.right().is_infinite() && control.right() > 0.0);
    assert_eq!(control.maxit_em(), 100);
    assert_eq!(control.maxit_iwls(), 100);
    assert_eq!(control.tol_em(), 1e-8);
    assert_eq!(control.tol_iwls(), 1e-8);
    assert!(control.standardize());
    assert!(!control.force_inflate());
    assert_eq!(control.verbose(), Verbosity::Verbose);
}

#[test]
fn pairs_set_em_and_iwls_separately() {
    let control = Control::builder("logistic", false)
        .maxit(&[42, 43])
        .tol(&[1e-5, 1e-6])
        .standardize(false)
        .build()
        .unwrap();
    assert_eq!(control.family().kind(), FamilyKind::Logistic);
    assert!(!control.switch());
    assert_eq!(control.maxit_em(), 42);
    assert_eq!(control.maxit_iwls(), 43);
    assert_eq!(control.tol_em(), 1e-5);
    assert_eq!(control.tol_iwls(), 1e-6);
    assert!(!control.standardize());
}

#[test]
fn family_values_are_accepted_as_well_as_names() {
    let control = Control::new(Family::logistic(), true).unwrap();
    assert_eq!(control.family(), &Family::logistic());
    let control = Control::new(FamilyKind::Gaussian, true).unwrap();
    assert_eq!(control.family().name(), "gaussian");
}

#[test]
fn control_file_is_validated_like_the_builder() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "family = \"Gaussian\"\nswitch = true\nmaxit = 250\nleft = 0\nforce_inflate = true\nverbose = false"
    )
    .unwrap();
    file.flush().unwrap();

    let control = Control::from_toml_file(file.path()).unwrap();
    assert_eq!(control.maxit_em(), 250);
    assert_eq!(control.maxit_iwls(), 250);
    assert_eq!(control.family().censoring(), Censoring::Left(0.0));
    assert!(control.force_inflate());
    assert_eq!(control.verbose(), Verbosity::Quiet);

    let err = Control::from_toml_str("family = \"gaussian\"\nswitch = true\nleft = 5\nright = 1")
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidBounds { .. }));
}

#[test]
fn every_bound_given_to_the_builder_is_checked() {
    let err = Control::builder("gaussian", false)
        .left(f64::INFINITY)
        .build()
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidBounds { .. }));

    let err = Control::builder("gaussian", false)
        .right(f64::NEG_INFINITY)
        .build()
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidBounds { .. }));

    let err = Control::builder("logistic", true).left(f64::NAN).build().unwrap_err();
    assert!(matches!(err, ControlError::InvalidBounds { .. }));

    // explicit infinite defaults are still an uncensored family
    let control = Control::builder("gaussian", false)
        .left(f64::NEG_INFINITY)
        .right(f64::INFINITY)
        .build()
        .unwrap();
    assert_eq!(control.family().censoring(), Censoring::None);
}

#[test]
fn validated_reapplies_the_builder_checks() {
    let control = Control::builder("gaussian", true).left(0.0).maxit(&[30, 40]).build().unwrap();
    assert_eq!(control.clone().validated().unwrap(), control);
}
