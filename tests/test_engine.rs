use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aineb::core::dataset::TrainingSnapshot;
use aineb::core::domain::{Species, System};
use aineb::core::error::{EvaluationError, SurrogateError};
use aineb::core::params::{EvaluationPolicy, KernelParams};
use aineb::engine::analytic::LennardJones;
use aineb::engine::evaluator::{evaluate_batch, evaluate_with_policy, ReferenceEvaluator};
use aineb::engine::external::gulp::GulpEvaluator;
use aineb::engine::idpp::IdppSurface;
use aineb::engine::kernel::KernelSurrogate;
use aineb::engine::surface::{EnergySurface, ReferenceSurface};
use aineb::engine::surrogate::SurrogateModel;

use crate::common::{atom, atoms, hop_samples, CosineWell, FailingEvaluator, SlowEvaluator};

mod common;

fn kernel_params() -> KernelParams {
    KernelParams {
        length_scale: 0.4,
        ..KernelParams::default()
    }
}

fn fitted_kernel() -> KernelSurrogate {
    let well = CosineWell::default();
    let mut samples = hop_samples(&well, 6, 0.0);
    samples.extend(hop_samples(&well, 4, 0.2));
    let mut model = KernelSurrogate::new(kernel_params());
    model.fit(&TrainingSnapshot::from_samples(samples)).unwrap();
    model
}

#[test]
fn test_kernel_generation_counter() {
    let well = CosineWell::default();
    let snapshot = TrainingSnapshot::from_samples(hop_samples(&well, 5, 0.0));
    let mut model = KernelSurrogate::new(kernel_params());

    assert_eq!(model.generation(), None);
    assert!(matches!(model.predict(&atom(0.5, 0.0, 0.0)), Err(SurrogateError::NotFitted)));

    model.fit(&snapshot).unwrap();
    assert_eq!(model.generation(), Some(0));
    model.fit(&snapshot).unwrap();
    assert_eq!(model.generation(), Some(1));
}

#[test]
fn test_kernel_failed_fit_keeps_previous_model() {
    let mut model = fitted_kernel();
    let probe = atom(0.3, 0.1, 0.0);
    let before = model.predict(&probe).unwrap();
    let generation = model.generation();

    let err = model.fit(&TrainingSnapshot::from_samples(Vec::new())).unwrap_err();
    assert_eq!(err, SurrogateError::EmptyTrainingSet);
    assert_eq!(model.generation(), generation);
    assert_eq!(model.predict(&probe).unwrap(), before);
}

#[test]
fn test_kernel_predict_is_idempotent() {
    let model = fitted_kernel();
    let probe = atom(0.37, 0.05, -0.02);
    let a = model.predict(&probe).unwrap();
    let b = model.predict(&probe).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_kernel_reproduces_training_data() {
    let well = CosineWell::default();
    let model = fitted_kernel();

    for sample in hop_samples(&well, 6, 0.0) {
        let p = model.predict(sample.configuration()).unwrap();
        assert!(
            (p.energy - sample.energy()).abs() < 1e-2,
            "energy {} vs reference {}",
            p.energy,
            sample.energy()
        );
    }
}

#[test]
fn test_kernel_forces_are_energy_gradient() {
    let model = fitted_kernel();
    let h = 1e-5;
    let (x, y) = (0.41, 0.07);

    let f = model.predict(&atom(x, y, 0.0)).unwrap().forces[0];
    let fd_x = -(model.predict(&atom(x + h, y, 0.0)).unwrap().energy - model.predict(&atom(x - h, y, 0.0)).unwrap().energy)
        / (2.0 * h);
    let fd_y = -(model.predict(&atom(x, y + h, 0.0)).unwrap().energy - model.predict(&atom(x, y - h, 0.0)).unwrap().energy)
        / (2.0 * h);

    assert!((f.x - fd_x).abs() < 1e-4 * (1.0 + fd_x.abs()), "Fx {} vs {}", f.x, fd_x);
    assert!((f.y - fd_y).abs() < 1e-4 * (1.0 + fd_y.abs()), "Fy {} vs {}", f.y, fd_y);
}

#[test]
fn test_kernel_rejects_wrong_dimension() {
    let model = fitted_kernel();
    let two_atoms = atoms(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
    assert_eq!(
        model.predict(&two_atoms).unwrap_err(),
        SurrogateError::DimensionMismatch { expected: 3, actual: 6 }
    );
}

#[test]
fn test_kernel_restore_resumes_generation() {
    let well = CosineWell::default();
    let snapshot = TrainingSnapshot::from_samples(hop_samples(&well, 5, 0.0));
    let mut model = KernelSurrogate::restore(kernel_params(), &snapshot, 7).unwrap();
    assert_eq!(model.generation(), Some(7));
    model.fit(&snapshot).unwrap();
    assert_eq!(model.generation(), Some(8));
}

#[test]
fn test_lennard_jones_forces() {
    let lj = LennardJones::new(1.0, 1.0);
    let h = 1e-6;
    let config = atoms(&[[0.0, 0.0, 0.0], [1.2, 0.1, 0.0], [0.3, 1.1, 0.2]]);
    let sample = lj.evaluate(&config).unwrap();

    // Newton's third law: forces sum to zero
    let total = sample.forces().iter().fold(nalgebra::Vector3::zeros(), |acc, f| acc + f);
    assert!(total.norm() < 1e-10);

    let shifted = |dx: f64| atoms(&[[0.0, 0.0, 0.0], [1.2 + dx, 0.1, 0.0], [0.3, 1.1, 0.2]]);
    let fd = -(lj.evaluate(&shifted(h)).unwrap().energy() - lj.evaluate(&shifted(-h)).unwrap().energy()) / (2.0 * h);
    assert!((sample.forces()[1].x - fd).abs() < 1e-5);

    // Pair minimum at 2^(1/6)
    let r0 = 2f64.powf(1.0 / 6.0);
    let dimer = lj.evaluate(&atoms(&[[0.0, 0.0, 0.0], [r0, 0.0, 0.0]])).unwrap();
    assert!((dimer.energy() + 1.0).abs() < 1e-12);
    assert!(dimer.fmax() < 1e-10);
}

#[test]
fn test_lennard_jones_coincident_atoms() {
    let lj = LennardJones::new(1.0, 1.0);
    let err = lj.evaluate(&atoms(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]])).unwrap_err();
    assert!(matches!(err, EvaluationError::Malformed(_)));
}

#[test]
fn test_retries_exhausted() {
    let failing = Arc::new(FailingEvaluator::new());
    let evaluator: Arc<dyn ReferenceEvaluator> = failing.clone();
    let policy = EvaluationPolicy {
        max_retries: 2,
        timeout_secs: 5.0,
    };

    let err = evaluate_with_policy(&evaluator, &atom(0.0, 0.0, 0.0), &policy).unwrap_err();
    match err {
        EvaluationError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, EvaluationError::Solver(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_timeout_does_not_hang() {
    let evaluator: Arc<dyn ReferenceEvaluator> = Arc::new(SlowEvaluator {
        delay: Duration::from_secs(2),
        inner: CosineWell::default(),
    });
    let policy = EvaluationPolicy {
        max_retries: 0,
        timeout_secs: 0.05,
    };

    let start = Instant::now();
    let err = evaluate_with_policy(&evaluator, &atom(0.0, 0.0, 0.0), &policy).unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(1), "timeout was not enforced");
    match err {
        EvaluationError::RetriesExhausted { attempts: 1, last } => {
            assert!(matches!(*last, EvaluationError::Timeout(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_batch_keeps_order() {
    let evaluator: Arc<dyn ReferenceEvaluator> = Arc::new(CosineWell::default());
    let configs: Vec<_> = (0..8).map(|i| atom(i as f64 * 0.1, 0.0, 0.0)).collect();
    let results = evaluate_batch(&evaluator, &configs, &EvaluationPolicy::default());

    assert_eq!(results.len(), 8);
    for (config, result) in configs.iter().zip(results) {
        let sample = result.unwrap();
        assert!(sample.configuration().approx_eq(config, 0.0));
        assert_eq!(sample.source(), "Cosine Well");
    }
}

#[test]
fn test_idpp_surface_targets() {
    let initial = atoms(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
    let final_ = atoms(&[[0.0, 0.0, 0.0], [3.0, 0.0, 0.0]]);
    let surface = IdppSurface::new(&initial, &final_, 3);

    // Midpoint image wants d = 2.0: zero objective and zero force there
    let at_target = surface.evaluate_image(1, &atoms(&[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]])).unwrap();
    assert!(at_target.energy.abs() < 1e-12);
    assert!(at_target.forces.iter().all(|f| f.norm() < 1e-12));

    // Too short: the pair is pushed apart
    let short = surface.evaluate_image(1, &atoms(&[[0.0, 0.0, 0.0], [1.5, 0.0, 0.0]])).unwrap();
    assert!(short.energy > 0.0);
    assert!(short.forces[1].x > 0.0 && short.forces[0].x < 0.0);
}

const GULP_OUTPUT: &str = "
  Components of energy :
  --------------------------------------------------------------------------------
  Total lattice energy       =         -40.12345678 eV
  --------------------------------------------------------------------------------
  Total lattice energy       =          -3871.2345 kJ/(mole unit cells)
  --------------------------------------------------------------------------------

  Final Cartesian derivatives :

--------------------------------------------------------------------------------
   No.  Atomic          x             y             z           Radius
        Label       (eV/Angs)     (eV/Angs)    (eV/Angs)      (eV/Angs)
--------------------------------------------------------------------------------
      1 Mg    c       0.100000     -0.200000      0.300000      0.000000
      2 O     c      -0.100000      0.200000     -0.300000      0.000000
      3 O     s       9.900000      9.900000      9.900000      0.000000
--------------------------------------------------------------------------------
";

fn gulp() -> GulpEvaluator {
    let system = System::new(vec![Species::new("Mg"), Species::new("O")]);
    GulpEvaluator::new("gulp", "buckingham\nMg core O shel 1280.1 0.29969 0.0 0.0 10.0", system).unwrap()
}

#[test]
fn test_gulp_parses_energy_and_forces() {
    let config = aineb::core::domain::Configuration::new(
        vec![0, 1],
        vec![nalgebra::Point3::origin(), nalgebra::Point3::new(2.1, 0.0, 0.0)],
    )
    .unwrap();

    let sample = gulp().parse_output(GULP_OUTPUT, &config).unwrap();
    assert!((sample.energy() + 40.12345678).abs() < 1e-9);
    assert_eq!(sample.forces().len(), 2);
    // Forces are negated gradients
    assert!((sample.forces()[0].x + 0.1).abs() < 1e-12);
    assert!((sample.forces()[0].y - 0.2).abs() < 1e-12);
    assert!((sample.forces()[1].z - 0.3).abs() < 1e-12);
    assert_eq!(sample.source(), "GULP (Pipe)");
}

#[test]
fn test_gulp_reports_errors() {
    let config = atoms(&[[0.0, 0.0, 0.0], [2.1, 0.0, 0.0]]);

    let collapsed = format!("{}\n Interatomic distance too small\n", GULP_OUTPUT);
    assert!(matches!(
        gulp().parse_output(&collapsed, &config),
        Err(EvaluationError::Malformed(_))
    ));

    let crashed = "  !! ERROR : unknown keyword\n";
    assert!(matches!(gulp().parse_output(crashed, &config), Err(EvaluationError::Solver(_))));

    let truncated = "  Total lattice energy       =         -40.1 eV\n";
    assert!(matches!(
        gulp().parse_output(truncated, &config),
        Err(EvaluationError::Malformed(_))
    ));
}

#[cfg(unix)]
#[test]
fn test_gulp_process_with_noisy_stderr() {
    use std::os::unix::fs::PermissionsExt;

    // Stand-in executable: floods stderr well past a pipe buffer before printing any output
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("gulp");
    let body = format!(
        "#!/bin/sh\ncat > /dev/null\nhead -c 262144 /dev/zero | tr '\\0' x >&2\ncat <<'END'\n{}END\n",
        GULP_OUTPUT
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let system = System::new(vec![Species::new("Mg"), Species::new("O")]);
    let evaluator = GulpEvaluator::new(script.to_str().unwrap(), "", system)
        .unwrap()
        .with_timeout(Duration::from_secs(30));
    let config = atoms(&[[0.0, 0.0, 0.0], [2.1, 0.0, 0.0]]);

    let start = Instant::now();
    let sample = evaluator.evaluate(&config).unwrap();
    assert!(start.elapsed() < Duration::from_secs(30));
    assert!((sample.energy() + 40.12345678).abs() < 1e-9);
    assert_eq!(sample.forces().len(), 2);
}

#[test]
fn test_reference_surface_applies_policy() {
    let well: Arc<dyn ReferenceEvaluator> = Arc::new(CosineWell::default());
    let surface = ReferenceSurface::new(well, EvaluationPolicy::default());
    let p = surface.evaluate_image(3, &atom(0.5, 0.1, 0.0)).unwrap();
    assert!((p.energy - 0.51).abs() < 1e-12);
    assert!((p.forces[0].y + 0.2).abs() < 1e-12);
    assert_eq!(surface.generation(), None);

    let failing: Arc<dyn ReferenceEvaluator> = Arc::new(FailingEvaluator::new());
    let surface = ReferenceSurface::new(
        failing,
        EvaluationPolicy {
            max_retries: 0,
            timeout_secs: 5.0,
        },
    );
    assert!(matches!(
        surface.evaluate_image(1, &atom(0.0, 0.0, 0.0)),
        Err(aineb::core::error::Error::Evaluation(EvaluationError::RetriesExhausted { attempts: 1, .. }))
    ));
}
