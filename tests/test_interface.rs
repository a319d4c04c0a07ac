use std::fs;
use std::sync::Arc;

use aineb::core::dataset::TrainingSet;
use aineb::core::params::{DatasetParams, InterpolationScheme, KernelParams, Params};
use aineb::engine::evaluator::ReferenceEvaluator;
use aineb::engine::surrogate::SurrogateModel;
use aineb::interface::checkpoint::Checkpoint;
use aineb::interface::report;
use aineb::solvers::active::{ActiveLearningController, RunReport};
use uuid::Uuid;

use crate::common::{atom, hop_endpoints, hop_samples, CosineWell, ReferenceSurrogate};

mod common;

fn finished_run() -> RunReport {
    let reference: Arc<dyn ReferenceEvaluator> = Arc::new(CosineWell::default());
    let params = Params {
        n_images: 3,
        interpolation: InterpolationScheme::Linear,
        max_outer_iterations: 2,
        ..Params::default()
    };
    let mut ctrl =
        ActiveLearningController::new(reference.clone(), Box::new(ReferenceSurrogate::new(reference)), params).unwrap();
    let (initial, final_) = hop_endpoints();
    ctrl.run(&initial, &final_).unwrap()
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("checkpoint.json");

    let well = CosineWell::default();
    let set = TrainingSet::with_samples(0.01, hop_samples(&well, 5, 0.0));
    let run_id = Uuid::new_v4();
    Checkpoint::new(run_id, "Cosine Well", Some(4), &set).save(&path).unwrap();

    let loaded = Checkpoint::load(&path).unwrap();
    assert_eq!(loaded.run_id, run_id);
    assert_eq!(loaded.generation, Some(4));
    assert_eq!(loaded.reference, "Cosine Well");
    assert_eq!(loaded.samples.len(), 5);
    for (a, b) in loaded.samples.iter().zip(set.samples()) {
        assert_eq!(a.id(), b.id());
        assert!((a.energy() - b.energy()).abs() < 1e-12);
        assert!(a.configuration().approx_eq(b.configuration(), 1e-12));
    }
}

#[test]
fn test_checkpoint_restores_kernel_generation() {
    let well = CosineWell::default();
    let set = TrainingSet::with_samples(0.01, hop_samples(&well, 5, 0.0));
    let params = KernelParams {
        length_scale: 0.4,
        ..KernelParams::default()
    };

    let checkpoint = Checkpoint::new(Uuid::new_v4(), "Cosine Well", Some(2), &set);
    let model = checkpoint
        .restore_kernel(params.clone(), &DatasetParams::default())
        .unwrap()
        .unwrap();
    assert_eq!(model.generation(), Some(2));
    assert!(model.predict(&atom(0.5, 0.0, 0.0)).is_ok());

    let unfitted = Checkpoint::new(Uuid::new_v4(), "Cosine Well", None, &set);
    assert!(unfitted.restore_kernel(params.clone(), &DatasetParams::default()).unwrap().is_none());

    let empty = Checkpoint::new(Uuid::new_v4(), "Cosine Well", Some(0), &TrainingSet::new(0.01));
    assert!(empty.restore_kernel(params, &DatasetParams::default()).is_err());
}

#[test]
fn test_load_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    fs::write(&path, "{ not json").unwrap();
    assert!(Checkpoint::load(&path).is_err());
    assert!(Checkpoint::load(&dir.path().join("missing.json")).is_err());
}

#[test]
fn test_reports_written() {
    let report = finished_run();
    let dir = tempfile::tempdir().unwrap();
    let files = report::write_all(&report, &dir.path().join("out")).unwrap();

    let convergence = fs::read_to_string(&files.convergence).unwrap();
    assert!(convergence.starts_with("iteration,generation,"));
    assert_eq!(convergence.lines().count(), 1 + report.record.len());

    let profile = fs::read_to_string(&files.profile).unwrap();
    assert_eq!(profile.lines().count(), 1 + report.path.len());
    assert!(profile.contains("Reference"));

    let summary: serde_json::Value = serde_json::from_str(&fs::read_to_string(&files.summary).unwrap()).unwrap();
    assert_eq!(summary["status"], "Accepted");
    assert_eq!(summary["saddle_image"], 2);
    assert_eq!(summary["run_id"], report.run_id.to_string());

    let path: aineb::core::path::PathRepresentation =
        serde_json::from_str(&fs::read_to_string(&files.path).unwrap()).unwrap();
    assert_eq!(path.len(), report.path.len());
    for (a, b) in path.images().iter().zip(report.path.images()) {
        assert!(a.approx_eq(b, 1e-12));
    }
}
