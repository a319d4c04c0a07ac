use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::unbounded;
use log::info;
use nalgebra::Point3;

use aineb::analysis::benchmark::cross_validate;
use aineb::core::dataset::TrainingSnapshot;
use aineb::core::domain::{Configuration, Species, System};
use aineb::core::params::Params;
use aineb::engine::analytic::LennardJones;
use aineb::engine::evaluator::ReferenceEvaluator;
use aineb::engine::external::gulp::GulpEvaluator;
use aineb::engine::kernel::KernelSurrogate;
use aineb::engine::surrogate::SurrogateModel;
use aineb::interface::checkpoint::Checkpoint;
use aineb::interface::report;
use aineb::solvers::active::{ActiveLearningController, RunReport};
use aineb::solvers::SolverEvent;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "AI-NEB: active-learning nudged elastic band", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search a minimum-energy path between two endpoints
    Run(RunArgs),
    /// Cross-validate the kernel surrogate on a checkpoint's samples
    Benchmark(BenchmarkArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReferenceKind {
    /// Built-in Lennard-Jones potential (reduced units)
    Lj,
    /// External GULP binary
    Gulp,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON parameter file; missing fields take their defaults
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Initial configuration (JSON). Without endpoints the adatom-hop demo is run
    #[arg(long, requires = "final_state")]
    initial: Option<PathBuf>,

    /// Final configuration (JSON)
    #[arg(long = "final", requires = "initial")]
    final_state: Option<PathBuf>,

    /// Number of worker threads for parallel evaluation
    #[arg(short, long)]
    threads: Option<usize>,

    /// Number of interior images
    #[arg(short = 'n', long)]
    images: Option<usize>,

    /// Outer-iteration budget
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Target force convergence (eV/Å)
    #[arg(long)]
    fmax: Option<f64>,

    /// Per-evaluation timeout (seconds)
    #[arg(long)]
    timeout: Option<f64>,

    #[arg(short, long, value_enum, default_value_t = ReferenceKind::Lj)]
    reference: ReferenceKind,

    /// GULP executable
    #[arg(long, default_value = "gulp")]
    gulp: String,

    /// File holding the GULP potential block
    #[arg(long)]
    potentials: Option<PathBuf>,

    /// Element symbols, in element-id order (GULP only)
    #[arg(long, value_delimiter = ',')]
    species: Vec<String>,

    /// Resume from a checkpoint written by an earlier run
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Output directory for reports and the checkpoint
    #[arg(short, long, default_value = "aineb_out")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct BenchmarkArgs {
    /// Checkpoint whose samples are cross-validated
    checkpoint: PathBuf,

    /// JSON parameter file (kernel hyperparameters)
    #[arg(short, long)]
    params: Option<PathBuf>,

    #[arg(short, long, default_value_t = 5)]
    folds: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the benchmark report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

// --- Initialization Helpers ---

fn load_params(path: Option<&Path>) -> Result<Params> {
    match path {
        Some(p) => Params::from_json_file(p).with_context(|| format!("Failed to load parameters from {}", p.display())),
        None => Ok(Params::default()),
    }
}

fn load_configuration(path: &Path) -> Result<Configuration> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Adatom hopping between neighbouring hollow sites of a frozen 3x3 square slab.
fn adatom_hop_demo() -> Result<(Configuration, Configuration)> {
    let a = 2f64.powf(1.0 / 6.0); // LJ pair minimum, sigma = 1
    let height = a / 2f64.sqrt();

    let mut slab = Vec::with_capacity(9);
    for i in 0..3 {
        for j in 0..3 {
            slab.push(Point3::new(i as f64 * a, j as f64 * a, 0.0));
        }
    }
    let mut fixed = vec![true; slab.len()];
    fixed.push(false);

    let endpoint = |x: f64| -> Result<Configuration> {
        let mut positions = slab.clone();
        positions.push(Point3::new(x, 0.5 * a, height));
        let config = Configuration::new(vec![0; positions.len()], positions)?.with_fixed(fixed.clone())?;
        Ok(config)
    };

    Ok((endpoint(0.5 * a)?, endpoint(1.5 * a)?))
}

fn check_gulp(executable: &str) -> Result<()> {
    // We attempt to run `gulp help`. If GULP is not in PATH, this fails.
    match Command::new(executable).arg("help").output() {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "Dependency Check Failed: '{}' executable not found.\n\
             Install GULP, add it to PATH or pass --gulp <path>.",
            executable
        )),
    }
}

fn build_reference(args: &RunArgs, params: &Params) -> Result<Arc<dyn ReferenceEvaluator>> {
    match args.reference {
        ReferenceKind::Lj => Ok(Arc::new(LennardJones::new(1.0, 1.0).with_cutoff(2.5))),
        ReferenceKind::Gulp => {
            check_gulp(&args.gulp)?;
            let Some(potentials) = &args.potentials else {
                bail!("--potentials is required with the GULP reference");
            };
            if args.species.is_empty() {
                bail!("--species is required with the GULP reference");
            }
            let block = fs::read_to_string(potentials)
                .with_context(|| format!("Failed to read potentials from {}", potentials.display()))?;
            let system = System::new(args.species.iter().map(|s| Species::new(s)).collect());
            let gulp = GulpEvaluator::new(&args.gulp, block.trim(), system)?.with_timeout(params.evaluation.timeout());
            Ok(Arc::new(gulp))
        }
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run {}: {:?}", report.run_id, report.status);
    println!(
        "  iterations {}, reference evaluations {}, training samples {}, {:.1} s",
        report.record.len(),
        report.reference_evaluations,
        report.training_set_size,
        report.elapsed_secs
    );
    if let Some(barrier) = report.barrier {
        println!("  barrier {:.6} eV (saddle image {:?})", barrier, report.saddle_image());
    }
    if let Some(d) = report.discrepancy {
        println!(
            "  discrepancy: E_rmse {:.3e} E_max {:.3e} eV/atom | F_rmse {:.3e} F_max {:.3e} eV/Å",
            d.energy_rmse, d.energy_max, d.force_rmse, d.force_max
        );
    }
}

// --- Commands ---

fn run(args: RunArgs) -> Result<()> {
    // 1. Parameters
    let mut params = load_params(args.params.as_deref())?;
    if let Some(t) = args.threads {
        params.threads = t;
    }
    if let Some(n) = args.images {
        params.n_images = n;
        params.seed_images = params.seed_images.min(n);
    }
    if let Some(m) = args.max_iterations {
        params.max_outer_iterations = m;
    }
    if let Some(f) = args.fmax {
        params.neb.fmax = f;
    }
    if let Some(t) = args.timeout {
        params.evaluation.timeout_secs = t;
    }
    params.validate()?;

    // 2. Endpoints & physics components
    let (initial, final_) = match (&args.initial, &args.final_state) {
        (Some(i), Some(f)) => (load_configuration(i)?, load_configuration(f)?),
        _ => {
            info!("No endpoints given, running the Lennard-Jones adatom-hop demo");
            adatom_hop_demo()?
        }
    };
    let reference = build_reference(&args, &params)?;
    let reference_name = reference.name().to_string();

    let mut prior = Vec::new();
    let mut surrogate: Box<dyn SurrogateModel> = Box::new(KernelSurrogate::new(params.kernel.clone()));
    if let Some(path) = &args.resume {
        let checkpoint = Checkpoint::load(path)?;
        if let Some(model) = checkpoint.restore_kernel(params.kernel.clone(), &params.dataset)? {
            surrogate = Box::new(model);
        }
        prior = checkpoint.samples;
    }

    // 3. Spawn Solver Thread
    let (tx, rx) = unbounded();
    let threads = params.threads;

    let handle = thread::Builder::new()
        .name("Solver-Worker".to_string())
        .spawn(move || -> aineb::core::error::Result<(RunReport, Checkpoint)> {
            // Initialize Rayon global thread pool for parallel evaluations
            let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();

            let mut controller = ActiveLearningController::new(reference, surrogate, params)?
                .with_prior_samples(prior)
                .with_events(tx);
            let report = controller.run(&initial, &final_)?;
            let checkpoint = Checkpoint::new(
                controller.run_id(),
                &reference_name,
                controller.surrogate().generation(),
                controller.training_set(),
            );
            Ok((report, checkpoint))
        })?;

    // 4. Event Loop (ends when the worker drops its sender)
    for event in rx {
        match event {
            SolverEvent::Log(msg) => info!("{}", msg),
            SolverEvent::PhaseChanged(phase) => info!("Phase: {:?}", phase),
            SolverEvent::GenerationFitted { generation, samples } => {
                info!("Surrogate generation {} fitted on {} samples", generation, samples)
            }
            SolverEvent::IterationUpdate(entry) => {
                let (e_max, f_max) = entry
                    .discrepancy
                    .map_or((f64::NAN, f64::NAN), |d| (d.energy_max, d.force_max));
                println!(
                    "[{:>3}] gen {:>3} | {:<24} | fmax {:>9.3e} | dE {:>9.3e} | dF {:>9.3e} | set {:>4}",
                    entry.iteration,
                    entry.generation.map_or("-".to_string(), |g| g.to_string()),
                    format!("{:?} ({})", entry.optimizer_state, entry.optimizer_steps),
                    entry.max_force,
                    e_max,
                    f_max,
                    entry.training_set_size
                );
            }
            SolverEvent::Finished(status) => info!("Finished: {:?}", status),
        }
    }

    let (report, checkpoint) = handle.join().map_err(|_| anyhow!("Solver thread panicked"))??;

    // 5. Persist
    report::write_all(&report, &args.output)?;
    checkpoint.save(&args.output.join("checkpoint.json"))?;
    print_summary(&report);
    Ok(())
}

fn benchmark(args: BenchmarkArgs) -> Result<()> {
    let params = load_params(args.params.as_deref())?;
    let checkpoint = Checkpoint::load(&args.checkpoint)?;
    let snapshot = TrainingSnapshot::from_samples(checkpoint.samples);

    let kernel = params.kernel.clone();
    let result = cross_validate(&snapshot, args.folds, args.seed, || {
        Box::new(KernelSurrogate::new(kernel.clone())) as Box<dyn SurrogateModel>
    })?;

    println!(
        "{}: {} folds ({} failed)",
        result.model,
        result.folds.len(),
        result.failed_folds
    );
    println!(
        "  train      E_rmse {:.3e} E_max {:.3e} | F_rmse {:.3e} F_max {:.3e}",
        result.mean_train.energy_rmse,
        result.mean_train.energy_max,
        result.mean_train.force_rmse,
        result.mean_train.force_max
    );
    println!(
        "  validation E_rmse {:.3e} E_max {:.3e} | F_rmse {:.3e} F_max {:.3e}",
        result.mean_validation.energy_rmse,
        result.mean_validation.energy_max,
        result.mean_validation.force_rmse,
        result.mean_validation.force_max
    );

    if let Some(path) = &args.output {
        fs::write(path, serde_json::to_string_pretty(&result)?)?;
    }
    Ok(())
}

// --- Main ---

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Run(args) => run(args),
        Commands::Benchmark(args) => benchmark(args),
    }
}
