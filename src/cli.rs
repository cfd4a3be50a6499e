//! CLI struct definitions for the `tau` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "tau",
    version = env!("CARGO_PKG_VERSION"),
    about = "Performance measurement bookkeeping: projects, experiments and trials."
)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create a project in the current directory with a default configuration
    Init {
        /// Project name
        project: String,
        /// Name of the default target
        #[clap(long)]
        target_name: Option<String>,
        /// Name of the default application (defaults to the project name)
        #[clap(long)]
        application_name: Option<String>,
    },
    /// Create, list and delete targets
    Target(TargetCli),
    /// Create, edit, list and delete applications
    Application(ApplicationCli),
    /// Create, edit, list and delete measurements
    Measurement(MeasurementCli),
    /// Create, select, list and delete experiments
    Experiment(ExperimentCli),
    /// Perform, list and delete trials of the selected experiment
    Trial(TrialCli),
    /// Compile with the selected experiment's build configuration
    Build {
        /// Compiler command and arguments
        #[clap(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },
    /// Show the project's configurations and experiments
    Dashboard,
    /// Print an entity's schema as JSON
    Schema {
        /// Project, Target, Application, Measurement, Experiment or Trial
        entity: String,
    },
}

// ===== Target =====

#[derive(clap::Args, Debug)]
pub(crate) struct TargetCli {
    #[clap(subcommand)]
    pub command: TargetCommand,
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct TargetFlags {
    /// C compiler command
    #[clap(long)]
    pub cc: Option<String>,
    /// C++ compiler command
    #[clap(long)]
    pub cxx: Option<String>,
    /// Fortran compiler command
    #[clap(long)]
    pub fc: Option<String>,
    /// TAU installation path, source archive URL, or 'download'
    #[clap(long)]
    pub tau_source: Option<String>,
    /// PDT installation path, source archive URL, or 'download'
    #[clap(long)]
    pub pdt_source: Option<String>,
    /// GNU binutils installation path, source archive URL, or 'download'
    #[clap(long)]
    pub binutils_source: Option<String>,
    /// libunwind installation path, source archive URL, or 'download'
    #[clap(long)]
    pub libunwind_source: Option<String>,
    /// PAPI installation path, source archive URL, or 'download'
    #[clap(long)]
    pub papi_source: Option<String>,
    /// NVIDIA CUDA toolkit path
    #[clap(long)]
    pub cuda_toolkit: Option<String>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TargetCommand {
    /// Create a target and add it to the project
    Create {
        name: String,
        #[clap(flatten)]
        flags: TargetFlags,
    },
    /// Change a target
    Edit {
        name: String,
        #[clap(flatten)]
        flags: TargetFlags,
    },
    /// Delete a target that no experiment uses
    Delete { name: String },
    /// List targets
    List,
}

// ===== Application =====

#[derive(clap::Args, Debug)]
pub(crate) struct ApplicationCli {
    #[clap(subcommand)]
    pub command: ApplicationCommand,
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct ApplicationFlags {
    /// Application uses OpenMP
    #[clap(long)]
    pub openmp: Option<bool>,
    /// Application uses pthreads
    #[clap(long)]
    pub pthreads: Option<bool>,
    /// Application uses MPI
    #[clap(long)]
    pub mpi: Option<bool>,
    /// Application uses NVIDIA CUDA
    #[clap(long)]
    pub cuda: Option<bool>,
    /// Application uses OpenCL
    #[clap(long)]
    pub opencl: Option<bool>,
    /// Application uses SHMEM
    #[clap(long)]
    pub shmem: Option<bool>,
    /// Application uses MPC
    #[clap(long)]
    pub mpc: Option<bool>,
    /// Application linkage: static or dynamic
    #[clap(long)]
    pub linkage: Option<String>,
    /// Selective instrumentation file
    #[clap(long)]
    pub select_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ApplicationCommand {
    /// Create an application and add it to the project
    Create {
        name: String,
        #[clap(flatten)]
        flags: ApplicationFlags,
    },
    /// Change an application
    Edit {
        name: String,
        #[clap(flatten)]
        flags: ApplicationFlags,
    },
    /// Delete an application that no experiment uses
    Delete { name: String },
    /// List applications
    List,
}

// ===== Measurement =====

#[derive(clap::Args, Debug)]
pub(crate) struct MeasurementCli {
    #[clap(subcommand)]
    pub command: MeasurementCommand,
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct MeasurementFlags {
    /// Profile format: tau, merged, cubex or none
    #[clap(long)]
    pub profile: Option<String>,
    /// Trace format: slog2, otf2 or none
    #[clap(long)]
    pub trace: Option<String>,
    /// Use event-based sampling
    #[clap(long)]
    pub sample: Option<bool>,
    /// Source instrumentation: automatic, manual or never
    #[clap(long)]
    pub source_inst: Option<String>,
    /// Compiler instrumentation: always, fallback or never
    #[clap(long)]
    pub compiler_inst: Option<String>,
    /// Measure MPI calls
    #[clap(long)]
    pub mpi: Option<bool>,
    /// OpenMP measurement: ignore, ompt or opari
    #[clap(long)]
    pub openmp: Option<String>,
    /// Measure CUDA events
    #[clap(long)]
    pub cuda: Option<bool>,
    /// Measure OpenCL events
    #[clap(long)]
    pub opencl: Option<bool>,
    /// Measure SHMEM calls
    #[clap(long)]
    pub shmem: Option<bool>,
    /// Maximum callpath depth, 0 to disable
    #[clap(long)]
    pub callpath: Option<i64>,
    /// Comma-separated performance metrics
    #[clap(long, value_delimiter = ',')]
    pub metrics: Option<Vec<String>>,
    /// Keep instrumented source files
    #[clap(long)]
    pub keep_inst_files: Option<bool>,
    /// Run without instrumentation
    #[clap(long)]
    pub baseline: Option<bool>,
    /// Throttle lightweight events
    #[clap(long)]
    pub throttle: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum MeasurementCommand {
    /// Create a measurement and add it to the project
    Create {
        name: String,
        #[clap(flatten)]
        flags: MeasurementFlags,
    },
    /// Change a measurement
    Edit {
        name: String,
        #[clap(flatten)]
        flags: MeasurementFlags,
    },
    /// Delete a measurement that no experiment uses
    Delete { name: String },
    /// List measurements
    List,
}

// ===== Experiment =====

#[derive(clap::Args, Debug)]
pub(crate) struct ExperimentCli {
    #[clap(subcommand)]
    pub command: ExperimentCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ExperimentCommand {
    /// Create an experiment from a target, application and measurement, and select it
    Create {
        name: String,
        #[clap(long)]
        target: String,
        #[clap(long)]
        application: String,
        #[clap(long)]
        measurement: String,
    },
    /// Select an experiment
    Select { name: String },
    /// Delete an experiment and all of its trials
    Delete { name: String },
    /// List the project's experiments
    List,
}

// ===== Trial =====

#[derive(clap::Args, Debug)]
pub(crate) struct TrialCli {
    #[clap(subcommand)]
    pub command: TrialCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TrialCommand {
    /// Run a command as a new trial of the selected experiment
    Create {
        /// Note stored with the trial
        #[clap(long)]
        description: Option<String>,
        /// Launcher and application command line
        #[clap(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },
    /// List the selected experiment's trials
    List,
    /// Delete a trial and its data
    Delete { number: u64 },
}
