//! External tool installation capability.
//!
//! Building and configuring the measurement tooling is out of this crate's
//! hands; the record layer only asks an [`Installer`] to make sure the tooling
//! for an experiment's configuration exists, then uses the returned handle to
//! adjust build and run environments.

use crate::core::error::TauError;
use crate::core::record::Fields;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub type Environment = BTreeMap<String, String>;

/// Everything an installer needs to know about the experiment being configured.
/// Each map holds the stored fields with schema defaults filled in.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub target: Fields,
    pub application: Fields,
    pub measurement: Fields,
}

impl InstallRequest {
    fn measurement_str(&self, attr: &str) -> &str {
        self.measurement
            .get(attr)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn measurement_bool(&self, attr: &str) -> bool {
        self.measurement
            .get(attr)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn application_bool(&self, attr: &str) -> bool {
        self.application
            .get(attr)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn baseline(&self) -> bool {
        self.measurement_bool("baseline")
    }
}

/// A configured tool installation.
pub trait ToolInstallation {
    /// Name of the build configuration file, recorded on the experiment.
    fn makefile(&self) -> Option<String>;

    /// Adjust the environment used to compile the application.
    fn apply_compile_time_config(&self, env: &mut Environment) -> Result<(), TauError>;

    /// Adjust the environment used to run the application.
    fn apply_run_time_config(&self, env: &mut Environment) -> Result<(), TauError>;

    /// Full command line for a launcher plus application commands.
    fn application_command(&self, launcher: &[String], application_cmds: &[Vec<String>]) -> Vec<String> {
        let mut cmd = launcher.to_vec();
        for (idx, app) in application_cmds.iter().enumerate() {
            if idx > 0 && app.first().map(String::as_str) != Some(":") {
                cmd.push(":".to_string());
            }
            cmd.extend(app.iter().cloned());
        }
        cmd
    }
}

pub trait Installer {
    fn ensure_installed(&self, request: &InstallRequest) -> Result<Box<dyn ToolInstallation>, TauError>;
}

/// Uses whatever tooling is already on the host and only translates the
/// measurement configuration into run-time environment variables.
#[derive(Debug, Clone, Default)]
pub struct HostInstaller;

impl Installer for HostInstaller {
    fn ensure_installed(&self, request: &InstallRequest) -> Result<Box<dyn ToolInstallation>, TauError> {
        let installation = HostInstallation::from_request(request);
        debug!("Using host tooling ({:?})", installation.makefile());
        Ok(Box::new(installation))
    }
}

#[derive(Debug, Clone)]
pub struct HostInstallation {
    makefile: Option<String>,
    run_env: Environment,
}

impl HostInstallation {
    pub fn from_request(request: &InstallRequest) -> Self {
        let mut run_env = Environment::new();
        let baseline = request.baseline();

        let profile = request.measurement_str("profile");
        if baseline || profile == "none" {
            run_env.insert("TAU_PROFILE".into(), "0".into());
        } else {
            run_env.insert("TAU_PROFILE".into(), "1".into());
            let format = match profile {
                "merged" => "merged",
                "cubex" => "cubex",
                _ => "profile",
            };
            run_env.insert("TAU_PROFILE_FORMAT".into(), format.into());
        }

        let trace = request.measurement_str("trace");
        if !baseline && trace != "none" && !trace.is_empty() {
            run_env.insert("TAU_TRACE".into(), "1".into());
            if trace == "otf2" {
                run_env.insert("TAU_TRACE_FORMAT".into(), "otf2".into());
            }
        }

        if !baseline {
            if let Some(depth) = request.measurement.get("callpath").and_then(Value::as_i64) {
                if depth > 0 {
                    run_env.insert("TAU_CALLPATH".into(), "1".into());
                    run_env.insert("TAU_CALLPATH_DEPTH".into(), depth.to_string());
                }
            }
            if let Some(metrics) = request.measurement.get("metrics").and_then(Value::as_array) {
                let names: Vec<&str> = metrics.iter().filter_map(Value::as_str).collect();
                if !names.is_empty() {
                    run_env.insert("TAU_METRICS".into(), names.join(":"));
                }
            }
            if request.measurement_bool("sample") {
                run_env.insert("TAU_SAMPLING".into(), "1".into());
            }
            let throttle = request.measurement_bool("throttle");
            run_env.insert("TAU_THROTTLE".into(), if throttle { "1" } else { "0" }.into());
        }

        let makefile = (!baseline).then(|| {
            let mut tags = Vec::new();
            for (feature, tag) in [("mpi", "mpi"), ("openmp", "openmp"), ("pthreads", "pthread"), ("cuda", "cupti"), ("shmem", "shmem")] {
                if request.application_bool(feature) {
                    tags.push(tag);
                }
            }
            if request.measurement_str("source_inst") != "never" {
                tags.push("pdt");
            }
            if tags.is_empty() {
                "Makefile.tau".to_string()
            } else {
                format!("Makefile.tau-{}", tags.join("-"))
            }
        });

        Self { makefile, run_env }
    }
}

impl ToolInstallation for HostInstallation {
    fn makefile(&self) -> Option<String> {
        self.makefile.clone()
    }

    fn apply_compile_time_config(&self, env: &mut Environment) -> Result<(), TauError> {
        if let Some(makefile) = &self.makefile {
            env.insert("TAU_MAKEFILE".into(), makefile.clone());
        }
        Ok(())
    }

    fn apply_run_time_config(&self, env: &mut Environment) -> Result<(), TauError> {
        env.extend(self.run_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
