use crate::{
    drivers::{lsf::LsfOptions, openpbs::OpenPbsOptions, slurm::SlurmOptions},
    realization::{ForwardModelStep, Realization},
    scheduler::{DispatchInfo, SchedulerOptions},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// placeholder replaced by the realization index in runpaths and job names
pub const IENS_PLACEHOLDER: &str = "<IENS>";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {0}")]
    ReadConfig(PathBuf, #[source] Error),
    #[error("Config is not valid")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to read certificate {0}")]
    ReadCertificate(PathBuf, #[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub ensemble: EnsembleConfig,
    // stop once this many realizations succeeded, all of them if unset
    #[serde(default)]
    pub min_required_realizations: Option<usize>,
    // connection to the ensemble evaluator, written into the job manifests
    #[serde(default)]
    pub dispatch: Option<DispatchConfig>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueSystem {
    Local,
    Lsf,
    OpenPbs,
    Slurm,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    pub system: QueueSystem,
    // queue for LSF and PBS, partition for Slurm
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub max_running: usize,
    #[serde(default = "default_max_submit")]
    pub max_submit: u32,
    // seconds between two submissions
    #[serde(default)]
    pub submit_sleep: f64,

    #[serde(default)]
    pub lsf: Option<LsfOptions>,
    #[serde(default)]
    pub openpbs: Option<OpenPbsOptions>,
    #[serde(default)]
    pub slurm: Option<SlurmOptions>,
}

fn default_max_submit() -> u32 {
    2
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EnsembleConfig {
    pub size: usize,
    pub runpath: String,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    pub job_script: PathBuf,
    #[serde(default = "default_num_cpu")]
    pub num_cpu: u32,
    // seconds, 0 or unset means unbounded
    #[serde(default)]
    pub max_runtime: Option<u64>,
    #[serde(default)]
    pub inactive: Vec<usize>,
    #[serde(default)]
    pub forward_model: Vec<ForwardModelStep>,
}

fn default_job_name() -> String {
    format!("realization-{IENS_PLACEHOLDER}")
}

fn default_num_cpu() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    pub ee_uri: Option<String>,
    pub ens_id: Option<String>,
    pub ee_token: Option<String>,
    pub ee_cert_path: Option<PathBuf>,
}

impl DispatchConfig {
    /// resolve the certificate path into its content
    pub fn dispatch_info(&self) -> Result<DispatchInfo, ConfigErrors> {
        let ee_cert = self
            .ee_cert_path
            .as_ref()
            .map(|path| {
                fs::read_to_string(path)
                    .map_err(|error| ConfigErrors::ReadCertificate(path.clone(), error))
            })
            .transpose()?;

        Ok(DispatchInfo {
            ens_id: self.ens_id.clone(),
            ee_uri: self.ee_uri.clone(),
            ee_token: self.ee_token.clone(),
            ee_cert,
        })
    }
}

impl QueueConfig {
    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_running: self.max_running,
            max_submit: self.max_submit,
            submit_sleep: Duration::try_from_secs_f64(self.submit_sleep).unwrap_or_default(),
        }
    }
}

impl EnsembleConfig {
    /// expand the template into one realization per index
    pub fn realizations(&self) -> Vec<Realization> {
        let max_runtime = self
            .max_runtime
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs);

        (0..self.size)
            .map(|iens| {
                let index = iens.to_string();
                let mut realization = Realization::new(
                    iens,
                    self.runpath.replace(IENS_PLACEHOLDER, &index),
                    self.job_script.clone(),
                )
                .with_job_name(self.job_name.replace(IENS_PLACEHOLDER, &index))
                .with_num_cpu(self.num_cpu)
                .with_forward_models(self.forward_model.clone());

                realization.max_runtime = max_runtime;
                if self.inactive.contains(&iens) {
                    realization = realization.inactive();
                }
                realization
            })
            .collect()
    }

    /// make a relative runpath relative to `base` instead of the working directory
    pub fn anchor_runpath(&mut self, base: &Path) {
        if Path::new(&self.runpath).is_relative() {
            self.runpath = base.join(&self.runpath).to_string_lossy().into_owned();
        }
    }
}

impl SchedulerConfig {
    /// Read a config file, relative runpaths are taken from the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content =
            fs::read_to_string(path).map_err(|error| ConfigErrors::ReadConfig(path.into(), error))?;
        let mut config = Self::parse(&content)?;

        let path = fs::canonicalize(path).map_err(|error| ConfigErrors::ReadConfig(path.into(), error))?;
        if let Some(config_dir) = path.parent() {
            config.ensemble.anchor_runpath(config_dir);
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.queue.max_submit == 0 {
            error!("queue.max_submit must be at least 1");
            contains_error = true;
        }

        if !self.queue.submit_sleep.is_finite() || self.queue.submit_sleep < 0.0 {
            error!(
                "queue.submit_sleep ({}) must be a non-negative number of seconds",
                self.queue.submit_sleep
            );
            contains_error = true;
        }

        let configured = [
            (QueueSystem::Lsf, "lsf", self.queue.lsf.as_ref().map(LsfOptions::commands)),
            (
                QueueSystem::OpenPbs,
                "openpbs",
                self.queue.openpbs.as_ref().map(OpenPbsOptions::commands),
            ),
            (
                QueueSystem::Slurm,
                "slurm",
                self.queue.slurm.as_ref().map(SlurmOptions::commands),
            ),
        ];
        for (system, name, commands) in configured {
            let Some(commands) = commands else {
                continue;
            };

            if system != self.queue.system {
                warn!("queue.{name} is ignored, the configured queue.system is {:?}", self.queue.system);
                continue;
            }

            for (option, path) in commands {
                // bare names are looked up on PATH when the driver runs them
                if path.components().count() < 2 {
                    continue;
                }
                if !matches!(check_executable(path), Ok(true)) {
                    error!("queue.{name}.{option} ({}) must be a valid path to an executable file", path.display());
                    contains_error = true;
                }
            }
        }

        let ensemble = &mut self.ensemble;
        if ensemble.size == 0 {
            warn!("ensemble.size is 0, nothing will be submitted");
        }

        if ensemble.size > 1 && !ensemble.runpath.contains(IENS_PLACEHOLDER) {
            error!(
                "ensemble.runpath ({}) must contain {IENS_PLACEHOLDER}, otherwise all realizations share one directory",
                ensemble.runpath
            );
            contains_error = true;
        }

        if ensemble.num_cpu == 0 {
            error!("ensemble.num_cpu must be at least 1");
            contains_error = true;
        }

        match check_executable(&ensemble.job_script) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "ensemble.job_script ({}) is not executable",
                    ensemble.job_script.display()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "ensemble.job_script ({}) must be a valid path to an executable file: {e}",
                    ensemble.job_script.display()
                );
                contains_error = true;
            }
        }

        let size = ensemble.size;
        let (inactive, out_of_range): (Vec<usize>, Vec<usize>) = ensemble
            .inactive
            .iter()
            .copied()
            .sorted()
            .dedup()
            .partition(|iens| *iens < size);
        if !out_of_range.is_empty() {
            warn!(
                "ensemble.inactive contains indices outside the ensemble, ignoring {}",
                out_of_range.iter().join(", ")
            );
        }
        ensemble.inactive = inactive;

        let active = size - ensemble.inactive.len();
        if let Some(required) = self.min_required_realizations {
            if required > active {
                error!("min_required_realizations ({required}) exceeds the number of active realizations ({active})");
                contains_error = true;
            }
        }

        if let Some(path) = self
            .dispatch
            .as_ref()
            .and_then(|dispatch| dispatch.ee_cert_path.as_ref())
        {
            if !path.is_file() {
                error!("dispatch.ee_cert_path ({}) does not exist", path.display());
                contains_error = true;
            }
        }

        contains_error
    }
}
