use crate::drivers::SubmitRequest;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// One step of the forward model a realization runs inside its job
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ForwardModelStep {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunArg {
    pub runpath: PathBuf,
    pub job_name: String,
}

/// Immutable description of a single ensemble member.
///
/// The runtime status of a realization is tracked by the scheduler next to it,
/// never inside it.
#[derive(Clone, Debug)]
pub struct Realization {
    pub iens: usize,
    pub forward_models: Vec<ForwardModelStep>,
    /// inactive realizations are skipped entirely
    pub active: bool,
    /// None means unbounded
    pub max_runtime: Option<Duration>,
    pub run_arg: RunArg,
    pub num_cpu: u32,
    /// submitted to the backend with the runpath as its only argument
    pub job_script: PathBuf,
}

impl Realization {
    pub fn new(iens: usize, runpath: impl Into<PathBuf>, job_script: impl Into<PathBuf>) -> Self {
        Self {
            iens,
            forward_models: Vec::new(),
            active: true,
            max_runtime: None,
            run_arg: RunArg {
                runpath: runpath.into(),
                job_name: format!("realization-{iens}"),
            },
            num_cpu: 1,
            job_script: job_script.into(),
        }
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.run_arg.job_name = job_name.into();
        self
    }

    pub fn with_num_cpu(mut self, num_cpu: u32) -> Self {
        self.num_cpu = num_cpu;
        self
    }

    pub fn with_forward_models(mut self, forward_models: Vec<ForwardModelStep>) -> Self {
        self.forward_models = forward_models;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub(crate) fn submit_request(&self) -> SubmitRequest {
        SubmitRequest {
            iens: self.iens,
            executable: self.job_script.clone(),
            args: vec![self.run_arg.runpath.to_string_lossy().into_owned()],
            name: self.run_arg.job_name.clone(),
            runpath: Some(self.run_arg.runpath.clone()),
            num_cpu: self.num_cpu,
        }
    }
}
