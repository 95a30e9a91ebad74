//! Parameter resolution.
//!
//! The resolver turns a workflow phase plus the execution context into
//! concrete work: the normalized input, the model job, the CC job list, the
//! device list, and the per-device QC job list. It is pure: no I/O, and the
//! same context always yields the same plan (job ids aside).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fmt::Display;

use crate::config::ResolverConfig;
use crate::error::ResolveError;
use crate::execution::{ExecutionContext, ModelArtifact};
use crate::job::{ComputeShape, DeviceArn, JobKind, JobSpec};

const ALLOWED_KEYS: [&str; 9] = [
    "version",
    "runMode",
    "molFile",
    "modelVersion",
    "experimentName",
    "optParams",
    "modelParams",
    "devicesArns",
    "ccResources",
];

const DEVICE_ARN_PREFIX: &str = "arn:aws:braket:";
const MAX_EXPERIMENT_NAME: usize = 100;
const MAX_CC_VCPUS: u32 = 96;

/// Phase of the workflow asking for parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    CheckInput,
    CreateModel,
    ParamsForCc,
    QcDeviceList,
    ParamsForQcDevice(DeviceArn),
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::CheckInput => "CHECK_INPUT",
            Phase::CreateModel => "CREATE_MODEL",
            Phase::ParamsForCc => "PARAMS_FOR_CC",
            Phase::QcDeviceList => "QC_DEVICE_LIST",
            Phase::ParamsForQcDevice(_) => "PARAMS_FOR_QC_DEVICE",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a phase resolved to.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// Normalized, validated user input.
    Input(Value),
    /// The single model-creation job and where its artifact will land.
    Model { spec: JobSpec, location: String },
    Jobs(Vec<JobSpec>),
    Devices(Vec<DeviceArn>),
}

impl Resolved {
    pub fn into_input(self, phase: &Phase) -> Result<Value, ResolveError> {
        match self {
            Resolved::Input(value) => Ok(value),
            _ => Err(ResolveError::UnexpectedResolution(phase.as_str())),
        }
    }

    pub fn into_model(self, phase: &Phase) -> Result<(JobSpec, String), ResolveError> {
        match self {
            Resolved::Model { spec, location } => Ok((spec, location)),
            _ => Err(ResolveError::UnexpectedResolution(phase.as_str())),
        }
    }

    pub fn into_jobs(self, phase: &Phase) -> Result<Vec<JobSpec>, ResolveError> {
        match self {
            Resolved::Jobs(jobs) => Ok(jobs),
            _ => Err(ResolveError::UnexpectedResolution(phase.as_str())),
        }
    }

    pub fn into_devices(self, phase: &Phase) -> Result<Vec<DeviceArn>, ResolveError> {
        match self {
            Resolved::Devices(devices) => Ok(devices),
            _ => Err(ResolveError::UnexpectedResolution(phase.as_str())),
        }
    }
}

/// Maps `(phase, context)` to concrete parameters.
///
/// `artifact` is the model built for the execution; phases after
/// CREATE_MODEL require it.
pub trait ParameterResolver: Send + Sync {
    fn resolve(
        &self,
        phase: &Phase,
        ctx: &ExecutionContext,
        artifact: Option<&ModelArtifact>,
    ) -> Result<Resolved, ResolveError>;
}

/// Model hyper-parameter grid. Every combination becomes one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(rename = "M")]
    pub m: Vec<u32>,
    #[serde(rename = "D")]
    pub d: Vec<u32>,
    #[serde(rename = "A")]
    pub a: Vec<u32>,
    #[serde(rename = "HQ")]
    pub hq: Vec<u32>,
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), ResolveError> {
        for (name, values) in [("M", &self.m), ("D", &self.d), ("A", &self.a), ("HQ", &self.hq)] {
            if values.is_empty() {
                return invalid(format!("modelParams.{name} must not be empty"));
            }
            if values.contains(&0) {
                return invalid(format!("modelParams.{name} values must be positive"));
            }
        }
        if let Some(m) = self.m.iter().find(|m| !(1..=100).contains(*m)) {
            return invalid(format!("modelParams.M value {m} is outside 1..=100"));
        }
        if let Some(d) = self.d.iter().find(|d| !matches!(**d, 4 | 8)) {
            return invalid(format!("modelParams.D value {d} must be 4 or 8"));
        }
        Ok(())
    }

    /// Cartesian product of the grid in `M, D, A, HQ` order.
    pub fn combinations(&self) -> Vec<ParamSet> {
        let mut sets = Vec::with_capacity(
            self.m.len() * self.d.len() * self.a.len() * self.hq.len(),
        );
        for &m in &self.m {
            for &d in &self.d {
                for &a in &self.a {
                    for &hq in &self.hq {
                        sets.push(ParamSet { m, d, a, hq });
                    }
                }
            }
        }
        sets
    }
}

/// One point of the [`ModelParams`] grid.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ParamSet {
    #[serde(rename = "M")]
    pub m: u32,
    #[serde(rename = "D")]
    pub d: u32,
    #[serde(rename = "A")]
    pub a: u32,
    #[serde(rename = "HQ")]
    pub hq: u32,
}

impl ParamSet {
    fn push_args(&self, args: &mut Vec<String>) {
        let flags = [("--M", self.m), ("--D", self.d), ("--A", self.a), ("--HQ", self.hq)];
        for (flag, value) in flags {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }
}

/// Normalized experiment input, as frozen into the context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentInput {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<String>,
    pub mol_file: String,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub opt_params: Value,
    pub model_params: ModelParams,
    pub devices_arns: Vec<DeviceArn>,
    /// `[vcpus, memory_gib]` pairs.
    pub cc_resources: Vec<[u32; 2]>,
}

impl ExperimentInput {
    pub fn cc_shapes(&self) -> Vec<ComputeShape> {
        self.cc_resources
            .iter()
            .map(|[vcpus, memory]| ComputeShape::new(*vcpus, *memory))
            .collect()
    }
}

fn invalid<T>(reason: impl Into<String>) -> Result<T, ResolveError> {
    Err(ResolveError::InvalidInput(reason.into()))
}

/// Validate raw user input and fill absent fields from `config`.
pub fn validate_input(
    raw: &Value,
    config: &ResolverConfig,
) -> Result<ExperimentInput, ResolveError> {
    let object = match raw {
        Value::Object(object) => object.clone(),
        Value::Null => Map::new(),
        other => return invalid(format!("userInput must be an object, got {other}")),
    };
    if let Some(key) = object.keys().find(|k| !ALLOWED_KEYS.contains(&k.as_str())) {
        return invalid(format!("unknown userInput key `{key}`"));
    }

    let mut normalized = object;
    let defaults = [
        ("version", json!("1")),
        ("molFile", json!(config.default_mol_file)),
        ("modelVersion", json!(config.default_model_version)),
        ("optParams", json!({})),
        ("modelParams", json!(config.default_model_params)),
        ("devicesArns", json!(config.default_devices)),
        (
            "ccResources",
            Value::Array(
                config
                    .default_cc_resources
                    .iter()
                    .map(|s| json!([s.vcpus, s.memory_gib]))
                    .collect(),
            ),
        ),
    ];
    for (key, default) in defaults {
        let entry = normalized.entry(key.to_string()).or_insert(Value::Null);
        if entry.is_null() {
            *entry = default;
        }
    }
    // numbers are accepted for version
    if let Some(Value::Number(n)) = normalized.get("version").cloned() {
        normalized.insert("version".to_string(), Value::String(n.to_string()));
    }

    let input: ExperimentInput = serde_json::from_value(Value::Object(normalized))
        .map_err(|err| ResolveError::InvalidInput(err.to_string()))?;

    if !input.mol_file.starts_with("s3://") || input.mol_file.len() <= "s3://".len() {
        return invalid(format!("molFile `{}` must be an s3:// URI", input.mol_file));
    }
    if input.model_version.trim().is_empty() {
        return invalid("modelVersion must not be empty");
    }
    if let Some(name) = &input.experiment_name {
        if name.chars().count() > MAX_EXPERIMENT_NAME {
            return invalid(format!(
                "experimentName exceeds {MAX_EXPERIMENT_NAME} characters"
            ));
        }
    }
    if !input.opt_params.is_object() {
        return invalid("optParams must be an object");
    }
    input.model_params.validate()?;

    if input.devices_arns.is_empty() {
        return invalid("devicesArns must not be empty");
    }
    if let Some(bad) = input
        .devices_arns
        .iter()
        .find(|d| !d.as_str().starts_with(DEVICE_ARN_PREFIX))
    {
        return invalid(format!("device `{bad}` is not a braket device ARN"));
    }

    if input.cc_resources.is_empty() {
        return invalid("ccResources must not be empty");
    }
    for [vcpus, memory] in &input.cc_resources {
        if *vcpus == 0 || *memory == 0 {
            return invalid("ccResources entries must be positive [vcpu, memGiB] pairs");
        }
        if *vcpus > MAX_CC_VCPUS {
            return invalid(format!(
                "ccResources vcpu {vcpus} exceeds {MAX_CC_VCPUS}"
            ));
        }
    }
    Ok(input)
}

/// Default resolver for molecular-unfolding experiments.
#[derive(Clone, Debug, Default)]
pub struct ExperimentResolver {
    config: ResolverConfig,
}

impl ExperimentResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Where the model of an execution is written.
    pub fn model_location(&self, ctx: &ExecutionContext) -> String {
        format!(
            "s3://{}/{}/executions/{}/model/",
            self.config.bucket, self.config.prefix, ctx.execution_id
        )
    }

    fn frozen_input(
        &self,
        phase: &Phase,
        ctx: &ExecutionContext,
    ) -> Result<ExperimentInput, ResolveError> {
        if !ctx.is_validated() {
            return Err(ResolveError::MissingContext {
                phase: phase.as_str(),
                missing: "validated input",
            });
        }
        serde_json::from_value(ctx.user_input().clone())
            .map_err(|err| ResolveError::InvalidInput(err.to_string()))
    }

    fn base_args(ctx: &ExecutionContext, artifact: &ModelArtifact, set: &ParamSet) -> Vec<String> {
        let mut args = vec![
            "--execution-id".to_string(),
            ctx.execution_id.to_string(),
            "--model-location".to_string(),
            artifact.location.clone(),
        ];
        set.push_args(&mut args);
        args
    }
}

fn require_artifact<'a>(
    phase: &Phase,
    artifact: Option<&'a ModelArtifact>,
) -> Result<&'a ModelArtifact, ResolveError> {
    artifact.ok_or(ResolveError::MissingContext {
        phase: phase.as_str(),
        missing: "model artifact",
    })
}

impl ParameterResolver for ExperimentResolver {
    fn resolve(
        &self,
        phase: &Phase,
        ctx: &ExecutionContext,
        artifact: Option<&ModelArtifact>,
    ) -> Result<Resolved, ResolveError> {
        match phase {
            Phase::CheckInput => {
                let input = validate_input(ctx.user_input(), &self.config)?;
                let value = serde_json::to_value(&input)
                    .map_err(|err| ResolveError::InvalidInput(err.to_string()))?;
                Ok(Resolved::Input(value))
            }
            Phase::CreateModel => {
                let input = self.frozen_input(phase, ctx)?;
                let location = self.model_location(ctx);
                let args = vec![
                    "--execution-id".to_string(),
                    ctx.execution_id.to_string(),
                    "--mol-file".to_string(),
                    input.mol_file.clone(),
                    "--model-version".to_string(),
                    input.model_version.clone(),
                    "--model-location".to_string(),
                    location.clone(),
                ];
                let spec = JobSpec::new(
                    ctx.execution_id.clone(),
                    JobKind::CreateModel,
                    self.config.model_shape,
                    args,
                )
                .with_params(json!({
                    "molFile": input.mol_file,
                    "modelVersion": input.model_version,
                }));
                Ok(Resolved::Model { spec, location })
            }
            Phase::ParamsForCc => {
                let input = self.frozen_input(phase, ctx)?;
                let artifact = require_artifact(phase, artifact)?;
                let mut jobs = Vec::new();
                for set in input.model_params.combinations() {
                    for shape in input.cc_shapes() {
                        let mut args = Self::base_args(ctx, artifact, &set);
                        args.push("--resource".to_string());
                        args.push(shape.label());
                        let mut params = json!(set);
                        params["resource"] = json!(shape.label());
                        jobs.push(
                            JobSpec::new(ctx.execution_id.clone(), JobKind::Classical, shape, args)
                                .with_params(params),
                        );
                    }
                }
                Ok(Resolved::Jobs(jobs))
            }
            Phase::QcDeviceList => {
                let input = self.frozen_input(phase, ctx)?;
                let mut seen = HashSet::new();
                let devices = input
                    .devices_arns
                    .into_iter()
                    .filter(|device| seen.insert(device.clone()))
                    .collect();
                Ok(Resolved::Devices(devices))
            }
            Phase::ParamsForQcDevice(device) => {
                let input = self.frozen_input(phase, ctx)?;
                let artifact = require_artifact(phase, artifact)?;
                let jobs = input
                    .model_params
                    .combinations()
                    .into_iter()
                    .map(|set| {
                        let mut args = Self::base_args(ctx, artifact, &set);
                        args.push("--device-arn".to_string());
                        args.push(device.to_string());
                        let mut params = json!(set);
                        params["device"] = json!(device.as_str());
                        JobSpec::new(
                            ctx.execution_id.clone(),
                            JobKind::Quantum,
                            self.config.qc_shape,
                            args,
                        )
                        .with_device(device.clone())
                        .with_params(params)
                    })
                    .collect();
                Ok(Resolved::Jobs(jobs))
            }
        }
    }
}
