//! Typed stage environment and command construction.
//!
//! Everything a stage process receives is derived here from typed inputs,
//! so the full contract can be inspected and tested without spawning.

use crate::config::RuntimeConfig;
use crate::core::{Device, ExecutionMode, StageDefinition};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Environment contract between the orchestrator and a stage process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEnvironment {
    /// Job id.
    pub job_id: String,
    /// Stage name.
    pub stage: String,
    /// Job directory, bind-mounted in container mode.
    pub job_dir: PathBuf,
    /// Where the stage writes its artifacts.
    pub output_dir: PathBuf,
    /// Where the stage writes its own logs.
    pub log_root: PathBuf,
    /// Config/env file for the stage.
    pub env_file: PathBuf,
    /// Media the job processes.
    pub source_media: String,
    /// Device for this attempt.
    pub device: Device,
    /// Execution mode for this attempt.
    pub mode: ExecutionMode,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Job-level overrides, merged last.
    pub overrides: BTreeMap<String, String>,
}

impl StageEnvironment {
    /// The variables exported to the stage.
    #[must_use]
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let path = |p: &Path| p.display().to_string();

        env.insert("MEDIAFLOW_JOB_ID".into(), self.job_id.clone());
        env.insert("MEDIAFLOW_STAGE".into(), self.stage.clone());
        env.insert("MEDIAFLOW_OUTPUT_DIR".into(), path(&self.output_dir));
        env.insert("MEDIAFLOW_LOG_ROOT".into(), path(&self.log_root));
        env.insert("MEDIAFLOW_ENV_FILE".into(), path(&self.env_file));
        env.insert("MEDIAFLOW_DEVICE".into(), self.device.to_string());
        env.insert("MEDIAFLOW_EXECUTION_MODE".into(), self.mode.to_string());
        env.insert("MEDIAFLOW_ATTEMPT".into(), self.attempt.to_string());
        if self.device == Device::Cpu {
            // Hide GPUs so frameworks cannot pick one up on their own.
            env.insert("CUDA_VISIBLE_DEVICES".into(), String::new());
        }

        for (k, v) in &self.overrides {
            env.insert(k.clone(), v.clone());
        }
        env
    }

    /// Expands `{source_media}`, `{job_id}` and `{output_dir}` in a template.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{source_media}", &self.source_media)
            .replace("{job_id}", &self.job_id)
            .replace("{output_dir}", &self.output_dir.display().to_string())
    }

    /// Arguments of the stage invocation contract, without the program.
    #[must_use]
    pub fn stage_args(&self, stage: &StageDefinition) -> Vec<String> {
        let mut args = vec![
            "--env-file".to_string(),
            self.env_file.display().to_string(),
            "--output-dir".to_string(),
            self.output_dir.display().to_string(),
            "--log-root".to_string(),
            self.log_root.display().to_string(),
        ];
        if stage.is_accelerated() {
            args.push("--device".to_string());
            args.push(self.device.to_string());
        }
        args.extend(stage.args.iter().map(|a| self.render(a)));
        args
    }
}

/// A fully resolved process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Variables added to the spawned process environment.
    pub env: BTreeMap<String, String>,
    /// Name given to the container in container mode, used to stop it.
    pub container_name: Option<String>,
}

impl CommandSpec {
    /// Builds the command for a stage attempt in the environment's mode.
    #[must_use]
    pub fn for_stage(
        stage: &StageDefinition,
        env: &StageEnvironment,
        runtime: &RuntimeConfig,
    ) -> Self {
        match env.mode {
            ExecutionMode::Native => Self::native(stage, env, runtime),
            ExecutionMode::Container => Self::container(stage, env, runtime),
        }
    }

    fn native(stage: &StageDefinition, env: &StageEnvironment, runtime: &RuntimeConfig) -> Self {
        let program = match &runtime.stage_bin_dir {
            Some(dir) if Path::new(&stage.program).is_relative() => {
                dir.join(&stage.program).display().to_string()
            }
            _ => stage.program.clone(),
        };
        Self {
            program,
            args: env.stage_args(stage),
            env: env.to_env(),
            container_name: None,
        }
    }

    fn container(stage: &StageDefinition, env: &StageEnvironment, runtime: &RuntimeConfig) -> Self {
        let name = container_name(env);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.clone(),
        ];

        let mut mounts: Vec<PathBuf> = vec![env.job_dir.clone()];
        for path in [env.env_file.as_path(), Path::new(&env.source_media)] {
            if path.is_absolute() && !path.starts_with(&env.job_dir) {
                if let Some(parent) = path.parent() {
                    if !mounts.iter().any(|m| parent.starts_with(m)) {
                        mounts.push(parent.to_path_buf());
                    }
                }
            }
        }
        for mount in &mounts {
            args.push("-v".to_string());
            args.push(format!("{0}:{0}", mount.display()));
        }

        if env.device == Device::Cuda {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        for (k, v) in env.to_env() {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }

        args.push(runtime.container_image.clone());
        args.push(stage.program.clone());
        args.extend(env.stage_args(stage));

        Self {
            program: runtime.container_runtime.clone(),
            args,
            env: BTreeMap::new(),
            container_name: Some(name),
        }
    }

    /// The command that stops this attempt's container, if it has one.
    #[must_use]
    pub fn stop_command(&self) -> Option<Self> {
        let name = self.container_name.as_ref()?;
        Some(Self {
            program: self.program.clone(),
            args: vec!["kill".to_string(), name.clone()],
            env: BTreeMap::new(),
            container_name: None,
        })
    }
}

/// Unique container name for one attempt. Characters container runtimes
/// reject are replaced with `-`.
fn container_name(env: &StageEnvironment) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let raw = format!("mediaflow-{}-{}-{}-{}", env.job_id, env.stage, env.attempt, &suffix[..8]);
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .collect()
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(mode: ExecutionMode, device: Device) -> StageEnvironment {
        StageEnvironment {
            job_id: "job-7".into(),
            stage: "asr".into(),
            job_dir: PathBuf::from("/jobs/job-7"),
            output_dir: PathBuf::from("/jobs/job-7/output"),
            log_root: PathBuf::from("/jobs/job-7/logs"),
            env_file: PathBuf::from("/jobs/job-7/job.env"),
            source_media: "/media/in.mkv".into(),
            device,
            mode,
            attempt: 2,
            overrides: BTreeMap::new(),
        }
    }

    #[test]
    fn test_to_env_documents_the_contract() {
        let vars = env(ExecutionMode::Native, Device::Cuda).to_env();
        let keys: Vec<&str> = vars.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "MEDIAFLOW_ATTEMPT",
                "MEDIAFLOW_DEVICE",
                "MEDIAFLOW_ENV_FILE",
                "MEDIAFLOW_EXECUTION_MODE",
                "MEDIAFLOW_JOB_ID",
                "MEDIAFLOW_LOG_ROOT",
                "MEDIAFLOW_OUTPUT_DIR",
                "MEDIAFLOW_STAGE",
            ]
        );
        assert_eq!(vars["MEDIAFLOW_ATTEMPT"], "2");
        assert_eq!(vars["MEDIAFLOW_DEVICE"], "cuda");
    }

    #[test]
    fn test_cpu_hides_gpus_and_overrides_win() {
        let mut e = env(ExecutionMode::Native, Device::Cpu);
        e.overrides.insert("MEDIAFLOW_STAGE".into(), "custom".into());
        e.overrides.insert("HF_HOME".into(), "/cache".into());
        let vars = e.to_env();

        assert_eq!(vars["CUDA_VISIBLE_DEVICES"], "");
        assert_eq!(vars["MEDIAFLOW_STAGE"], "custom");
        assert_eq!(vars["HF_HOME"], "/cache");
    }

    #[test]
    fn test_native_command() {
        let stage = StageDefinition::new("asr", "mediaflow-asr")
            .accelerated()
            .with_args(["{source_media}", "--job={job_id}"]);
        let runtime = RuntimeConfig {
            stage_bin_dir: Some(PathBuf::from("/opt/stages")),
            ..RuntimeConfig::default()
        };
        let cmd = CommandSpec::for_stage(&stage, &env(ExecutionMode::Native, Device::Cuda), &runtime);

        assert_eq!(cmd.program, "/opt/stages/mediaflow-asr");
        assert_eq!(
            cmd.args,
            vec![
                "--env-file",
                "/jobs/job-7/job.env",
                "--output-dir",
                "/jobs/job-7/output",
                "--log-root",
                "/jobs/job-7/logs",
                "--device",
                "cuda",
                "/media/in.mkv",
                "--job=job-7",
            ]
        );
        assert_eq!(cmd.env["MEDIAFLOW_STAGE"], "asr");
    }

    #[test]
    fn test_cpu_only_stage_gets_no_device_flag() {
        let stage = StageDefinition::new("mux", "mediaflow-mux");
        let args = env(ExecutionMode::Native, Device::Cpu).stage_args(&stage);
        assert!(!args.contains(&"--device".to_string()));
    }

    #[test]
    fn test_container_command() {
        let stage = StageDefinition::new("asr", "mediaflow-asr").accelerated();
        let cmd = CommandSpec::for_stage(
            &stage,
            &env(ExecutionMode::Container, Device::Cuda),
            &RuntimeConfig::default(),
        );

        assert_eq!(cmd.program, "docker");
        assert!(cmd.env.is_empty());
        let name = cmd.container_name.clone().unwrap();
        assert!(name.starts_with("mediaflow-job-7-asr-2-"));
        assert_eq!(cmd.args[..4].to_vec(), vec!["run", "--rm", "--name", name.as_str()]);
        let line = cmd.to_string();
        assert!(line.contains(" -v /jobs/job-7:/jobs/job-7 -v /media:/media --gpus all"));
        assert!(line.contains("-e MEDIAFLOW_EXECUTION_MODE=container"));
        assert!(line.contains("mediaflow/stages:latest mediaflow-asr --env-file /jobs/job-7/job.env"));
    }

    #[test]
    fn test_container_cpu_has_no_gpus() {
        let stage = StageDefinition::new("asr", "mediaflow-asr").accelerated();
        let cmd = CommandSpec::for_stage(
            &stage,
            &env(ExecutionMode::Container, Device::Cpu),
            &RuntimeConfig::default(),
        );
        assert!(!cmd.args.contains(&"--gpus".to_string()));
        assert!(cmd.args.contains(&"CUDA_VISIBLE_DEVICES=".to_string()));
    }

    #[test]
    fn test_container_attempts_get_distinct_stoppable_names() {
        let stage = StageDefinition::new("asr", "mediaflow-asr");
        let mut e = env(ExecutionMode::Container, Device::Cpu);
        e.job_id = "job 7/x".into();
        let first = CommandSpec::for_stage(&stage, &e, &RuntimeConfig::default());
        let second = CommandSpec::for_stage(&stage, &e, &RuntimeConfig::default());

        let name = first.container_name.clone().unwrap();
        assert!(name.starts_with("mediaflow-job-7-x-asr-2-"));
        assert_ne!(first.container_name, second.container_name);

        let stop = first.stop_command().unwrap();
        assert_eq!(stop.to_string(), format!("docker kill {name}"));
    }

    #[test]
    fn test_native_command_has_no_stop_command() {
        let stage = StageDefinition::new("mux", "mediaflow-mux");
        let cmd = CommandSpec::for_stage(&stage, &env(ExecutionMode::Native, Device::Cpu), &RuntimeConfig::default());
        assert_eq!(cmd.container_name, None);
        assert_eq!(cmd.stop_command(), None);
    }
}
