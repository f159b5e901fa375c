use crate::config::ResolvedStage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Executes one resolved pipeline stage. The core only depends on this
/// seam; how the tool process is assembled is an implementation detail.
#[async_trait]
pub trait StageRunner {
    async fn run(&self, stage: &ResolvedStage) -> Result<()>;
}

/// Runs a stage's tool script inside its conda environment. With a
/// `conda_root` the environment is activated through a generated bash
/// script; without one `conda run` is used directly.
pub struct CondaRunner {
    pub conda_root: Option<String>,
    modules: HashMap<String, String>,
}

fn default_modules() -> HashMap<String, String> {
    [
        ("profile", "./modules/profile/profile_search.py"),
        ("diffusion", "./modules/diffusion/backbone_diffusion.py"),
        ("diffusion_report", "./modules/diffusion/diffusion_report.py"),
        ("design", "./modules/design/sequence_design.py"),
        ("fold", "./modules/fold/structure_prediction.py"),
        ("fold_report", "./modules/fold/fold_report.py"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Flattens a resolved argument mapping to `--key value` pairs.
pub fn flatten_args(args: &BTreeMap<String, String>) -> Vec<String> {
    args.iter()
        .flat_map(|(key, value)| [format!("--{}", key), value.clone()])
        .collect()
}

impl CondaRunner {
    pub fn new(conda_root: Option<String>, module_overrides: &HashMap<String, String>) -> Self {
        let mut modules = default_modules();
        for (stage, path) in module_overrides {
            modules.insert(stage.clone(), path.clone());
        }
        Self { conda_root, modules }
    }

    fn script_for(&self, stage_name: &str) -> Result<&str> {
        let script = self
            .modules
            .get(stage_name)
            .map(String::as_str)
            .context(format!(
                "No tool script registered for stage `{}`",
                stage_name
            ))?;
        if !Path::new(script).exists() {
            anyhow::bail!(
                "Tool script for stage `{}` not found: {}",
                stage_name,
                script
            );
        }
        Ok(script)
    }

    /// Bash script that sources the conda profile from `conda_root`,
    /// activates the stage environment and runs the tool.
    fn activation_script(
        conda_root: &str,
        env_name: &str,
        script: &str,
        args: &[String],
    ) -> String {
        let quoted_args = args
            .iter()
            .map(|a| shell_words::quote(a).to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let root = shell_words::quote(conda_root).to_string();
        format!(
            "set -euo pipefail\n\
             if [ -f {root}/etc/profile.d/conda.sh ]; then\n\
             source {root}/etc/profile.d/conda.sh\n\
             elif [ -f {root}/bin/activate ]; then\n\
             source {root}/bin/activate\n\
             else\n\
             echo 'conda activation script not found' >&2\n\
             exit 1\n\
             fi\n\
             conda activate {env}\n\
             python {script} {args}\n",
            root = root,
            env = shell_words::quote(env_name),
            script = shell_words::quote(script),
            args = quoted_args,
        )
    }
}

fn echo_stream(stream: impl AsyncRead + Unpin + Send + 'static) {
    // Best-effort live progress; a broken stream never fails the stage.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("{}", line);
        }
    });
}

#[async_trait]
impl StageRunner for CondaRunner {
    async fn run(&self, stage: &ResolvedStage) -> Result<()> {
        let script = self.script_for(stage.name)?;
        let args = flatten_args(&stage.args);
        info!(
            "Starting stage `{}` (env: {}, script: {})",
            stage.name, stage.env_name, script
        );

        let mut command = match &self.conda_root {
            Some(root) => {
                let body = Self::activation_script(root, &stage.env_name, script, &args);
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(body);
                cmd
            }
            None => {
                let mut cmd = Command::new("conda");
                cmd.args(["run", "-n", &stage.env_name, "python", script])
                    .args(&args);
                cmd
            }
        };

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(format!("Failed to spawn stage `{}`", stage.name))?;

        if let Some(stdout) = child.stdout.take() {
            echo_stream(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            echo_stream(stderr);
        }

        let status = child
            .wait()
            .await
            .context(format!("Failed to wait for stage `{}`", stage.name))?;
        if !status.success() {
            error!("Stage `{}` failed with status {}", stage.name, status);
            anyhow::bail!("Stage `{}` exited with status {}", stage.name, status);
        }
        info!("Stage `{}` completed", stage.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_flatten_to_key_value_pairs() {
        let mut args = BTreeMap::new();
        args.insert("chain".to_string(), "A".to_string());
        args.insert("cpu".to_string(), "10".to_string());
        assert_eq!(flatten_args(&args), vec!["--chain", "A", "--cpu", "10"]);
    }

    #[test]
    fn activation_script_quotes_and_activates() {
        let script = CondaRunner::activation_script(
            "/opt/conda",
            "se3",
            "./modules/diffusion/backbone_diffusion.py",
            &["--contigmap.contigs".to_string(), "[A1-394]".to_string()],
        );
        assert!(script.contains("conda activate se3"));
        assert!(script.contains("'[A1-394]'"));
        assert!(script.contains("set -euo pipefail"));
    }

    #[test]
    fn module_overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("diffusion".to_string(), "/custom/diffusion.py".to_string());
        let runner = CondaRunner::new(None, &overrides);
        assert_eq!(runner.modules["diffusion"], "/custom/diffusion.py");
        assert!(runner.modules.contains_key("profile"));
    }

    #[test]
    fn unknown_stage_has_no_script() {
        let runner = CondaRunner::new(None, &HashMap::new());
        assert!(runner.script_for("mystery").is_err());
    }
}
