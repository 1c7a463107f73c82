use crate::error::{Result, StagehandError};
use crate::logs::DEFAULT_MAX_LOG_SIZE;
use crate::process::{CommandSpec, StageSpec, Timings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One stage as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name (unique identifier)
    pub name: String,

    /// Program to run directly
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Script to run through the top-level `interpreter`
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment overrides
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Supervisor timing and log sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Pause between launching consecutive stages (in seconds)
    #[serde(default = "default_stage_delay")]
    pub stage_delay_secs: u64,

    /// Liveness poll interval (in milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Wait after a graceful termination request before force killing (in seconds)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Bounded wait for log readers during shutdown (in milliseconds)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// File every log record is appended to
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Echo records to the console as well
    #[serde(default = "default_console")]
    pub console: bool,

    /// Log file size that triggers rotation (in bytes)
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
}

// Default value functions for serde
fn default_stage_delay() -> u64 {
    2
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_grace_period() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    1000
}

fn default_log_file() -> PathBuf {
    PathBuf::from("stagehand.log")
}

fn default_console() -> bool {
    true
}

fn default_max_log_size() -> u64 {
    DEFAULT_MAX_LOG_SIZE
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stage_delay_secs: default_stage_delay(),
            poll_interval_ms: default_poll_interval(),
            grace_period_secs: default_grace_period(),
            drain_timeout_ms: default_drain_timeout(),
            log_file: default_log_file(),
            console: default_console(),
            max_log_size: default_max_log_size(),
        }
    }
}

impl SupervisorSettings {
    pub fn timings(&self) -> Timings {
        Timings {
            stage_delay: Duration::from_secs(self.stage_delay_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_period: Duration::from_secs(self.grace_period_secs),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

/// Whole configuration file: interpreter, settings and ordered stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagehandConfig {
    /// Interpreter used for stages that set `script`
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Stages in launch order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl StagehandConfig {
    /// Load and validate a configuration file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StagehandError::Config(format!("Failed to read config file: {}", e)))?;

        // Determine format based on file extension
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(StagehandError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    pub fn parse_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| StagehandError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    pub fn parse_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| StagehandError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(StagehandError::ConfigValidation(
                "at least one stage is required".to_string(),
            ));
        }

        if self.supervisor.poll_interval_ms == 0 {
            return Err(StagehandError::ConfigValidation(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(StagehandError::MissingConfigField("name".to_string()));
            }

            if !seen.insert(stage.name.as_str()) {
                return Err(StagehandError::ConfigValidation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }

            match (&stage.executable, &stage.script) {
                (None, None) => {
                    return Err(StagehandError::MissingConfigField(format!(
                        "executable or script (stage {})",
                        stage.name
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(StagehandError::ConfigValidation(format!(
                        "stage {} sets both executable and script",
                        stage.name
                    )))
                }
                (None, Some(_)) if self.interpreter.is_none() => {
                    return Err(StagehandError::MissingConfigField(format!(
                        "interpreter (required by script stage {})",
                        stage.name
                    )))
                }
                _ => {}
            }

            if let Some(ref cwd) = stage.cwd {
                if !cwd.is_dir() {
                    return Err(StagehandError::ConfigValidation(format!(
                        "Working directory of {} is not a directory: {}",
                        stage.name,
                        cwd.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve every stage to the command that will be launched, in order
    pub fn stage_specs(&self) -> Result<Vec<StageSpec>> {
        self.stages
            .iter()
            .map(|stage| self.resolve(stage))
            .collect()
    }

    fn resolve(&self, stage: &StageConfig) -> Result<StageSpec> {
        let mut command = match (&stage.executable, &stage.script) {
            (Some(executable), None) => CommandSpec::new(executable),
            (None, Some(script)) => {
                let interpreter = self.interpreter.as_ref().ok_or_else(|| {
                    StagehandError::MissingConfigField(format!(
                        "interpreter (required by script stage {})",
                        stage.name
                    ))
                })?;
                CommandSpec::new(interpreter).arg(script.to_string_lossy())
            }
            _ => {
                return Err(StagehandError::ConfigValidation(format!(
                    "stage {} must set exactly one of executable or script",
                    stage.name
                )))
            }
        };

        command = command.args(stage.args.iter().cloned());
        command.env = stage.env.clone();
        command.cwd = stage.cwd.clone();

        Ok(StageSpec::new(stage.name.clone(), command))
    }

    /// Expand `$VAR` and `${VAR}` in paths, arguments and env values
    fn expand_env_vars(&mut self) {
        if let Some(ref interpreter) = self.interpreter {
            self.interpreter = Some(expand_env_in_path(interpreter));
        }
        self.supervisor.log_file = expand_env_in_path(&self.supervisor.log_file);

        for stage in &mut self.stages {
            stage.executable = stage.executable.as_deref().map(expand_env_in_path);
            stage.script = stage.script.as_deref().map(expand_env_in_path);
            stage.cwd = stage.cwd.as_deref().map(expand_env_in_path);
            stage.args = stage.args.iter().map(|a| expand_env_in_string(a)).collect();
            for value in stage.env.values_mut() {
                *value = expand_env_in_string(value);
            }
        }
    }
}

/// Expand environment variables in a string; unknown variables are left as written
fn expand_env_in_string(s: &str) -> String {
    expand_with(s, |key| std::env::var(key).ok())
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

fn expand_with<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(dollar) = rest.find('$') {
        result.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        let (key, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .char_indices()
                .find(|&(i, c)| !(c == '_' || c.is_ascii_alphanumeric() && !(i == 0 && c.is_ascii_digit())))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (key.is_empty(), lookup(key)) {
            (false, Some(value)) => result.push_str(&value),
            _ => result.push_str(&rest[dollar..dollar + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "HOME" => Some("/home/op".to_string()),
            "APP_DIR" => Some("/opt/app".to_string()),
            _ => None,
        }
    }

    fn stage(name: &str) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            executable: Some(PathBuf::from("/bin/echo")),
            script: None,
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    fn config(stages: Vec<StageConfig>) -> StagehandConfig {
        StagehandConfig {
            interpreter: None,
            supervisor: SupervisorSettings::default(),
            stages,
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.stage_delay_secs, 2);
        assert_eq!(settings.poll_interval_ms, 1000);
        assert_eq!(settings.grace_period_secs, 5);
        assert_eq!(settings.drain_timeout_ms, 1000);
        assert_eq!(settings.log_file, PathBuf::from("stagehand.log"));
        assert!(settings.console);
        assert_eq!(settings.timings(), Timings::default());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(config(vec![stage("a"), stage("b")]).validate().is_ok());
    }

    #[test]
    fn test_validate_no_stages() {
        let result = config(vec![]).validate();
        assert!(matches!(result, Err(StagehandError::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let result = config(vec![stage("a"), stage("a")]).validate();
        match result {
            Err(StagehandError::ConfigValidation(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("Expected ConfigValidation, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_empty_name() {
        let result = config(vec![stage("  ")]).validate();
        assert!(matches!(result, Err(StagehandError::MissingConfigField(_))));
    }

    #[test]
    fn test_validate_needs_exactly_one_program() {
        let mut neither = stage("a");
        neither.executable = None;
        assert!(matches!(
            config(vec![neither]).validate(),
            Err(StagehandError::MissingConfigField(_))
        ));

        let mut both = stage("a");
        both.script = Some(PathBuf::from("a.py"));
        assert!(matches!(
            config(vec![both]).validate(),
            Err(StagehandError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_validate_script_requires_interpreter() {
        let mut scripted = stage("a");
        scripted.executable = None;
        scripted.script = Some(PathBuf::from("producer.py"));

        let mut cfg = config(vec![scripted]);
        assert!(matches!(
            cfg.validate(),
            Err(StagehandError::MissingConfigField(ref f)) if f.contains("interpreter")
        ));

        cfg.interpreter = Some(PathBuf::from("/usr/bin/python3"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut cfg = config(vec![stage("a")]);
        cfg.supervisor.poll_interval_ms = 0;
        assert!(matches!(cfg.validate(), Err(StagehandError::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_cwd_must_be_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        let mut with_file_cwd = stage("a");
        with_file_cwd.cwd = Some(file);
        assert!(config(vec![with_file_cwd]).validate().is_err());

        let mut with_dir_cwd = stage("a");
        with_dir_cwd.cwd = Some(temp_dir.path().to_path_buf());
        assert!(config(vec![with_dir_cwd]).validate().is_ok());
    }

    #[test]
    fn test_stage_specs_resolve_script_through_interpreter() {
        let mut scripted = stage("Producer");
        scripted.executable = None;
        scripted.script = Some(PathBuf::from("sensor_producer.py"));
        scripted.args = vec!["--fast".to_string()];
        scripted.env.insert("KAFKA".to_string(), "localhost:9092".to_string());

        let mut cfg = config(vec![scripted, stage("Echo")]);
        cfg.interpreter = Some(PathBuf::from("/usr/bin/python3"));

        let specs = cfg.stage_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "Producer");
        assert_eq!(specs[0].command.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(specs[0].command.args, vec!["sensor_producer.py", "--fast"]);
        assert_eq!(
            specs[0].command.env.get("KAFKA"),
            Some(&"localhost:9092".to_string())
        );
        assert_eq!(specs[1].command.program, PathBuf::from("/bin/echo"));
    }

    #[test]
    fn test_expand_plain_and_braced() {
        assert_eq!(expand_with("$HOME/bin", lookup), "/home/op/bin");
        assert_eq!(expand_with("${APP_DIR}/run.py", lookup), "/opt/app/run.py");
        assert_eq!(expand_with("a${HOME}b$HOME", lookup), "a/home/opb/home/op");
    }

    #[test]
    fn test_expand_does_not_match_prefixes() {
        // $HOMEDIR is its own (unknown) variable, not $HOME + "DIR"
        assert_eq!(expand_with("$HOMEDIR", lookup), "$HOMEDIR");
    }

    #[test]
    fn test_expand_leaves_unknown_and_malformed() {
        assert_eq!(expand_with("$NOPE and ${NOPE}", lookup), "$NOPE and ${NOPE}");
        assert_eq!(expand_with("cost: $5", lookup), "cost: $5");
        assert_eq!(expand_with("${unterminated", lookup), "${unterminated");
        assert_eq!(expand_with("trailing $", lookup), "trailing $");
    }
}
