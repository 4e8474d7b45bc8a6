#![forbid(unsafe_code)]

//! Resolved process configuration.
//!
//! Every participant (orchestrator, coordinator, worker, CLI) resolves one
//! `Config` at startup and logs the resolved database path. Precedence:
//! explicit overrides > environment > `.klauss.toml` > built-in defaults.

use crate::env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_PATH_ENV: &str = "KLAUSS_DB_PATH";
pub const WORKERS_ENV: &str = "KLAUSS_WORKERS";
pub const AUTO_START_ENV: &str = "KLAUSS_AUTO_START_WORKERS";

pub const CONFIG_FILE_NAME: &str = ".klauss.toml";
pub const STATE_DIRNAME: &str = ".klauss";

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_S: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 5;

/// Template written by `klauss init-config`.
pub const CONFIG_TEMPLATE: &str = r#"# KLAUSS project configuration.
# Remove or adjust sections as needed; every key is optional.

[project]
# name = "my-project"

[database]
# Relative paths resolve against the project root.
# path = ".klauss/my-project_tasks.db"

[safety]
# Reject subtasks whose working_dir is outside the project root.
allow_external_dirs = false

[workers]
default_count = 4
idle_timeout_seconds = 300
heartbeat_interval_seconds = 5

[coordination]
# Point several projects at one queue by enabling a shared database.
enabled = false
# shared_db = "/path/to/shared_tasks.db"
"#;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Parse { path, message } => {
                write!(f, "invalid config {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    project: FileProject,
    #[serde(default)]
    database: FileDatabase,
    #[serde(default)]
    safety: FileSafety,
    #[serde(default)]
    workers: FileWorkers,
    #[serde(default)]
    coordination: FileCoordination,
}

#[derive(Debug, Default, Deserialize)]
struct FileProject {
    name: Option<String>,
    root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileDatabase {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSafety {
    allow_external_dirs: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct FileWorkers {
    default_count: Option<usize>,
    idle_timeout_seconds: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileCoordination {
    enabled: Option<bool>,
    shared_db: Option<PathBuf>,
}

/// Environment values captured once so resolution stays testable without
/// mutating process state.
#[derive(Debug, Default, Clone)]
pub struct EnvSnapshot {
    pub db_path: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub auto_start_workers: Option<bool>,
}

impl EnvSnapshot {
    pub fn from_process_env() -> Self {
        Self {
            db_path: env::var(DB_PATH_ENV).map(PathBuf::from),
            worker_count: env::parse(WORKERS_ENV),
            auto_start_workers: env::flag(AUTO_START_ENV),
        }
    }
}

/// Explicit per-process overrides (CLI arguments). Highest precedence.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub idle_timeout_s: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub project_name: String,
    pub project_root: PathBuf,
    pub db_path: PathBuf,
    pub allow_external_dirs: bool,
    pub worker_count: usize,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub auto_start_workers: Option<bool>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir()?;
        Self::load_from(ConfigOverrides::default(), &cwd)
    }

    pub fn load_with(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir()?;
        Self::load_from(overrides, &cwd)
    }

    pub fn load_from(overrides: ConfigOverrides, start: &Path) -> Result<Self, ConfigError> {
        let root = find_project_root(start);
        let file = read_file_config(&root.join(CONFIG_FILE_NAME))?;
        Ok(Self::resolve(
            overrides,
            EnvSnapshot::from_process_env(),
            file,
            root,
        ))
    }

    fn resolve(
        overrides: ConfigOverrides,
        env: EnvSnapshot,
        file: FileConfig,
        discovered_root: PathBuf,
    ) -> Self {
        let project_root = file
            .project
            .root
            .map(|p| absolutize(&discovered_root, &p))
            .unwrap_or(discovered_root);

        let project_name = file
            .project
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_project_name(&project_root));

        let shared_db = if file.coordination.enabled.unwrap_or(false) {
            file.coordination.shared_db
        } else {
            None
        };

        let db_path = overrides
            .db_path
            .or(env.db_path)
            .or(shared_db)
            .or(file.database.path)
            .map(|p| absolutize(&project_root, &p))
            .unwrap_or_else(|| {
                project_root
                    .join(STATE_DIRNAME)
                    .join(format!("{project_name}_tasks.db"))
            });

        let worker_count = overrides
            .worker_count
            .or(env.worker_count)
            .or(file.workers.default_count)
            .unwrap_or(DEFAULT_WORKER_COUNT)
            .max(1);

        let idle_timeout_s = overrides
            .idle_timeout_s
            .or(file.workers.idle_timeout_seconds)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_S);

        let heartbeat_s = file
            .workers
            .heartbeat_interval_seconds
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_S)
            .max(1);

        Self {
            project_name,
            project_root,
            db_path,
            allow_external_dirs: file.safety.allow_external_dirs.unwrap_or(false),
            worker_count,
            idle_timeout: Duration::from_secs(idle_timeout_s),
            heartbeat_interval: Duration::from_secs(heartbeat_s),
            auto_start_workers: env.auto_start_workers,
        }
    }

    /// Directory holding the store file; logs and the coordinator pid file
    /// live next to it.
    pub fn state_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.project_root.join(STATE_DIRNAME))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir().join("coordinator.pid")
    }

    /// Tasks return to `pending` once their worker's heartbeat is older
    /// than this.
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * 3
    }

    pub fn is_within_project(&self, path: &Path) -> bool {
        let root = normalize_path(&self.project_root);
        normalize_path(&absolutize(&self.project_root, path)).starts_with(root)
    }

    /// Boundary check for subtask working directories. `Ok(())` means the
    /// path may be used; external paths pass only when allowed by config.
    pub fn check_working_dir(&self, working_dir: &Path) -> Result<(), PathBuf> {
        if self.allow_external_dirs || self.is_within_project(working_dir) {
            Ok(())
        } else {
            Err(self.project_root.clone())
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(err) => return Err(err.into()),
    };
    toml::from_str(&text).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Nearest ancestor containing `.git`, else the start directory itself.
/// Keeps every participant agreeing on one store even when launched from a
/// subdirectory.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return current;
        }
        if !current.pop() {
            return start.to_path_buf();
        }
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Collapses `.` and `..` components lexically. Boundary checks run before
/// the directory exists on disk, so `std::fs::canonicalize` is not an
/// option; without this, a `working_dir` like `<root>/../../etc` would pass
/// a plain `starts_with` prefix test while resolving outside the project.
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;

    #[derive(Clone, Copy)]
    enum Tail {
        Normal,
        Anchor,
        Empty,
    }

    fn tail_of(path: &Path) -> Tail {
        match path.components().next_back() {
            Some(Component::Normal(_)) => Tail::Normal,
            Some(Component::RootDir | Component::Prefix(_)) => Tail::Anchor,
            _ => Tail::Empty,
        }
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match tail_of(&out) {
                Tail::Normal => {
                    out.pop();
                }
                // `/..` is `/`; a leading prefix behaves the same way.
                Tail::Anchor => {}
                // Relative paths keep their leading `..`s so they can never
                // satisfy a prefix check against an absolute root.
                Tail::Empty => out.push(Component::ParentDir.as_os_str()),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn default_project_name(root: &Path) -> String {
    let raw = root
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("project");
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("{prefix}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn project_root_prefers_git_ancestor() {
        let root = temp_dir("kl_config_root");
        std::fs::create_dir_all(root.join(".git")).expect("fake .git");
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).expect("nested");
        assert_eq!(find_project_root(&nested), root);
    }

    #[test]
    fn defaults_derive_db_path_from_project_name() {
        let root = temp_dir("kl_config_defaults");
        let cfg = Config::resolve(
            ConfigOverrides::default(),
            EnvSnapshot::default(),
            FileConfig::default(),
            root.clone(),
        );
        assert!(cfg.db_path.starts_with(root.join(STATE_DIRNAME)));
        assert_eq!(cfg.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(cfg.stale_threshold(), Duration::from_secs(15));
    }

    #[test]
    fn overrides_beat_env_beat_file() {
        let root = temp_dir("kl_config_precedence");
        let file: FileConfig = toml::from_str(
            r#"
            [database]
            path = "from_file.db"
            [workers]
            default_count = 2
            "#,
        )
        .expect("parse file config");
        let env = EnvSnapshot {
            db_path: Some(PathBuf::from("/tmp/from_env.db")),
            worker_count: Some(8),
            auto_start_workers: None,
        };
        let cfg = Config::resolve(
            ConfigOverrides {
                db_path: Some(PathBuf::from("/tmp/from_args.db")),
                worker_count: None,
                idle_timeout_s: None,
            },
            env,
            file,
            root,
        );
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/from_args.db"));
        assert_eq!(cfg.worker_count, 8);
    }

    #[test]
    fn shared_db_applies_only_when_coordination_enabled() {
        let root = temp_dir("kl_config_shared");
        let enabled: FileConfig = toml::from_str(
            r#"
            [coordination]
            enabled = true
            shared_db = "/tmp/shared_tasks.db"
            "#,
        )
        .expect("parse");
        let cfg = Config::resolve(
            ConfigOverrides::default(),
            EnvSnapshot::default(),
            enabled,
            root.clone(),
        );
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/shared_tasks.db"));

        let disabled: FileConfig = toml::from_str(
            r#"
            [coordination]
            shared_db = "/tmp/shared_tasks.db"
            "#,
        )
        .expect("parse");
        let cfg = Config::resolve(
            ConfigOverrides::default(),
            EnvSnapshot::default(),
            disabled,
            root,
        );
        assert_ne!(cfg.db_path, PathBuf::from("/tmp/shared_tasks.db"));
    }

    #[test]
    fn boundary_check_scopes_to_project_root() {
        let root = temp_dir("kl_config_boundary");
        let cfg = Config::resolve(
            ConfigOverrides::default(),
            EnvSnapshot::default(),
            FileConfig::default(),
            root.clone(),
        );
        assert!(cfg.check_working_dir(&root.join("src")).is_ok());
        assert!(cfg.check_working_dir(Path::new("relative/subdir")).is_ok());
        assert!(cfg.check_working_dir(Path::new("/somewhere/else")).is_err());

        // `..` components must not escape lexically: a relative walk-out,
        // an absolute path that re-enters the root prefix before backing
        // out, and a root-relative escape are all outside the project.
        assert!(cfg.check_working_dir(Path::new("../../etc")).is_err());
        assert!(
            cfg.check_working_dir(&root.join("src").join("..").join("..").join("etc"))
                .is_err()
        );
        assert!(cfg.check_working_dir(&root.join("..")).is_err());
        // Interior `..` that stays inside the root is still fine.
        assert!(
            cfg.check_working_dir(&root.join("src").join("..").join("lib"))
                .is_ok()
        );
        assert!(cfg.check_working_dir(Path::new("src/../lib")).is_ok());

        let mut permissive = cfg;
        permissive.allow_external_dirs = true;
        assert!(
            permissive
                .check_working_dir(Path::new("/somewhere/else"))
                .is_ok()
        );
    }

    #[test]
    fn config_template_parses() {
        let parsed: FileConfig = toml::from_str(CONFIG_TEMPLATE).expect("template must parse");
        assert_eq!(parsed.workers.default_count, Some(4));
        assert_eq!(parsed.safety.allow_external_dirs, Some(false));
    }
}
