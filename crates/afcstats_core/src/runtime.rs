use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `afcstats db migrate` to apply pending schema migrations.";

pub const STATE_DIR_NAME: &str = ".afcstats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})\npolicy={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            MIGRATIONS_POLICY_MESSAGE
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `afcstats init` before sync commands"
        ));
    }
    if !config_exists {
        warnings.push("config.toml is missing; built-in defaults are in effect".to_string());
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized.\nMissing required path: {STATE_DIR_NAME}/\nRun: afcstats init --project-root {}",
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("AFCSTATS_DATA_DIR") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("AFCSTATS_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join("afc_statistics.db"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let db_path = normalize_for_display(&paths.db_path);
    format!(
        "# afcstats runtime configuration (materialized by `afcstats init`)\n# Database: {db_path}\n# {MIGRATIONS_POLICY_MESSAGE}\n\n[wiki]\n# api_url = \"https://en.wikipedia.org/w/api.php\"\n# user_agent = \"afcstats/0.2\"\n# domain = \"en.wikipedia.org\"\n\n[afc]\npage = \"Template:AFC statistics\"\npending_category = \"Pending AfC submissions\"\nignore_list = []\n# shutoff_page = \"User:ExampleBot/Shutoff/AFC statistics\"\ncopyvio_template = \"AfC suspected copyvio\"\nmax_replag_secs = 600\nstale_after_hours = 48\nstale_batch = 10\nretention_hours = 36\nhistory_limit = 50\nretry_delay_ms = 5000\n# chart_row_limit = 200\nsync_interval_secs = 240\nsave_interval_secs = 3600\n\n[afc.templates]\nheader = \"AFC statistics/header\"\nrow = \"#invoke:AfC|row\"\nfooter = \"AFC statistics/footer\"\nmore = \"AFC statistics/more\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup_env("AFCSTATS_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    (
        detect_project_root_heuristic(&context.cwd),
        ValueSource::Heuristic,
    )
}

fn detect_project_root_heuristic(cwd: &Path) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in cwd.ancestors() {
        if !seen.insert(normalize_for_display(candidate)) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, STATE_DIR_NAME, ValueSource,
        ensure_runtime_ready, init_layout, inspect_runtime, resolve_paths_with_lookup,
    };
    use crate::config::load_config;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };
        let env = HashMap::from([(
            "AFCSTATS_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.state_dir, from_flag.join(STATE_DIR_NAME));
    }

    #[test]
    fn resolve_paths_finds_initialized_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("create state dir");
        fs::create_dir_all(&nested).expect("create nested");

        let context = ResolutionContext { cwd: nested };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn data_dir_env_override_moves_database() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([("AFCSTATS_DATA_DIR".to_string(), "var".to_string())]);
        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve");
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.db_path, root.join("var").join("afc_statistics.db"));
    }

    #[test]
    fn init_layout_creates_dirs_and_loadable_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(report.created_dirs.len(), 2);
        assert!(report.wrote_config);
        assert!(paths.state_dir.exists());
        assert!(paths.data_dir.exists());

        let config = load_config(&paths.config_path).expect("materialized config parses");
        assert_eq!(config.afc.retention_hours, 36);

        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
    }

    #[test]
    fn readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.warnings.is_empty());
        let err = ensure_runtime_ready(&paths, &status).expect_err("must fail");
        assert!(
            err.to_string()
                .contains("Runtime layout is not initialized")
        );
    }
}
