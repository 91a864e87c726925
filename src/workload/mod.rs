//! Turns an agreed `BenchmarkConfig` into a concrete engine invocation.
mod archive;
mod presets;


use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{BenchmarkConfig, DatabaseEndpoint, DatabaseKind, DatabaseTarget};
use crate::error::{AppError, AppResult, WorkloadError};
use crate::supervisor::EngineStep;

const SCRIPT_EXTENSION: &str = "lua";

/// Where the engine script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadSource {
    Preset(String),
    Script(PathBuf),
}

/// Everything needed to spawn one engine sub-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub script: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub source: WorkloadSource,
}

impl Invocation {
    /// `<script> <args..> <step>`
    #[must_use]
    pub fn command_args(&self, step: EngineStep) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len().saturating_add(2));
        args.push(self.script.clone());
        args.extend(self.args.iter().cloned());
        args.push(step.as_str().to_owned());
        args
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadResolver {
    engine_path: PathBuf,
    artifacts_dir: PathBuf,
    report_interval: Duration,
}

impl WorkloadResolver {
    #[must_use]
    pub const fn new(engine_path: PathBuf, artifacts_dir: PathBuf, report_interval: Duration) -> Self {
        Self {
            engine_path,
            artifacts_dir,
            report_interval,
        }
    }

    /// Resolves the script and arguments for `config`.
    ///
    /// # Errors
    ///
    /// Returns `WorkloadError::NotFound` or `WorkloadError::Invalid` for a bad
    /// custom script reference, and `WorkloadError::UnsupportedDatabase` when
    /// no custom script is given and the database kind has no presets.
    pub fn resolve(&self, config: &BenchmarkConfig) -> AppResult<Invocation> {
        let (script, source, script_dir) = match config.custom_script.as_ref() {
            Some(reference) => {
                let path = self.locate_script(reference, &config.workload)?;
                let dir = path.parent().map(Path::to_path_buf);
                (
                    path.display().to_string(),
                    WorkloadSource::Script(path),
                    dir,
                )
            }
            None => {
                let preset = select_preset(&config.database.kind, &config.workload)?;
                (preset.clone(), WorkloadSource::Preset(preset), None)
            }
        };

        let mut args = vec![
            format!("--threads={}", config.threads),
            format!("--tables={}", config.tables),
            format!("--scale={}", config.scale),
            "--force_pk=1".to_owned(),
            format!("--report-interval={}", self.report_interval.as_secs().max(1)),
            format!("--time={}", config.duration.engine_seconds()),
        ];
        args.extend(driver_args(&config.database));

        let mut env = connection_env(&config.database);
        if let Some(dir) = script_dir {
            env.push(("LUA_PATH".to_owned(), format!("{}/?.lua;;", dir.display())));
        }

        Ok(Invocation {
            program: self.engine_path.clone(),
            script,
            args,
            env,
            source,
        })
    }

    fn locate_script(&self, reference: &Path, workload: &str) -> AppResult<PathBuf> {
        let not_found = || {
            AppError::workload(WorkloadError::NotFound {
                reference: reference.display().to_string(),
            })
        };
        let metadata = std::fs::metadata(reference).map_err(|_missing| not_found())?;

        if metadata.is_dir() {
            let scripts = scripts_in(reference)?;
            return pick_script(reference, scripts, workload);
        }
        match extension_of(reference).as_deref() {
            Some(SCRIPT_EXTENSION) => Ok(reference.to_path_buf()),
            Some("zip") => {
                let stem = reference
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .unwrap_or("workload");
                let destination = self.artifacts_dir.join(stem);
                let extracted = archive::extract_flat(reference, &destination)?;
                let scripts = extracted.into_iter().filter(|path| is_script(path)).collect();
                pick_script(reference, scripts, "")
            }
            Some(_) | None => Err(invalid(
                reference,
                "expected a .lua script, a directory, or a .zip archive",
            )),
        }
    }
}

fn select_preset(kind: &DatabaseKind, workload: &str) -> AppResult<String> {
    let presets = presets::presets_for(kind).ok_or_else(|| {
        AppError::workload(WorkloadError::UnsupportedDatabase {
            kind: kind.label().to_owned(),
        })
    })?;
    presets
        .iter()
        .find(|preset| **preset == workload)
        .map(|preset| (*preset).to_owned())
        .ok_or_else(|| {
            AppError::workload(WorkloadError::NotFound {
                reference: workload.to_owned(),
            })
        })
}

fn invalid(reference: &Path, reason: &str) -> AppError {
    AppError::workload(WorkloadError::Invalid {
        reference: reference.display().to_string(),
        reason: reason.to_owned(),
    })
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

fn is_script(path: &Path) -> bool {
    extension_of(path).as_deref() == Some(SCRIPT_EXTENSION)
}

fn scripts_in(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let io_error = |source| {
        AppError::workload(WorkloadError::Io {
            context: "list workload directory",
            path: dir.to_path_buf(),
            source,
        })
    };
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && is_script(&path) {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// A script named after the workload wins; otherwise there must be exactly one.
fn pick_script(reference: &Path, scripts: Vec<PathBuf>, workload: &str) -> AppResult<PathBuf> {
    if !workload.is_empty() {
        let wanted = format!("{}.{}", workload, SCRIPT_EXTENSION);
        if let Some(found) = scripts
            .iter()
            .find(|path| path.file_name().and_then(OsStr::to_str) == Some(wanted.as_str()))
        {
            return Ok(found.clone());
        }
    }
    let mut iter = scripts.into_iter();
    match (iter.next(), iter.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(invalid(reference, "no .lua script found")),
        (Some(_), Some(_)) => Err(invalid(reference, "more than one .lua script found")),
    }
}

fn driver_args(target: &DatabaseTarget) -> Vec<String> {
    let prefix = match &target.kind {
        DatabaseKind::MySql => "mysql",
        DatabaseKind::PostgreSql => "pgsql",
        DatabaseKind::Other(_) => return Vec::new(),
    };
    let mut args = vec![
        format!("--db-driver={}", prefix),
        format!("--{}-db={}", prefix, target.name),
        format!("--{}-user={}", prefix, target.user),
    ];
    if !target.password.is_empty() {
        args.push(format!("--{}-password={}", prefix, target.password));
    }
    match (&target.kind, &target.endpoint) {
        (_, DatabaseEndpoint::Tcp { host, port }) => {
            args.push(format!("--{}-host={}", prefix, host));
            args.push(format!("--{}-port={}", prefix, port));
        }
        (DatabaseKind::MySql, DatabaseEndpoint::UnixSocket { path }) => {
            args.push(format!("--mysql-socket={}", path.display()));
        }
        (DatabaseKind::PostgreSql | DatabaseKind::Other(_), DatabaseEndpoint::UnixSocket { path }) => {
            // libpq takes the socket directory as host and the port from `.s.PGSQL.<port>`.
            let dir = path.parent().unwrap_or(path);
            args.push(format!("--pgsql-host={}", dir.display()));
            if let Some(port) = path
                .file_name()
                .and_then(OsStr::to_str)
                .and_then(|name| name.strip_prefix(".s.PGSQL."))
            {
                args.push(format!("--pgsql-port={}", port));
            }
        }
    }
    args
}

fn connection_env(target: &DatabaseTarget) -> Vec<(String, String)> {
    let mut env = vec![("BENCH_DB_KIND".to_owned(), target.kind.label().to_owned())];
    match &target.endpoint {
        DatabaseEndpoint::Tcp { host, port } => {
            env.push(("BENCH_DB_HOST".to_owned(), host.clone()));
            env.push(("BENCH_DB_PORT".to_owned(), port.to_string()));
        }
        DatabaseEndpoint::UnixSocket { path } => {
            env.push(("BENCH_DB_SOCKET".to_owned(), path.display().to_string()));
        }
    }
    env.push(("BENCH_DB_NAME".to_owned(), target.name.clone()));
    env.push(("BENCH_DB_USER".to_owned(), target.user.clone()));
    env.push(("BENCH_DB_PASSWORD".to_owned(), target.password.clone()));
    env
}
