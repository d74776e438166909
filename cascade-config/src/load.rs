//! Layered loading of worker configuration.
//!
//! Layers, each overriding the ones before it:
//!
//! 1. `base.*`, required.
//! 2. `{environment}.*`, optional.
//! 3. `workers/{worker}.*`, required once `CASCADE_WORKER` names a worker. A host running the
//!    main worker of a node next to copy workers of some of its tables keeps one overlay per
//!    process, typically holding `consumer_name` and `role`.
//! 4. `APP_`-prefixed environment variables, nested keys separated by `__`
//!    (`APP_BATCH__LOOP_DELAY_MS`).

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory, relative to the working directory, that holds the configuration files.
const CONFIGURATION_DIR: &str = "configuration";

/// Subdirectory of per-worker overlays.
const WORKERS_DIR: &str = "workers";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Environment variable selecting the per-worker overlay.
const WORKER_ENV_NAME: &str = "CASCADE_WORKER";

const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_SEPARATOR: &str = "__";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("no {layer} configuration file `{stem}` with a yaml, yml or json extension")]
    MissingFile { layer: &'static str, stem: PathBuf },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer<'a> {
    Base,
    Environment(Environment),
    Worker(&'a str),
}

impl Layer<'_> {
    fn name(&self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment(_) => "environment",
            Layer::Worker(_) => "worker",
        }
    }

    fn stem(&self, directory: &Path) -> PathBuf {
        match self {
            Layer::Base => directory.join("base"),
            Layer::Environment(environment) => directory.join(environment.as_str()),
            Layer::Worker(worker) => directory.join(WORKERS_DIR).join(worker),
        }
    }

    fn required(&self) -> bool {
        !matches!(self, Layer::Environment(_))
    }
}

/// Where configuration is read from and which overlays apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    pub directory: PathBuf,
    pub environment: Environment,
    /// Name of the per-worker overlay, `None` for base and environment files only.
    pub worker: Option<String>,
}

impl ConfigSource {
    /// Reads `configuration/` in the working directory, with the environment from
    /// `APP_ENVIRONMENT` and the worker overlay from `CASCADE_WORKER`.
    pub fn from_env() -> Result<Self, LoadConfigError> {
        let directory = std::env::current_dir()
            .map_err(LoadConfigError::CurrentDir)?
            .join(CONFIGURATION_DIR);
        let worker = std::env::var(WORKER_ENV_NAME)
            .ok()
            .filter(|worker| !worker.is_empty());

        Ok(ConfigSource {
            directory,
            environment: Environment::load()?,
            worker,
        })
    }

    fn layers(&self) -> Vec<Layer<'_>> {
        let mut layers = vec![Layer::Base, Layer::Environment(self.environment)];
        if let Some(worker) = &self.worker {
            layers.push(Layer::Worker(worker));
        }

        layers
    }

    /// Returns the files that are read, in override order.
    pub fn files(&self) -> Result<Vec<PathBuf>, LoadConfigError> {
        if !self.directory.is_dir() {
            return Err(LoadConfigError::MissingConfigurationDirectory(
                self.directory.clone(),
            ));
        }

        let mut files = Vec::new();
        for layer in self.layers() {
            let stem = layer.stem(&self.directory);
            match find_file(&stem) {
                Some(path) => files.push(path),
                None if layer.required() => {
                    return Err(LoadConfigError::MissingFile {
                        layer: layer.name(),
                        stem,
                    });
                }
                None => {}
            }
        }

        Ok(files)
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<T, LoadConfigError> {
        let mut builder = config::Config::builder();
        for path in self.files()? {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_PREFIX_SEPARATOR)
                    .separator(ENV_SEPARATOR),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Loads configuration from the working directory, see [`ConfigSource::from_env`].
pub fn load_config<T: DeserializeOwned>() -> Result<T, LoadConfigError> {
    ConfigSource::from_env()?.load()
}

fn find_file(stem: &Path) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| {
            let mut path = stem.as_os_str().to_owned();
            path.push(".");
            path.push(extension);
            PathBuf::from(path)
        })
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::shared::{WorkerConfig, WorkerRole};

    const BASE: &str = "queue_name: orders\n\
                        consumer_name: branch_worker\n\
                        node_location: dbname=branch\n\
                        batch:\n  loop_delay_ms: 500\n";

    fn source(dir: &TempDir, worker: Option<&str>) -> ConfigSource {
        ConfigSource {
            directory: dir.path().to_path_buf(),
            environment: Environment::Dev,
            worker: worker.map(str::to_string),
        }
    }

    fn config_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("base.yaml"), BASE).unwrap();
        dir
    }

    #[test]
    fn test_missing_directory_is_reported() {
        let source = ConfigSource {
            directory: PathBuf::from("/nonexistent/cascade"),
            environment: Environment::Dev,
            worker: None,
        };

        let err = source.load::<WorkerConfig>().unwrap_err();
        assert!(matches!(err, LoadConfigError::MissingConfigurationDirectory(_)));
    }

    #[test]
    fn test_environment_file_is_optional() {
        let dir = config_dir();

        let config: WorkerConfig = source(&dir, None).load().unwrap();
        assert_eq!(config.batch.loop_delay_ms, 500);
        assert_eq!(config.role, WorkerRole::Main);
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = config_dir();
        fs::write(dir.path().join("dev.yml"), "batch:\n  loop_delay_ms: 250\n").unwrap();

        let config: WorkerConfig = source(&dir, None).load().unwrap();
        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.batch.loop_delay_ms, 250);
    }

    #[test]
    fn test_worker_overlay_selects_copy_role() {
        let dir = config_dir();
        fs::write(dir.path().join("dev.yaml"), "batch:\n  loop_delay_ms: 250\n").unwrap();
        fs::create_dir(dir.path().join(WORKERS_DIR)).unwrap();
        fs::write(
            dir.path().join(WORKERS_DIR).join("orders_copy.yaml"),
            "role:\n  kind: copy\n  table: public.orders\nbatch:\n  loop_delay_ms: 50\n",
        )
        .unwrap();

        let source = source(&dir, Some("orders_copy"));
        assert_eq!(source.files().unwrap().len(), 3);

        let config: WorkerConfig = source.load().unwrap();
        assert_eq!(config.consumer_name, "branch_worker");
        assert_eq!(config.batch.loop_delay_ms, 50);
        assert_eq!(
            config.role,
            WorkerRole::Copy {
                table: "public.orders".to_string()
            }
        );
    }

    #[test]
    fn test_named_worker_needs_its_overlay() {
        let dir = config_dir();

        let err = source(&dir, Some("missing")).files().unwrap_err();
        assert!(matches!(err, LoadConfigError::MissingFile { layer: "worker", .. }));
    }
}
