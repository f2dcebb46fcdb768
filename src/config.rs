use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MAX_UPLOAD_SIZE: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_MAX_METADATA_SIZE: usize = 4 * 1024;
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);
const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 1000;

/// How the physical storage name is chosen for a new upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileNaming {
    /// Physical name equals the upload id.
    #[default]
    Id,
    /// Random UUID, unrelated to the id.
    Random,
}

/// Upload expiration policy.
#[derive(Debug, Clone)]
pub struct ExpirationConfig {
    /// Lifetime of an upload.
    pub max_age: Duration,
    /// How often the background purge runs, if at all.
    pub purge_interval: Option<Duration>,
    /// Recompute the deadline on every metadata save instead of fixing it at creation.
    pub rolling: bool,
}

/// Storage engine settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for data files and metadata sidecars.
    pub directory: PathBuf,
    pub max_upload_size: u64,
    /// Allowed content types; `type/*` and `*/*` wildcards are accepted.
    pub allow_mime: Vec<String>,
    pub max_metadata_size: usize,
    pub max_filename_length: usize,
    pub expiration: Option<ExpirationConfig>,
    /// Lifetime of a write lock, the expected length of one write session.
    pub lock_ttl: Duration,
    /// Ceiling on simultaneously locked uploads.
    pub max_concurrent_uploads: usize,
    pub naming: FileNaming,
    /// Suffix of metadata sidecar files.
    pub meta_suffix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/uploads"),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            allow_mime: vec!["*/*".into()],
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            max_filename_length: 255,
            expiration: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            naming: FileNaming::Id,
            meta_suffix: ".META".into(),
        }
    }
}

impl StorageConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable upload server (tus, chunked REST, multipart)")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploads are stored (overrides UPLOAD_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Maximum upload size in bytes (overrides UPLOAD_STORE_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Upload lifetime in seconds (overrides UPLOAD_STORE_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<u64>,

    /// Extend the lifetime on every write (overrides UPLOAD_STORE_EXPIRATION_ROLLING)
    #[arg(long)]
    pub rolling: bool,

    /// Purge sweep interval in seconds (overrides UPLOAD_STORE_PURGE_INTERVAL_SECS)
    #[arg(long)]
    pub purge_interval_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("UPLOAD_STORE_PORT")?.unwrap_or(3000);
        let env_storage =
            env::var("UPLOAD_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_max_size = env_parse::<u64>("UPLOAD_STORE_MAX_UPLOAD_SIZE")?;
        let env_expiration = env_parse::<u64>("UPLOAD_STORE_EXPIRATION_SECS")?;
        let env_rolling = env_parse::<bool>("UPLOAD_STORE_EXPIRATION_ROLLING")?.unwrap_or(false);
        let env_purge = env_parse::<u64>("UPLOAD_STORE_PURGE_INTERVAL_SECS")?;

        // --- Merge ---
        let mut storage = StorageConfig::new(args.storage_dir.unwrap_or(env_storage));
        if let Some(max) = args.max_upload_size.or(env_max_size) {
            storage.max_upload_size = max;
        }
        storage.expiration = args
            .expiration_secs
            .or(env_expiration)
            .map(|secs| ExpirationConfig {
                max_age: Duration::from_secs(secs),
                purge_interval: args
                    .purge_interval_secs
                    .or(env_purge)
                    .map(Duration::from_secs),
                rolling: args.rolling || env_rolling,
            });

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
