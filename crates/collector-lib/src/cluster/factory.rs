//! Cluster client construction with credential fallback
//!
//! Credentials are resolved by walking an ordered plan of sources. Each
//! attempt yields an [`AttemptOutcome`], and the first loaded source wins:
//!
//! 1. in-cluster service account (only when preferred in configuration)
//! 2. kubeconfig file (configured path, else `$HOME/.kube/config`)

use crate::config::KubernetesConfig;
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("in-cluster config failed and no kubeconfig file found: {0}")]
    InClusterUnavailable(String),

    #[error("kubeconfig file not found at {}", path.display())]
    KubeconfigNotFound { path: PathBuf },

    #[error("failed to build config from file {}: {reason}", path.display())]
    InvalidKubeconfig { path: PathBuf, reason: String },

    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Where cluster credentials came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    InCluster,
    Kubeconfig(PathBuf),
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::InCluster => write!(f, "in-cluster"),
            CredentialSource::Kubeconfig(path) => write!(f, "kubeconfig:{}", path.display()),
        }
    }
}

/// Result of a single credential attempt
#[derive(Debug, PartialEq, Eq)]
pub enum AttemptOutcome<C> {
    Loaded(C),
    Failed(String),
    /// The source does not exist (no kubeconfig file at the path)
    Missing,
}

/// Loads credentials from each kind of source
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    type Credentials: Send;

    async fn load_in_cluster(&self) -> Result<Self::Credentials, String>;

    async fn load_file(&self, path: &Path) -> Result<Self::Credentials, String>;

    fn exists(&self, path: &Path) -> bool;
}

/// Loader producing `kube::Config`
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeCredentialLoader;

#[async_trait]
impl CredentialLoader for KubeCredentialLoader {
    type Credentials = kube::Config;

    async fn load_in_cluster(&self) -> Result<kube::Config, String> {
        kube::Config::incluster().map_err(|e| e.to_string())
    }

    async fn load_file(&self, path: &Path) -> Result<kube::Config, String> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| e.to_string())?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| e.to_string())
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// `$HOME/.kube/config`, with `/root` standing in for an unknown home
pub fn default_kubeconfig_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".kube")
        .join("config")
}

/// Ordered list of sources to try
pub fn plan(config: &KubernetesConfig) -> Vec<CredentialSource> {
    let mut sources = Vec::with_capacity(2);
    if config.in_cluster {
        sources.push(CredentialSource::InCluster);
    }

    let path = config
        .config_path
        .clone()
        .unwrap_or_else(default_kubeconfig_path);
    sources.push(CredentialSource::Kubeconfig(path));

    sources
}

/// Try a single source
pub async fn attempt<L: CredentialLoader>(
    loader: &L,
    source: &CredentialSource,
) -> AttemptOutcome<L::Credentials> {
    let loaded = match source {
        CredentialSource::InCluster => loader.load_in_cluster().await,
        CredentialSource::Kubeconfig(path) => {
            if !loader.exists(path) {
                return AttemptOutcome::Missing;
            }
            loader.load_file(path).await
        }
    };

    match loaded {
        Ok(credentials) => AttemptOutcome::Loaded(credentials),
        Err(reason) => AttemptOutcome::Failed(reason),
    }
}

/// Walk the plan and return the first credentials that load
pub async fn resolve_credentials<L: CredentialLoader>(
    config: &KubernetesConfig,
    loader: &L,
) -> Result<(CredentialSource, L::Credentials), ConnectionError> {
    let mut in_cluster_error = None;
    let mut missing_path = None;

    for source in plan(config) {
        match attempt(loader, &source).await {
            AttemptOutcome::Loaded(credentials) => return Ok((source, credentials)),
            AttemptOutcome::Failed(reason) => match source {
                CredentialSource::InCluster => {
                    warn!(
                        error = %reason,
                        "Failed to load in-cluster config, will try file-based config"
                    );
                    in_cluster_error = Some(reason);
                }
                CredentialSource::Kubeconfig(path) => {
                    return Err(ConnectionError::InvalidKubeconfig { path, reason });
                }
            },
            AttemptOutcome::Missing => {
                if let CredentialSource::Kubeconfig(path) = source {
                    debug!(path = %path.display(), "No kubeconfig file at path");
                    missing_path = Some(path);
                }
            }
        }
    }

    match (in_cluster_error, missing_path) {
        (Some(reason), _) => Err(ConnectionError::InClusterUnavailable(reason)),
        (None, Some(path)) => Err(ConnectionError::KubeconfigNotFound { path }),
        (None, None) => Err(ConnectionError::KubeconfigNotFound {
            path: default_kubeconfig_path(),
        }),
    }
}

/// Builds an authenticated cluster client from configuration
pub struct ClusterClientFactory {
    config: KubernetesConfig,
}

impl ClusterClientFactory {
    pub fn new(config: KubernetesConfig) -> Self {
        Self { config }
    }

    /// Resolve credentials and build a client
    pub async fn connect(&self) -> Result<(Client, CredentialSource), ConnectionError> {
        let (source, config) = resolve_credentials(&self.config, &KubeCredentialLoader).await?;
        info!(source = %source, cluster_url = %config.cluster_url, "Loaded cluster credentials");

        let client = Client::try_from(config)?;
        Ok((client, source))
    }
}
