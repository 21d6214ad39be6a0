use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Server configuration, read from a TOML file. Every key is optional.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Outbound event queue capacity per connection.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_max_proof_bytes")]
    pub max_proof_bytes: usize,
    #[serde(default = "default_proof_url_ttl_secs")]
    pub proof_url_ttl_secs: u64,
    /// Hex key for signing proof URLs. Generated per process when absent,
    /// which invalidates outstanding URLs on restart.
    #[serde(default)]
    pub url_signing_key: Option<String>,
    #[serde(default = "default_blob_base_url")]
    pub blob_base_url: String,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// One accepted bearer token.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub user_id: String,
    /// Hex SHA-256 of the token (see `teamflow-node --hash-token`).
    pub token_sha256: String,
}

impl NodeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::parse(&contents)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.subscriber_queue == 0 {
            bail!("subscriber_queue must be at least 1");
        }
        for user in &self.users {
            if user.user_id.trim().is_empty() {
                bail!("user entry with empty user_id");
            }
            let digest_ok = user.token_sha256.len() == 64
                && user.token_sha256.chars().all(|c| c.is_ascii_hexdigit());
            if !digest_ok {
                bail!("token_sha256 for {} is not a hex SHA-256 digest", user.user_id);
            }
        }
        if let Some(key) = &self.url_signing_key {
            hex::decode(key).context("url_signing_key is not hex")?;
        }
        Ok(())
    }

    /// The URL signing key as bytes, generating a random one if unset.
    pub fn signing_key(&self) -> Result<Vec<u8>> {
        match &self.url_signing_key {
            Some(key) => Ok(hex::decode(key)?),
            None => {
                tracing::warn!("url_signing_key not set; proof URLs will not survive a restart");
                Ok(rand::random::<[u8; 32]>().to_vec())
            }
        }
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            subscriber_queue: default_subscriber_queue(),
            max_proof_bytes: default_max_proof_bytes(),
            proof_url_ttl_secs: default_proof_url_ttl_secs(),
            url_signing_key: None,
            blob_base_url: default_blob_base_url(),
            users: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    teamflow::DEFAULT_ADDR.to_string()
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(dir).join("teamflow")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("teamflow")
    } else {
        PathBuf::from("/tmp/teamflow")
    }
}

fn default_subscriber_queue() -> usize {
    64
}

fn default_max_proof_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_proof_url_ttl_secs() -> u64 {
    300
}

fn default_blob_base_url() -> String {
    "http://127.0.0.1:7411/proofs".to_string()
}
