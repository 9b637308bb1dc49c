use anyhow::Context as _;
pub use camino::Utf8PathBuf as PathBuf;

/// The credentials and token cache location used to authenticate with GCS
#[derive(clap::Args, Clone, Debug)]
pub struct Config {
    /// The OAuth2 client id of the installed application
    #[arg(long, env = "GSCP_CLIENT_ID", hide_env_values = true)]
    pub client_id: String,
    /// The OAuth2 client secret of the installed application
    #[arg(long, env = "GSCP_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,
    /// The file the OAuth2 token is cached in, defaults to ~/.gscp/cache.json
    #[arg(long, env = "GSCP_CACHE")]
    pub cache: Option<PathBuf>,
    /// An authorization code obtained by visiting the authorization URL
    #[arg(long, env = "GSCP_CODE", hide_env_values = true)]
    pub code: Option<String>,
}

impl Config {
    /// The token cache path, either the one specified, or the default one
    /// located in the user's home directory
    pub fn cache_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone());
        }

        let home = dirs::home_dir().context("unable to determine home directory")?;
        let home = PathBuf::from_path_buf(home)
            .map_err(|pb| anyhow::anyhow!("home directory '{}' is not utf-8", pb.display()))?;

        Ok(home.join(".gscp").join("cache.json"))
    }

    /// Ensures the token cache file, and its parent directory, exist so that
    /// the token can be written to it later
    pub fn prepare_cache(&self) -> anyhow::Result<PathBuf> {
        let path = self.cache_path()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {parent}"))?;
        }

        if !path.exists() {
            crate::write_private(&path, b"").with_context(|| format!("failed to create {path}"))?;
            tracing::debug!(%path, "created empty token cache");
        }

        Ok(path)
    }
}
