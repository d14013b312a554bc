//! CLI commands. Each command opens the store directly and calls the
//! services in-process as the `--as` user.

pub mod grant;
pub mod issue;
pub mod output;
pub mod plan_check;

use anyhow::{bail, Context, Result};
use changeflow::server::{open_state, serve};
use changeflow::{AppState, RequestContext};
use changeflow_logging::changeflow_home;
use changeflow_protocol::SystemConfig;
use std::path::Path;
use std::sync::Arc;

const CONFIG_FILE: &str = "config.toml";

pub struct Env {
    pub state: Arc<AppState>,
}

impl Env {
    /// Loads the config (`--config`, else `<home>/config.toml`), applies
    /// `--db` and opens the store.
    pub async fn open(config_path: Option<&Path>, db: Option<&Path>) -> Result<Self> {
        let home = changeflow_home()?;
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => home.join(CONFIG_FILE),
        };
        let mut config = SystemConfig::load(&config_path)?;
        if let Some(db) = db {
            config.database_path = db.to_path_buf();
        }
        let state = open_state(config, &home)
            .await
            .context("Failed to open changeflow store")?;
        Ok(Self { state })
    }

    /// Context of the `--as` user.
    pub async fn context(&self, email: Option<&str>) -> Result<RequestContext> {
        let Some(email) = email else {
            bail!("--as EMAIL (or CHANGEFLOW_USER) is required for this command");
        };
        Ok(self.state.context(email).await?)
    }

    pub async fn serve(self) -> Result<()> {
        serve(self.state).await?;
        Ok(())
    }
}
