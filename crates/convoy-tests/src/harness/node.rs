use convoy_node::config::NodeConfig;
use convoy_node::handler::{NodeState, Stores};
use convoy_node::socket;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const ACCOUNTS: &str = r#"
[accounts.alice]
token = "alice-token"
[accounts.bob]
token = "bob-token"
[accounts.carol]
token = "carol-token"
"#;

/// A daemon serving on a temp socket, with alice, bob and carol configured
/// and state persisted to a temp directory.
pub struct TestNode {
    pub state: Arc<NodeState>,
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    _state_dir: TempDir,
    _socket_dir: TempDir,
}

impl TestNode {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with("").await
    }

    /// Spawn with extra TOML appended to the base configuration.
    pub async fn spawn_with(extra_config: &str) -> Result<Self> {
        super::init_tracing();

        let state_dir = TempDir::new()?;
        let socket_dir = TempDir::new()?;
        let socket_path = socket_dir.path().join("convoy.sock");

        let config = NodeConfig::from_toml(&format!("{ACCOUNTS}\n{extra_config}"))
            .context("invalid test config")?;
        let stores = Stores::load(state_dir.path(), &config)?;
        let state = NodeState::new(&config, stores)?;

        let state_for_socket = state.clone();
        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            if let Err(e) = socket::serve(state_for_socket, &socket_path_clone).await {
                tracing::debug!(err = %e, "socket server stopped");
            }
        });

        // Wait for socket to be ready
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        Ok(Self {
            state,
            socket_path,
            state_dir: state_dir.path().to_path_buf(),
            _state_dir: state_dir,
            _socket_dir: socket_dir,
        })
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        std::fs::remove_file(&self.socket_path).ok();
    }
}
