//! Test server management.
//!
//! Runs a replicad server inside the test's runtime so tests can register
//! objects and providers directly.

use replicad::config::Config;
use replicad::invocation::InvocationManager;
use replicad::state::omgr::Stats;
use replicad::state::{
    ClientManager, ClientResolver, DefaultResolver, OmgrHandle, RebootManager, ShutdownManager,
};
use replicad::Server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A test server instance.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub omgr: OmgrHandle,
    pub invocation: Arc<InvocationManager>,
    pub clients: Arc<ClientManager>,
    pub reboot: Arc<RebootManager>,
    pub shutdown: Arc<ShutdownManager>,
    task: JoinHandle<anyhow::Result<Stats>>,
}

#[allow(dead_code)]
impl TestServer {
    /// Spawn a server with default settings.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with("", Arc::new(DefaultResolver)).await
    }

    /// Spawn a server with extra TOML sections appended to the base config.
    pub async fn spawn_with(extra: &str, resolver: Arc<dyn ClientResolver>) -> anyhow::Result<Self> {
        let config_content = format!(
            r#"
[server]
name = "test.server"

[listen]
address = "127.0.0.1:0"
handshake_timeout = 2

{extra}
"#
        );
        let config: Config = toml::from_str(&config_content)?;
        if let Err(errors) = replicad::config::validate(&config) {
            anyhow::bail!("invalid test config: {errors:?}");
        }

        let server = Server::build(&config, resolver).await?;
        let addr = server.local_addr()?;
        let omgr = server.omgr().clone();
        let invocation = Arc::clone(server.invocation());
        let clients = Arc::clone(server.clients());
        let reboot = Arc::clone(server.reboot_manager());
        let shutdown = Arc::clone(server.shutdown_manager());
        let task = tokio::spawn(server.run());

        Ok(Self {
            addr,
            omgr,
            invocation,
            clients,
            reboot,
            shutdown,
            task,
        })
    }

    /// Waits until `check` holds, polling every 10ms for up to 5 seconds.
    pub async fn wait_for(&self, mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    /// Requests shutdown and waits for the server to stop.
    pub async fn stop(self) -> anyhow::Result<Stats> {
        self.shutdown.queue_shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task).await??
    }
}
