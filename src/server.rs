//! Server assembly.
//!
//! Wires the object manager, invoker, invocation layer, client manager,
//! reboot countdown, shutdown graph and gateway together in startup order.

use crate::config::Config;
use crate::invocation::{CLIENT_GROUP, InvocationManager, Provider, server_provider};
use crate::invoker::Invoker;
use crate::network::{Gateway, auth};
use crate::state::omgr::Stats;
use crate::state::{
    ClientManager, ClientResolver, Constraint, DObjectManager, OmgrHandle, RebootManager,
    SessionDeps, ShutdownManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A fully wired server, bound but not yet accepting.
pub struct Server {
    omgr: OmgrHandle,
    invoker: Invoker,
    invocation: Arc<InvocationManager>,
    clients: Arc<ClientManager>,
    reboot: Arc<RebootManager>,
    shutdown: Arc<ShutdownManager>,
    gateway: Gateway,
    omgr_join: JoinHandle<Stats>,
}

impl Server {
    /// Starts the loop and worker pool and binds the listener.
    pub async fn build(config: &Config, resolver: Arc<dyn ClientResolver>) -> anyhow::Result<Self> {
        let (omgr, omgr_join) = DObjectManager::spawn(&config.omgr);
        let invoker = Invoker::spawn(omgr.clone(), &config.invoker);

        let invocation = InvocationManager::start(omgr.clone()).await?;
        invocation.register_provider(server_provider(), &[CLIENT_GROUP])?;

        let clients = ClientManager::new(SessionDeps {
            omgr: omgr.clone(),
            invoker: invoker.clone(),
            invocation: Arc::clone(&invocation),
            resolver,
            config: config.session.clone(),
        });

        let shutdown = ShutdownManager::new(omgr.clone());
        let clients_id = shutdown.register_shutdowner("clients", clients.clone());
        let invoker_id = shutdown.register_shutdowner("invoker", Arc::new(invoker.clone()));
        shutdown.add_constraint(clients_id, Constraint::RunsBefore, invoker_id)?;

        let reboot = RebootManager::new(
            config.reboot.clone(),
            &omgr,
            Arc::clone(&shutdown),
            clients.clone(),
        );
        let reboot_id = shutdown.register_shutdowner("reboot", reboot.clone());
        shutdown.add_constraint(reboot_id, Constraint::RunsBefore, clients_id)?;
        reboot.init();

        let gateway = Gateway::bind(
            &config.listen,
            &config.session,
            Arc::clone(&clients),
            auth::from_config(&config.auth),
            shutdown.shutdown_tx.clone(),
        )
        .await?;

        Ok(Self {
            omgr,
            invoker,
            invocation,
            clients,
            reboot,
            shutdown,
            gateway,
            omgr_join,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.gateway.local_addr()
    }

    pub fn omgr(&self) -> &OmgrHandle {
        &self.omgr
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn invocation(&self) -> &Arc<InvocationManager> {
        &self.invocation
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn reboot_manager(&self) -> &Arc<RebootManager> {
        &self.reboot
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// Registers a provider, logging instead of failing on a duplicate.
    pub fn register_provider(&self, provider: Provider, groups: &[&str]) {
        let module = provider.module().to_string();
        if let Err(e) = self.invocation.register_provider(provider, groups) {
            warn!(%module, error = %e, "Provider not registered");
        }
    }

    /// Accepts clients until shutdown, then waits for the loop and the
    /// worker pool to finish.
    pub async fn run(self) -> anyhow::Result<Stats> {
        let Self {
            invoker,
            clients,
            gateway,
            omgr_join,
            ..
        } = self;

        let flush = clients.start_flush_interval();
        let gateway = tokio::spawn(gateway.run());

        let stats = omgr_join.await?;
        flush.cancel();
        invoker.shutdown();
        invoker.drained().await;
        gateway.await??;
        info!(units = stats.units_processed, "Server stopped");
        Ok(stats)
    }
}
