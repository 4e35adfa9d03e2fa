use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    connection::Connection,
    hub::{Hub, HubHandle},
    session::Session,
};

const SHUTDOWN_NOTICE: &str = "Server shutting down\n";

pub struct Server {
    listener: TcpListener,
    config: HubConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, config } = self;
        let config = Arc::new(config);
        let (hub, handle) = Hub::new(&config);
        let hub_task = tokio::spawn(hub.run());
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handle, &config);
                }
            }
        }

        handle_shutdown(&handle).await;
        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task failed");
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(handle: &HubHandle) {
    info!("server shutting down");
    if let Ok(members) = handle.members().await {
        debug!(members = members.len(), "notifying connected clients");
    }
    if let Err(err) = handle.shutdown(SHUTDOWN_NOTICE).await {
        warn!(error = ?err, "hub stopped before shutdown");
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &HubHandle,
    config: &Arc<HubConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, hub, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, hub: &HubHandle, config: &Arc<HubConfig>) {
    let hub = hub.clone();
    let config = Arc::clone(config);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let connection = Arc::new(Connection::new(writer, Some(peer)));
        debug!(peer = %peer, id = %connection.id(), "accepted connection");

        let session = Session::new(connection, BufReader::new(reader), hub, &config);
        if let Err(err) = session.run().await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
