//! Uplink connection lifecycle
//!
//! Keeps a WebSocket uplink to the CSMS registered in the topology table:
//! connect, register, wait for closure, deregister, back off, repeat.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::UplinkConfig;
use crate::correlator::Correlator;
use crate::identity::NodeId;
use crate::topology::TopologyTable;
use crate::transport::websocket::{build_ocpp_url, IncomingRequest, WebSocketChannel};

/// Uplink state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkEvent {
    Connected,
    Disconnected,
}

/// Reconnecting uplink to the CSMS
pub struct UplinkConnector {
    node_id: NodeId,
    config: UplinkConfig,
    topology: Arc<TopologyTable>,
    correlator: Arc<Correlator>,
    incoming: mpsc::Sender<IncomingRequest>,
}

impl UplinkConnector {
    pub fn new(
        node_id: NodeId,
        config: UplinkConfig,
        topology: Arc<TopologyTable>,
        correlator: Arc<Correlator>,
        incoming: mpsc::Sender<IncomingRequest>,
    ) -> Self {
        Self {
            node_id,
            config,
            topology,
            correlator,
            incoming,
        }
    }

    /// Run the connection loop until nobody listens for its events
    pub async fn run(self, events: mpsc::Sender<UplinkEvent>) {
        let url = build_ocpp_url(&self.config.csms_url, self.node_id.as_str());
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to CSMS: {}", url);

            match WebSocketChannel::connect(
                NodeId::csms(),
                &url,
                self.correlator.clone(),
                self.incoming.clone(),
            )
            .await
            {
                Ok(channel) => {
                    reconnect_delay = self.config.reconnect_delay;
                    self.topology.set_uplink(channel.clone());
                    if events.send(UplinkEvent::Connected).await.is_err() {
                        self.topology.clear_uplink();
                        break;
                    }

                    channel.closed().await;

                    self.topology.clear_uplink();
                    if events.send(UplinkEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Connection error: {}", e),
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }

        info!("Uplink connector stopped");
    }
}
