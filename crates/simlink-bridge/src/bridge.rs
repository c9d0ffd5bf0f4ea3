//! Bridge lifecycle: init, per-tick work and shutdown

use crate::channel::{ChannelState, TransportChannel};
use crate::host::{SimulationState, TickHook};
use crate::process::OptimizerProcess;
use crate::queue::BridgeQueues;
use crate::session::SessionRegistry;
use crate::sync::{BridgeStats, TickReport, TickSynchronizer};
use crate::transport::Endpoint;
use simlink_core::{BridgeConfig, ConfigProvider, Result};
use tracing::info;

/// A running bridge attached to one host simulation.
///
/// The socket lives exactly as long as this value; dropping it shuts the
/// transport down.
pub struct Bridge {
    config: BridgeConfig,
    sync: TickSynchronizer,
    channel: TransportChannel,
    queues: BridgeQueues,
}

impl Bridge {
    /// Read configuration and start the bridge.
    ///
    /// Returns `Ok(None)` when the configuration disables the bridge. Fails
    /// when the configuration is invalid or the socket cannot be bound or
    /// connected.
    pub fn init(provider: &dyn ConfigProvider) -> Result<Option<Self>> {
        let config = provider.load()?;
        if !config.enabled {
            info!("Bridge disabled by configuration");
            return Ok(None);
        }
        Self::start(config).map(Some)
    }

    /// Start with an explicit configuration, ignoring `enabled`
    pub fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let queues = BridgeQueues::new(config.inbound_capacity, config.outbound_capacity);
        let channel = TransportChannel::open(&config, queues.clone())?;
        let sync = TickSynchronizer::new(&config, &queues);

        info!(
            "Bridge started on {} ({:?}), sampling every {} ticks",
            config.endpoint.address, config.endpoint.role, config.sampling_interval
        );
        Ok(Self {
            config,
            sync,
            channel,
            queues,
        })
    }

    /// Run the bridge's work for one simulation tick
    pub fn on_tick(&mut self, tick: u64, sim: &mut dyn SimulationState) -> TickReport {
        self.sync.on_tick(tick, sim)
    }

    /// Close the socket and stop the transport runtime
    pub fn shutdown(mut self) {
        self.channel.shutdown();
        info!(
            "Bridge shut down ({} inbound, {} outbound items discarded)",
            self.queues.inbound.len(),
            self.queues.outbound.len()
        );
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Bound or dialed endpoint; reports the real port when bound to port 0
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.channel.local_endpoint()
    }

    /// Optimizers that completed the handshake and are still connected
    pub fn connected_peers(&self) -> usize {
        self.channel.peer_count()
    }

    /// Optimizer processes started from the configuration
    pub fn optimizers(&self) -> &[OptimizerProcess] {
        self.channel.optimizers()
    }

    pub fn stats(&self) -> &BridgeStats {
        self.sync.stats()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        self.sync.sessions()
    }
}

impl TickHook for Bridge {
    fn on_tick(&mut self, tick: u64, sim: &mut dyn SimulationState) {
        Bridge::on_tick(self, tick, sim);
    }
}
