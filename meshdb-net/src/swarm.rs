//! libp2p transport: gossipsub for topic multicast, mDNS for LAN
//! discovery, Kademlia for WAN bootstrap, identify for address exchange.
//!
//! The swarm runs on a dedicated driver task. The [`P2pTransport`] handle
//! talks to it over a command channel; inbound gossip is fanned out to
//! per-topic subscriber channels. Discovery feeds the gossip mesh and the
//! routing table but is otherwise uninterpreted; the replicator only ever
//! asks "who is connected".

use crate::transport::{NodeId, PeerTransport, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId};
use meshdb_core::config::NetworkConfig;
use meshdb_core::{Error, Result as CoreResult};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const PROTOCOL_NAME: &str = "meshdb/1.0.0";

/// Swarm settings derived from the `network` config section.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub listen_addresses: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub mdns_enabled: bool,
    pub mdns_interval: Duration,
    pub dht_enabled: bool,
    pub dht_server_mode: bool,
    pub dht_bootstrap_interval: Duration,
}

impl From<&NetworkConfig> for P2pConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            listen_addresses: network.listen_addresses.clone(),
            bootstrap_peers: network.bootstrap_peers.clone(),
            mdns_enabled: network.mdns.enabled,
            mdns_interval: Duration::from_secs(network.mdns.interval.max(1)),
            dht_enabled: network.dht.enabled,
            dht_server_mode: network.dht.mode == "server",
            dht_bootstrap_interval: Duration::from_secs(network.dht.bootstrap_interval.max(1)),
        }
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    kad: Toggle<kad::Behaviour<MemoryStore>>,
    identify: identify::Behaviour,
}

enum Command {
    Publish {
        topic: String,
        data: Bytes,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<CoreResult<mpsc::Receiver<TransportMessage>>>,
    },
}

/// Handle implementing [`PeerTransport`] over the swarm driver.
pub struct P2pTransport {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
}

impl P2pTransport {
    /// Build the swarm, start listening, dial the bootstrap peers and
    /// spawn the driver task.
    pub async fn spawn(
        config: P2pConfig,
        shutdown: watch::Receiver<bool>,
    ) -> CoreResult<Arc<Self>> {
        let mut swarm = build_swarm(&config)?;
        let peer_id = *swarm.local_peer_id();

        for addr in &config.listen_addresses {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|e| Error::malformed("listen address", format!("{addr}: {e}")))?;
            swarm
                .listen_on(addr)
                .map_err(|e| Error::transport(format!("listen failed: {e}")))?;
        }

        for addr in &config.bootstrap_peers {
            match addr.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Some(libp2p::multiaddr::Protocol::P2p(peer)) = ma.iter().last() {
                        if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                            kad.add_address(&peer, ma.clone());
                        }
                    }
                    if let Err(e) = swarm.dial(ma.clone()) {
                        warn!(addr = %ma, error = %e, "failed to dial bootstrap peer");
                    }
                }
                Err(e) => warn!(addr, error = %e, "skipping bad bootstrap address"),
            }
        }

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let connected = Arc::new(RwLock::new(HashSet::new()));

        let transport = Arc::new(Self {
            peer_id,
            commands: commands_tx,
            connected: connected.clone(),
        });

        info!(peer_id = %peer_id, "p2p node starting");
        tokio::spawn(drive_swarm(swarm, config, commands_rx, connected, shutdown));

        Ok(transport)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl PeerTransport for P2pTransport {
    async fn publish(&self, topic: &str, data: Bytes) -> CoreResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| Error::transport("swarm driver is gone"))?;
        response
            .await
            .map_err(|_| Error::transport("swarm driver dropped the reply"))?
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<mpsc::Receiver<TransportMessage>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                topic: topic.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::transport("swarm driver is gone"))?;
        response
            .await
            .map_err(|_| Error::transport("swarm driver dropped the reply"))?
    }

    fn self_id(&self) -> NodeId {
        self.peer_id.to_string()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.connected.read().iter().map(|p| p.to_string()).collect()
    }
}

fn build_swarm(config: &P2pConfig) -> CoreResult<libp2p::Swarm<Behaviour>> {
    let mdns_enabled = config.mdns_enabled;
    let mdns_interval = config.mdns_interval;
    let dht_enabled = config.dht_enabled;
    let dht_server_mode = config.dht_server_mode;

    let swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::transport(format!("tcp transport: {e}")))?
        .with_quic()
        .with_behaviour(|key| {
            // Deduplicate by content, not by (author, seqno): the same
            // envelope relayed twice is one message.
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                gossipsub::MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(std::io::Error::other)?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(std::io::Error::other)?;

            let local_peer_id = key.public().to_peer_id();

            let mdns = if mdns_enabled {
                let mut mdns_config = mdns::Config::default();
                mdns_config.query_interval = mdns_interval;
                Some(mdns::tokio::Behaviour::new(mdns_config, local_peer_id)?)
            } else {
                None
            };

            let kad = if dht_enabled {
                let store = MemoryStore::new(local_peer_id);
                let mut kad = kad::Behaviour::new(local_peer_id, store);
                kad.set_mode(Some(if dht_server_mode {
                    kad::Mode::Server
                } else {
                    kad::Mode::Client
                }));
                Some(kad)
            } else {
                None
            };

            let identify = identify::Behaviour::new(identify::Config::new(
                PROTOCOL_NAME.to_string(),
                key.public(),
            ));

            Ok(Behaviour {
                gossipsub,
                mdns: Toggle::from(mdns),
                kad: Toggle::from(kad),
                identify,
            })
        })
        .map_err(|e| Error::transport(format!("behaviour setup: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

async fn drive_swarm(
    mut swarm: libp2p::Swarm<Behaviour>,
    config: P2pConfig,
    mut commands: mpsc::Receiver<Command>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscribers: HashMap<String, Vec<mpsc::Sender<TransportMessage>>> = HashMap::new();
    let mut bootstrap = tokio::time::interval(config.dht_bootstrap_interval);
    bootstrap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut swarm, &mut subscribers, command),
                    None => {
                        debug!("all transport handles dropped; stopping swarm");
                        return;
                    }
                }
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(&mut swarm, &mut subscribers, &connected, event);
            }
            _ = bootstrap.tick(), if config.dht_enabled => {
                if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                    if let Err(e) = kad.bootstrap() {
                        debug!(error = %e, "kademlia bootstrap deferred");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("swarm driver shutting down");
                return;
            }
        }
    }
}

fn handle_command(
    swarm: &mut libp2p::Swarm<Behaviour>,
    subscribers: &mut HashMap<String, Vec<mpsc::Sender<TransportMessage>>>,
    command: Command,
) {
    match command {
        Command::Publish { topic, data, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .publish(gossipsub::IdentTopic::new(&topic), data.to_vec())
                .map(|_| ())
                .map_err(|e| Error::transport(format!("publish on {topic}: {e}")));
            let _ = reply.send(result);
        }
        Command::Subscribe { topic, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(&topic))
                .map_err(|e| Error::transport(format!("subscribe to {topic}: {e}")));
            let result = result.map(|_| {
                let (tx, rx) = mpsc::channel(1024);
                subscribers.entry(topic).or_default().push(tx);
                rx
            });
            let _ = reply.send(result);
        }
    }
}

fn handle_swarm_event(
    swarm: &mut libp2p::Swarm<Behaviour>,
    subscribers: &mut HashMap<String, Vec<mpsc::Sender<TransportMessage>>>,
    connected: &Arc<RwLock<HashSet<PeerId>>>,
    event: SwarmEvent<BehaviourEvent>,
) {
    match event {
        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            let source = message
                .source
                .map(|p| p.to_string())
                .unwrap_or_default();
            let topic = message.topic.as_str().to_string();
            if let Some(senders) = subscribers.get_mut(&topic) {
                let payload = TransportMessage {
                    source,
                    data: Bytes::from(message.data),
                };
                senders.retain(|tx| match tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic, "subscriber backlog full; dropping message");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer, addr) in peers {
                debug!(peer = %peer, addr = %addr, "mdns discovered peer");
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                    kad.add_address(&peer, addr.clone());
                }
                if let Err(e) = swarm.dial(addr) {
                    debug!(peer = %peer, error = %e, "mdns dial failed");
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
            for (peer, _) in peers {
                debug!(peer = %peer, "mdns peer expired");
                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer);
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                for addr in info.listen_addrs {
                    kad.add_address(&peer_id, addr);
                }
            }
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            connected.write().insert(peer_id);
            debug!(peer = %peer_id, "peer connected");
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                connected.write().remove(&peer_id);
                debug!(peer = %peer_id, "peer disconnected");
            }
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(addr = %address, "listening");
        }
        _ => {}
    }
}
