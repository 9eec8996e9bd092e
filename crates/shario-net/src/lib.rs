// P2P networking layer built on libp2p with TCP + Noise + Yamux transport.

pub mod behaviour;
pub mod discovery;
pub mod registry;
pub mod swarm;
pub mod transport;

pub use behaviour::{SharioBehaviour, SharioEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs};
pub use registry::{PeerInfo, PeerRegistry, RegistryObserver};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::build_swarm;
