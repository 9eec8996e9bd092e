// Node coordinator: owns the identity store and the transport host, wires
// the session registry, chat and transfer components together, and
// exposes the surface higher layers (GUI, CLI shells) build on.

pub mod node;

pub use node::{Node, NodeConfig};

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the tracing subscriber. `RUST_LOG` overrides the defaults.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("shario_node=debug,shario_net=debug,shario_chat=info,shario_transfer=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
