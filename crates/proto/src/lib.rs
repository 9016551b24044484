pub mod builder;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod protocol;
pub mod queue;
pub mod reassembly;
pub mod simulator;
pub mod stats;
pub mod tracking;

pub use builder::PackageBuilder;
pub use config::ProtocolConfig;
pub use connection::{Connection, ConnectionManager};
pub use endpoint::{NetworkEndpoint, SendError};
pub use protocol::{
    ACK_BITS, FRAGMENT_MAGIC, FragmentHeader, MAX_FRAGMENTS, MAX_PACKAGE_SIZE, MESSAGE_MAGIC,
    MessageHeader, SEQUENCE_WINDOW, Trailer, forward_distance, in_window,
};
pub use queue::{BufferPool, MessageQueue, PendingMessage};
pub use reassembly::{FragmentReassembler, GroupReader, MessageHandler, PackageStatus};
pub use simulator::NetworkSimulator;
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{HeaderStatus, ReceivedWindow, SequenceTracker};
