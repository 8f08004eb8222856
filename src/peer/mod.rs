pub mod connection;
pub mod ice;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory, Transport, TransportEvents, TransportFactory};
pub use types::{
    ConnectionState, IceCandidate, IceConnectionState, RemoteStream, SdpKind, ServerConfig,
    SessionDescription, TrackKind, TransportEvent,
};
