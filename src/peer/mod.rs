pub mod connection;
pub mod ice;
pub mod link;
pub mod registry;
pub mod state;
pub mod types;

pub use connection::RtcPeerFactory;
pub use ice::{CandidateQueue, CandidateStats, CandidateType};
pub use link::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerLink, RtcSettings};
pub use registry::{CandidateDisposition, ConnectionHandle, PeerRegistry, RegistryNotice};
pub use state::{NegotiationState, PeerInfo};
pub use types::{
    ChatId, IceCandidate, ParticipantId, PeerState, RemoteMediaStream, RemoteTrack, SdpKind, ServerConfig,
    SessionDescription,
};
