pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod nats;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendFactory, AudioFile, AudioFrame, AudioSource, EncodedFrame, FileMicrophone,
    MicrophoneSource, OutputContext, OutputFactory, PcmBuffer, VirtualOutput,
    VirtualOutputFactory,
};
pub use config::Config;
pub use error::{LiveError, LiveResult};
pub use http::{create_router, AppState};
pub use nats::{NatsClient, NatsConnector};
pub use session::{
    LiveSession, SessionConfig, SessionDeps, SessionSnapshot, SessionStatus, Speaker, Transcript,
};
pub use transport::{LiveConnection, LiveConnector, LiveSetup, ServerMessage, TransportEvent};
