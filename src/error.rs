use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("client not found")]
    ClientNotFound,

    #[error("client already exists: {0}")]
    ClientAlreadyExists(String),

    #[error("client already stopped")]
    ClientStopped,

    #[error("metadata not found")]
    MetaNotFound,

    #[error("negotiation is called before requested")]
    NegotiationNotRequested,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
