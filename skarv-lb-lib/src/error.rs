use thiserror::Error;

/// Errors surfaced by the control plane.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("map operation failed: {0}")]
    Map(#[from] skarv_ebpf::MapError),

    #[error("program assembly failed: {0}")]
    Asm(#[from] skarv_ebpf::AsmError),

    #[error("coordinator is already running")]
    AlreadyRunning,

    #[error("coordinator is not running")]
    NotRunning,

    #[error("failed to attach to interface {interface}: {source}")]
    Attach {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS resolution failed for {0}")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, Error>;
