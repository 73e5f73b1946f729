use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("TLE directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("TLE file read error: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Invalid TLE for {name}: {message}")]
    InvalidElements { name: String, message: String },
    #[error("Propagation error: {0}")]
    Propagation(String),
    #[error("Invalid station: {0}")]
    InvalidStation(String),
}
