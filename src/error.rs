use thiserror::Error;

#[derive(Error, Debug)]
pub enum YardError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job not available for assignment: {0}")]
    JobUnavailable(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {0} still holds an assigned job")]
    NodeBusy(String),

    #[error("Node {node} is not the assignee of job {job}")]
    NotAssignee { job: String, node: String },

    #[error("Bad ack signature for job {0}")]
    BadSignature(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("Container runtime error: {0}")]
    Docker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, YardError>;
