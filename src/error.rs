use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("No response: {0}")]
    NoResponse(String),
    #[error("Unexpected reply to {command:?}: {reply:?}")]
    UnexpectedReply { command: String, reply: String },
    #[error("Could not parse {what} from {input:?}")]
    Parse { what: String, input: String },
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstrumentError {
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                InstrumentError::Timeout(context)
            }
            _ => InstrumentError::Io { source, context },
        }
    }

    pub fn parse(what: impl Into<String>, input: impl Into<String>) -> Self {
        InstrumentError::Parse {
            what: what.into(),
            input: input.into(),
        }
    }

    pub fn unexpected(command: impl Into<String>, reply: impl Into<String>) -> Self {
        InstrumentError::UnexpectedReply {
            command: command.into(),
            reply: reply.into(),
        }
    }
}

impl From<std::io::Error> for InstrumentError {
    fn from(source: std::io::Error) -> Self {
        InstrumentError::io(source, "bus I/O")
    }
}

impl From<serialport::Error> for InstrumentError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => InstrumentError::InvalidAddress(err.description),
            serialport::ErrorKind::Io(kind) => InstrumentError::io(
                std::io::Error::new(kind, err.description.clone()),
                "serial port",
            ),
            _ => InstrumentError::Config(err.description),
        }
    }
}
