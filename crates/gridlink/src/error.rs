use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    IllegalArgument(String),

    #[error("{0}")]
    IllegalState(String),

    #[error(transparent)]
    Net(#[from] gridlink_net::Error),

    #[error(transparent)]
    Config(#[from] gridlink_config::Error),

    /// Connect/open failure; the message enumerates the addresses tried and
    /// the source chain ends at the last underlying error.
    #[error("{message}")]
    Connection {
        message: String,
        source: Option<Box<Error>>,
    },
}

impl Error {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn connection(message: impl Into<String>, source: Option<Self>) -> Self {
        Self::Connection { message: message.into(), source: source.map(Box::new) }
    }

    /// A message frame violating the framing rules.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Net(gridlink_net::Error::Io(std::io::Error::other(message.into())))
    }

    pub fn is_interrupted_io(&self) -> bool {
        match self {
            Self::Net(err) => err.is_interrupted_io(),
            Self::Connection { source: Some(source), .. } => source.is_interrupted_io(),
            _ => false,
        }
    }
}
