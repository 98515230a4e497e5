#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The caster did not answer a request with the expected status marker.
    #[error("unexpected caster status: {0}")]
    CasterStatus(String),

    /// No usable mountpoint in the caster sourcetable.
    #[error("sourcetable contains no mountpoints")]
    NoMountpoint,

    /// No valid position fix arrived within the wait budget.
    #[error("timed out waiting for a position fix")]
    FixTimeout,

    #[error("credentials are required when RTK is enabled")]
    MissingCredentials,
}

pub type Result<T> = std::result::Result<T, Error>;
