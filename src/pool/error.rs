/// Pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Backend(e) => e,
            err => Self(err.into()),
        }
    }
}

/// Error returned by [`ResourcePool::acquire`](super::ResourcePool::acquire).
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool has been closed: no resource will ever be handed out again.
    #[error("The pool is closed")]
    Closed,
    /// A new resource could not be created.
    #[error(transparent)]
    Backend(#[from] Error),
}
