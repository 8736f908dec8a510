use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("The group tracker has been closed")]
    /// The tracker no longer receives views from the transport.
    Closed,

    #[error("The membership did not reach the expected state within the timeout")]
    /// A wait on the membership elapsed.
    Timeout,
}
