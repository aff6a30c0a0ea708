use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address cannot be empty")]
    EmptyAddress,

    #[error("Invalid port: {port}")]
    InvalidPort { port: i32 },
}
