use thiserror::Error;

pub type NdsResult<T> = ::std::result::Result<T, NdsError>;

#[derive(Error, Debug)]
pub enum NdsError {
    #[error("Bad savestate: {0}")]
    BadSaveState(String),
}
