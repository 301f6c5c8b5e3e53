use fragstream_convert::ConversionError;
use fragstream_decode::ChannelError;
use fragstream_format::FormatError;

use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine has been shut down")]
    ShutDown,
}
