use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

pub fn from_toml_file<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T, Error> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config = toml::from_str(&contents)?;
    Ok(config)
}
