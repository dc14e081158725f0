use agg_bundler_rs::Config as BundlerConfig;
use agg_rs::config::from_toml_file;
use eyre::WrapErr;
use serde::Deserialize;
use std::{fmt, path::Path};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub bundler: Option<BundlerConfig>,
}

impl Config {
    pub fn from_toml_file<P: AsRef<Path> + fmt::Display>(path: P) -> eyre::Result<Config> {
        tracing::info!("loading config from `{path}`...");

        from_toml_file::<_, Self>(path.as_ref()).wrap_err("could not load config")
    }
}
