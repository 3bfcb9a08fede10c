use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::buffer::DEFAULT_CAPACITY;

fn default_listen() -> String {
    // All local addresses, port 35000
    "0.0.0.0:35000".to_owned()
}

fn default_buffer_size() -> usize {
    DEFAULT_CAPACITY
}

fn default_accept_backoff() -> Duration {
    Duration::from_millis(100)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub compositor: Option<String>,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_accept_backoff")]
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            compositor: None,
            buffer_size: default_buffer_size(),
            accept_backoff: default_accept_backoff(),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
        config.validate()?;
        Ok(config)
    }

    // <config dir>/wlrelay/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wlrelay").join("config.toml"))
    }

    // Only an explicitly named file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let (path, required) = match path {
            Some(path) => (path.to_owned(), true),
            None => match Config::default_path() {
                Some(path) => (path, false),
                None => return Ok(Config::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Config::parse(&text).map_err(|err| {
                Error::new(err.kind(), format!("{}: {}", path.display(), err))
            }),
            Err(err) if err.kind() == ErrorKind::NotFound && !required => Ok(Config::default()),
            Err(err) => Err(Error::new(
                err.kind(),
                format!("{}: {}", path.display(), err),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "buffer_size must be greater than zero",
            ));
        }
        Ok(())
    }
}
