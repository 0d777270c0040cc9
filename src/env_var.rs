use crate::driver::{DEFAULT_CHUNK_SIZES, DEFAULT_MATRIX_DIM};

use serde::Deserialize;
use std::sync::OnceLock;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_dissemination_factor() -> usize {
    2
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_port() -> u16 {
    17000
}

fn default_join_timeout() -> f64 {
    60.0
}

fn default_max_frame_mb() -> usize {
    8192
}

fn default_matrix_dim() -> usize {
    DEFAULT_MATRIX_DIM
}

fn default_chunk_sizes() -> Vec<usize> {
    DEFAULT_CHUNK_SIZES.to_vec()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Seconds a blocked receive waits before warning about a potential deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The dissemination factor for the n-way barrier, default: 2
    #[serde(default = "default_dissemination_factor")]
    pub barrier_dissemination_factor: usize,

    /// The lamellae backend to use
    /// local -- single pe execution, default
    /// sockets -- one process per pe, connected over tcp
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Base tcp port of the sockets backend, pe `i` listens on `port + i`
    #[serde(default = "default_port")]
    pub port: u16,

    /// Comma separated hosts, either one for all pes or one per pe
    pub hosts: Option<String>,

    /// Seconds allowed for every pe to join the group
    #[serde(default = "default_join_timeout")]
    pub join_timeout: f64,

    /// Largest message a sockets pe accepts, in MiB, default: 8192 (a 32768 x 32768 operand)
    #[serde(default = "default_max_frame_mb")]
    pub max_frame_mb: usize,

    #[serde(default = "default_matrix_dim")]
    pub matrix_dim: usize,

    #[serde(default = "default_chunk_sizes")]
    pub chunk_sizes: Vec<usize>,

    pub seed: Option<u64>,

    /// Compare every gathered result against a reference product
    #[serde(default)]
    pub verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            deadlock_timeout: default_deadlock_timeout(),
            barrier_dissemination_factor: default_dissemination_factor(),
            backend: default_backend(),
            port: default_port(),
            hosts: None,
            join_timeout: default_join_timeout(),
            max_frame_mb: default_max_frame_mb(),
            matrix_dim: default_matrix_dim(),
            chunk_sizes: default_chunk_sizes(),
            seed: None,
            verify: false,
        }
    }
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("DISTMM_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("invalid DISTMM_ environment configuration: {}", error),
    })
}
