//! Environment-driven recorder configuration.
//!
//! The supervisor stages `GF_*` keys into the target environment (see
//! `greyfork::executors::forkserver` for the constants); this module reads
//! them back at setup time. A key that a selected mode depends on but that is
//! missing is a fatal configuration error, raised before any target code
//! runs.

use std::{env, path::PathBuf};

use greyfork::executors::forkserver::{
    RunMode, BITMAP_LOG_ENV, COVERAGE_LOG_ENV, CTX_SENSITIVITY_ENV_VAR, DBG_LOG_ENV,
    EDGE_LOG_ENV, FEED_ADDR_ENV_VAR, FEED_IDX_ENV_VAR, FEED_LOG_ENV, FORK_SERVER_ENV_VAR,
    HASH_LOG_ENV, MEASURE_COV_ENV_VAR, MODE_ENV_VAR, NODE_LOG_ENV, PATH_LOG_ENV, SHM_ENV_VAR,
    SYSCALL_LOG_ENV,
};

use crate::{Error, GuestAddr};

/// Everything the recorder side reads from its environment.
#[derive(Debug, Clone, Default)]
pub struct RecorderConfig {
    /// Run mode; `None` when a fork-server stub will deliver it per request
    pub mode: Option<RunMode>,
    /// Whether a fork-server stub serves this process
    pub fork_server: bool,
    /// Coverage summary output path
    pub coverage_log: Option<PathBuf>,
    /// Accumulative node log path
    pub node_log: Option<PathBuf>,
    /// Accumulative edge log path
    pub edge_log: Option<PathBuf>,
    /// Accumulative path-hash log path
    pub path_log: Option<PathBuf>,
    /// Branch/comparison feedback output path
    pub feed_log: Option<PathBuf>,
    /// Hash output path
    pub hash_log: Option<PathBuf>,
    /// Accumulative edge bitmap file path
    pub bitmap_log: Option<PathBuf>,
    /// Whether a SysV shared-memory bitmap id is staged in the environment
    pub shm_bitmap: bool,
    /// Debug log path
    pub dbg_log: Option<PathBuf>,
    /// Syscall trace log path
    pub syscall_log: Option<PathBuf>,
    /// Branch capture target address; `None` selects full-trace capture
    pub feed_addr: Option<GuestAddr>,
    /// Branch capture target hit index (1-based)
    pub feed_idx: Option<u64>,
    /// Accumulative coverage measurement report
    pub measure_cov: bool,
    /// Frames of calling context folded into a node id
    pub ctx_sensitivity: usize,
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn env_flag(key: &str) -> Result<Option<bool>, Error> {
    match env::var(key) {
        Ok(val) => Ok(Some(val.trim().parse::<i32>()? != 0)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn env_hex(key: &str) -> Result<Option<u64>, Error> {
    match env::var(key) {
        Ok(val) => {
            let val = val.trim().trim_start_matches("0x");
            let parsed = u64::from_str_radix(val, 16).map_err(|_| {
                Error::illegal_argument(format!("{key} is not a hex number: {val}"))
            })?;
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl RecorderConfig {
    /// Read the configuration from the process environment.
    ///
    /// `GF_FORK_SERVER` must always be present; without a fork server the run
    /// mode must be in `GF_MODE` as well, since no stub will deliver it.
    pub fn from_env() -> Result<Self, Error> {
        let fork_server = env_flag(FORK_SERVER_ENV_VAR)?
            .ok_or_else(|| Error::key_not_found(FORK_SERVER_ENV_VAR))?;

        let mode = match env::var(MODE_ENV_VAR) {
            Ok(val) => Some(
                RunMode::try_from(val.trim().parse::<i32>()?)
                    .map_err(|_| Error::illegal_argument(format!("Unknown run mode {val}")))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err.into()),
        };
        if !fork_server && mode.is_none() {
            return Err(Error::key_not_found(MODE_ENV_VAR));
        }

        let feed_addr = env_hex(FEED_ADDR_ENV_VAR)?.map(|addr| addr as GuestAddr);
        let feed_idx = env_hex(FEED_IDX_ENV_VAR)?;
        if feed_addr.is_some() && feed_idx.is_none() {
            return Err(Error::key_not_found(FEED_IDX_ENV_VAR));
        }

        let ctx_sensitivity = match env::var(CTX_SENSITIVITY_ENV_VAR) {
            Ok(val) => val.trim().parse::<usize>()?,
            Err(_) => 0,
        };

        Ok(Self {
            mode,
            fork_server,
            coverage_log: env_path(COVERAGE_LOG_ENV),
            node_log: env_path(NODE_LOG_ENV),
            edge_log: env_path(EDGE_LOG_ENV),
            path_log: env_path(PATH_LOG_ENV),
            feed_log: env_path(FEED_LOG_ENV),
            hash_log: env_path(HASH_LOG_ENV),
            bitmap_log: env_path(BITMAP_LOG_ENV),
            shm_bitmap: env::var_os(SHM_ENV_VAR).is_some(),
            dbg_log: env_path(DBG_LOG_ENV),
            syscall_log: env_path(SYSCALL_LOG_ENV),
            feed_addr,
            feed_idx,
            measure_cov: env_flag(MEASURE_COV_ENV_VAR)?.unwrap_or(false),
            ctx_sensitivity,
        })
    }

    /// The path stored under `key`, or a fatal configuration error.
    pub(crate) fn require_path(
        path: &Option<PathBuf>,
        key: &'static str,
    ) -> Result<PathBuf, Error> {
        path.clone().ok_or_else(|| Error::key_not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use greyfork::executors::forkserver::{
        RunMode, FEED_ADDR_ENV_VAR, FEED_IDX_ENV_VAR, FORK_SERVER_ENV_VAR, MODE_ENV_VAR,
    };
    use serial_test::serial;

    use super::RecorderConfig;

    fn clear_env() {
        for key in [
            FORK_SERVER_ENV_VAR,
            MODE_ENV_VAR,
            FEED_ADDR_ENV_VAR,
            FEED_IDX_ENV_VAR,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn fork_server_key_is_required() {
        clear_env();
        assert!(RecorderConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn mode_required_without_fork_server() {
        clear_env();
        std::env::set_var(FORK_SERVER_ENV_VAR, "0");
        assert!(RecorderConfig::from_env().is_err());

        std::env::set_var(MODE_ENV_VAR, "1");
        let config = RecorderConfig::from_env().unwrap();
        assert_eq!(config.mode, Some(RunMode::HashOnly));
        assert!(!config.fork_server);
        clear_env();
    }

    #[test]
    #[serial]
    fn feed_target_parses_hex() {
        clear_env();
        std::env::set_var(FORK_SERVER_ENV_VAR, "1");
        std::env::set_var(FEED_ADDR_ENV_VAR, "0x400a1c");
        std::env::set_var(FEED_IDX_ENV_VAR, "3");
        let config = RecorderConfig::from_env().unwrap();
        assert_eq!(config.feed_addr, Some(0x400a1c));
        assert_eq!(config.feed_idx, Some(3));
        clear_env();
    }

    #[test]
    #[serial]
    fn feed_addr_without_index_is_fatal() {
        clear_env();
        std::env::set_var(FORK_SERVER_ENV_VAR, "1");
        std::env::set_var(FEED_ADDR_ENV_VAR, "0x400a1c");
        assert!(RecorderConfig::from_env().is_err());
        clear_env();
    }
}
