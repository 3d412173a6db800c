//! Per-inode write-back tuning.

use nwb_error::{Result, WbError};
use serde::{Deserialize, Serialize};

/// Write-back configuration, fixed when the inode context is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Largest upload subrequest, as negotiated with the server.
    /// Default: 256 KiB.
    pub wsize: usize,
    /// Most discontiguous segments one upload subrequest may carry.
    /// Default: unbounded.
    pub max_segs: usize,
    /// Fail request creation when the local cache cannot be bound.
    /// Default: false (the cache stream is simply left unavailable).
    pub cache_required: bool,
    /// Times the collector re-dispatches a subrequest after a transient
    /// failure. Default: 3.
    pub max_retries: u32,
    /// Dispatched-but-uncollected subrequests allowed before the issuer
    /// pauses. 0 disables backpressure. Default: 0.
    pub max_in_flight: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            wsize: 256 * 1024,
            max_segs: usize::MAX,
            cache_required: false,
            max_retries: 3,
            max_in_flight: 0,
        }
    }
}

impl WriteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.wsize == 0 {
            return Err(WbError::InvalidRequest("wsize must be > 0".to_owned()));
        }
        if self.max_segs == 0 {
            return Err(WbError::InvalidRequest("max_segs must be > 0".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        WriteConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_wsize_rejected() {
        let cfg = WriteConfig {
            wsize: 0,
            ..WriteConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(WbError::InvalidRequest(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: WriteConfig =
            serde_json::from_str(r#"{"wsize": 65536, "max_in_flight": 4}"#).expect("parse");
        assert_eq!(cfg.wsize, 65536);
        assert_eq!(cfg.max_in_flight, 4);
        assert_eq!(cfg.max_retries, 3);
        assert!(!cfg.cache_required);
    }
}
