use super::*;
use error::FsError;

use clap::Args;

/// Runtime knobs of a mounted file system.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Cached blocks retained before least-recently-used ones are evicted
    #[arg(long, default_value_t = EVICTION_THRESHOLD)]
    pub eviction_threshold: usize,

    /// Upper bound on log slots, further capped by the on-disk log region
    #[arg(long, default_value_t = LOG_MAX_SIZE)]
    pub log_max_size: usize,

    /// Unreferenced in-memory inodes kept for reuse
    #[arg(long, default_value_t = INODE_CACHE_CAPACITY)]
    pub inode_cache_capacity: usize,

    /// Descriptor slots of an open file table
    #[arg(long, default_value_t = NFILE)]
    pub max_open_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            eviction_threshold: EVICTION_THRESHOLD,
            log_max_size: LOG_MAX_SIZE,
            inode_cache_capacity: INODE_CACHE_CAPACITY,
            max_open_files: NFILE,
        }
    }
}

impl Config {
    /// Effective number of log slots for a log region of `num_log_blocks`
    /// blocks; one block of the region holds the header.
    pub fn log_size(&self, num_log_blocks: usize) -> usize {
        self.log_max_size
            .min(LOG_MAX_SIZE)
            .min(num_log_blocks.saturating_sub(1))
    }

    pub fn validate(&self, num_log_blocks: usize) -> Result<()> {
        if self.eviction_threshold == 0 {
            return Err(FsError::Format("eviction threshold must be positive".into()));
        }
        let log_size = self.log_size(num_log_blocks);
        if log_size < OP_MAX_NUM_BLOCKS {
            return Err(FsError::Format(format!(
                "log holds {log_size} blocks, a transaction may need {OP_MAX_NUM_BLOCKS}"
            )));
        }
        if self.max_open_files == 0 {
            return Err(FsError::Format("open file table must have a slot".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_size_is_capped_by_region() {
        let config = Config::default();
        assert_eq!(config.log_size(31), 30);
        assert_eq!(config.log_size(1000), LOG_MAX_SIZE);

        let config = Config {
            log_max_size: 20,
            ..Config::default()
        };
        assert_eq!(config.log_size(31), 20);
    }

    #[test]
    fn test_validate_rejects_tiny_log() {
        let config = Config::default();
        assert!(config.validate(OP_MAX_NUM_BLOCKS + 1).is_ok());
        assert!(config.validate(OP_MAX_NUM_BLOCKS).is_err());

        let config = Config {
            eviction_threshold: 0,
            ..Config::default()
        };
        assert!(config.validate(64).is_err());
    }
}
