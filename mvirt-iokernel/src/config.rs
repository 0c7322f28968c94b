//! Dataplane configuration

use thiserror::Error;

use crate::packet::{ETHERNET_MAX_FRAME, RX_NET_HDR_SIZE};
use crate::pool::{PoolParams, ShmBacking};

/// Default SysV key of the ingress segment ("iok1")
pub const INGRESS_SHM_KEY: i32 = 0x696f6b31;

/// Default upper bound of the ingress segment
pub const INGRESS_SHM_WINDOW: usize = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    #[error("headroom {0} must be a multiple of 8 and at least 12")]
    Headroom(usize),

    #[error("buffer size {buf_size} leaves less than 1514 bytes after {headroom} bytes headroom")]
    BufferTooSmall { buf_size: usize, headroom: usize },
}

#[derive(Debug, Clone)]
pub struct DataplaneConfig {
    /// Number of packet buffers
    pub pool_capacity: usize,
    /// Headroom plus data room per buffer
    pub buf_size: usize,
    pub headroom: usize,
    pub shm_window: usize,
    pub shm_key: i32,
    pub hugepages: bool,
    /// Map the pool anonymously instead of as a keyed segment
    pub anonymous_shm: bool,
    /// NUMA node the dispatcher polls from
    pub numa_node: Option<u32>,
    /// Frames pulled from the NIC per iteration
    pub rx_burst: usize,
    /// Control messages handled per iteration
    pub control_burst: usize,
    /// Completion words handled per iteration
    pub completion_burst: usize,
    /// Size of the MAC table
    pub max_clients: usize,
    pub control_queue_size: usize,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 8191,
            buf_size: 2176,
            headroom: 128,
            shm_window: INGRESS_SHM_WINDOW,
            shm_key: INGRESS_SHM_KEY,
            hugepages: true,
            anonymous_shm: false,
            numa_node: None,
            rx_burst: 32,
            control_burst: 8,
            completion_burst: 32,
            max_clients: 128,
            control_queue_size: 1024,
        }
    }
}

impl DataplaneConfig {
    /// Defaults with an anonymous pool of `pool_capacity` buffers.
    pub fn anonymous(pool_capacity: usize) -> Self {
        Self {
            pool_capacity,
            anonymous_shm: true,
            hugepages: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("pool_capacity", self.pool_capacity),
            ("rx_burst", self.rx_burst),
            ("control_burst", self.control_burst),
            ("completion_burst", self.completion_burst),
            ("max_clients", self.max_clients),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if !self.control_queue_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "control_queue_size",
                value: self.control_queue_size,
            });
        }
        if self.headroom < RX_NET_HDR_SIZE || self.headroom % 8 != 0 {
            return Err(ConfigError::Headroom(self.headroom));
        }
        if self.buf_size < self.headroom + ETHERNET_MAX_FRAME {
            return Err(ConfigError::BufferTooSmall {
                buf_size: self.buf_size,
                headroom: self.headroom,
            });
        }
        Ok(())
    }

    pub fn pool_params(&self) -> PoolParams {
        let backing = if self.anonymous_shm {
            ShmBacking::Anonymous
        } else {
            ShmBacking::SysV {
                key: self.shm_key,
                hugepages: self.hugepages,
            }
        };
        PoolParams {
            capacity: self.pool_capacity,
            buf_size: self.buf_size,
            headroom: self.headroom,
            shm_window: self.shm_window,
            backing,
            numa_node: self.numa_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DataplaneConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rx_burst, 32);
        assert_eq!(config.control_burst, 8);
        assert_eq!(config.max_clients, 128);
        assert_eq!(config.pool_capacity, 8191);
    }

    #[test]
    fn test_zero_bursts_rejected() {
        let config = DataplaneConfig {
            rx_burst: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero { field: "rx_burst" })
        ));
    }

    #[test]
    fn test_queue_size_power_of_two() {
        let config = DataplaneConfig {
            control_queue_size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPowerOfTwo { value: 1000, .. })
        ));
    }

    #[test]
    fn test_headroom_rules() {
        for headroom in [4, 20] {
            let config = DataplaneConfig {
                headroom,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Headroom(_))));
        }
        let config = DataplaneConfig {
            buf_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_pool_params_backing() {
        let params = DataplaneConfig::default().pool_params();
        assert_eq!(
            params.backing,
            ShmBacking::SysV {
                key: INGRESS_SHM_KEY,
                hugepages: true
            }
        );
        let params = DataplaneConfig::anonymous(16).pool_params();
        assert_eq!(params.backing, ShmBacking::Anonymous);
        assert_eq!(params.capacity, 16);
    }
}
