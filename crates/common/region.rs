use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RegionId = u64;
pub type StoreId = u64;

/// Configuration and split version of a region. Both bump monotonically:
/// `conf_ver` on replica membership changes, `version` on splits and merges.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// Full identity of one region snapshot: a region id is only meaningful
/// together with the epoch it was observed at, since the same id is reused
/// across splits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

impl RegionVerId {
    pub fn new(id: RegionId, epoch: RegionEpoch) -> Self {
        Self {
            id,
            conf_ver: epoch.conf_ver,
            ver: epoch.version,
        }
    }

    pub fn epoch(&self) -> RegionEpoch {
        RegionEpoch {
            conf_ver: self.conf_ver,
            version: self.ver,
        }
    }
}

impl fmt::Debug for RegionVerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.id, self.conf_ver, self.ver)
    }
}

impl fmt::Display for RegionVerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Metadata record of a region as reported by the region map.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: RegionId,
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub epoch: RegionEpoch,
}

/// A physical replica node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub addr: String,
}

impl Store {
    pub fn new(id: StoreId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Which replica class of a region a request should be served by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaKind {
    /// Row-oriented replicas serving transactional reads.
    #[default]
    Row,
    /// Column-oriented replicas serving analytical scans.
    Columnar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ver_id_round_trips_epoch() {
        let epoch = RegionEpoch {
            conf_ver: 5,
            version: 9,
        };
        let ver = RegionVerId::new(42, epoch);
        assert_eq!(ver.epoch(), epoch);
        assert_eq!(format!("{ver}"), "42_5_9");
    }

    #[test]
    fn same_id_different_epoch_is_distinct() {
        let a = RegionVerId::new(7, RegionEpoch { conf_ver: 1, version: 1 });
        let b = RegionVerId::new(7, RegionEpoch { conf_ver: 1, version: 2 });
        assert_ne!(a, b);
    }
}
