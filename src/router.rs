//! Destination path computation: Hive-partitioned directories derived
//! from the event's own timestamp, never the flush-time clock.

use chrono::DateTime;
use std::fmt;

use crate::event::PartitionId;

/// URL scheme of the storage backend a path targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    File,
    S3,
    Wasbs,
    Gs,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::S3 => "s3",
            Protocol::Wasbs => "wasbs",
            Protocol::Gs => "gs",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes the directory a batch lands in:
/// `<protocol>://<bucket>/<base_path>/<topic>/<version>/dt=YYYY-MM-DD/pid=<partition>/`.
///
/// The filesystem backend has no bucket, so the path collapses to a
/// relative directory under the writer's base path. The router returns a
/// directory; the storage writer appends the file name.
#[derive(Debug, Clone)]
pub struct PathRouter {
    protocol: Protocol,
    bucket: String,
    base_path: String,
    default_version: String,
}

impl PathRouter {
    pub const DEFAULT_VERSION: &'static str = "v1";

    pub fn new<B: Into<String>, P: Into<String>>(protocol: Protocol, bucket: B, base_path: P) -> Self {
        PathRouter {
            protocol,
            bucket: bucket.into(),
            base_path: trim_slashes(&base_path.into()),
            default_version: Self::DEFAULT_VERSION.to_string(),
        }
    }

    pub fn with_default_version<V: Into<String>>(mut self, version: V) -> Self {
        self.default_version = version.into();
        self
    }

    /// The version path segment: the router default for an empty spec
    /// version, otherwise "v" plus the version with every dot removed
    /// ("1.0" becomes "v10", "2.0.0" becomes "v200").
    pub fn version_segment(&self, spec_version: &str) -> String {
        if spec_version.is_empty() {
            self.default_version.clone()
        } else {
            format!("v{}", spec_version.replace('.', ""))
        }
    }

    /// Deterministic for a given (partition, event time, spec version);
    /// the date component is the event timestamp's UTC calendar day.
    pub fn route(&self, id: &PartitionId, event_time_unix: i64, spec_version: &str) -> String {
        let date = DateTime::from_timestamp(event_time_unix, 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .format("%Y-%m-%d");
        let version = self.version_segment(spec_version);

        let mut path = String::new();
        if self.protocol != Protocol::File {
            path.push_str(self.protocol.as_str());
            path.push_str("://");
            path.push_str(&self.bucket);
            path.push('/');
        }
        if !self.base_path.is_empty() {
            path.push_str(&self.base_path);
            path.push('/');
        }
        path.push_str(&format!(
            "{}/{}/dt={}/pid={}/",
            id.topic, version, date, id.partition
        ));
        path
    }
}

fn trim_slashes(s: &str) -> String {
    s.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(ts: &str) -> i64 {
        ts.parse::<DateTime<chrono::Utc>>().unwrap().timestamp()
    }

    #[test]
    fn filesystem_path_collapses_to_relative_directory() {
        let router = PathRouter::new(Protocol::File, "", "");
        let path = router.route(&PartitionId::new("evt", 3), unix("2025-12-18T09:30:00Z"), "1.0");
        assert_eq!(path, "evt/v10/dt=2025-12-18/pid=3/");
    }

    #[test]
    fn object_store_path_carries_protocol_and_bucket() {
        let router = PathRouter::new(Protocol::S3, "archive", "raw/events");
        let path = router.route(&PartitionId::new("evt", 0), unix("2025-12-18T09:30:00Z"), "1.0");
        assert_eq!(path, "s3://archive/raw/events/evt/v10/dt=2025-12-18/pid=0/");
    }

    #[test]
    fn version_segment_strips_dots() {
        let router = PathRouter::new(Protocol::File, "", "");
        assert_eq!(router.version_segment("1.0"), "v10");
        assert_eq!(router.version_segment("1.1"), "v11");
        assert_eq!(router.version_segment("2.0.0"), "v200");
        assert_eq!(router.version_segment(""), "v1");
    }

    #[test]
    fn empty_version_uses_router_default() {
        let router = PathRouter::new(Protocol::File, "", "").with_default_version("v9");
        let path = router.route(&PartitionId::new("evt", 1), unix("2025-12-18T09:30:00Z"), "");
        assert_eq!(path, "evt/v9/dt=2025-12-18/pid=1/");
    }

    #[test]
    fn date_uses_event_time_in_utc() {
        let router = PathRouter::new(Protocol::Gs, "bkt", "");
        // 23:30 UTC on the 17th, no local-time drift allowed.
        let path = router.route(&PartitionId::new("evt", 2), unix("2025-12-17T23:30:00Z"), "1.0");
        assert_eq!(path, "gs://bkt/evt/v10/dt=2025-12-17/pid=2/");
    }

    #[test]
    fn route_is_deterministic() {
        let router = PathRouter::new(Protocol::Wasbs, "container", "base");
        let id = PartitionId::new("evt", 7);
        let ts = unix("2025-12-18T09:30:00Z");
        assert_eq!(router.route(&id, ts, "1.1"), router.route(&id, ts, "1.1"));
    }
}
