//! Identifiers shared by the service, its trackers and registration attempts.

use std::fmt;

/// Unique identifier for a job monitored by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Names one leadership term of a job's coordinator.
///
/// Two announcements of the same leader instance carry equal tokens; a new
/// election always produces a different one. Tokens are only ever compared
/// for equality, never ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FencingToken(u128);

impl FencingToken {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Where this worker runs; sent along with every registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLocation {
    pub resource_id: String,
    pub host: String,
    pub data_port: u16,
}

impl WorkerLocation {
    pub fn new(resource_id: impl Into<String>, host: impl Into<String>, data_port: u16) -> Self {
        Self {
            resource_id: resource_id.into(),
            host: host.into(),
            data_port,
        }
    }
}

impl fmt::Display for WorkerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.resource_id, self.host, self.data_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_token_displays_as_fixed_width_hex() {
        let token = FencingToken::from_u128(0xabc);
        assert_eq!(token.to_string(), format!("{:0>32}", "abc"));
        assert_eq!(token.as_u128(), 0xabc);
    }

    #[test]
    fn worker_location_display() {
        let location = WorkerLocation::new("tm-1", "10.0.0.7", 6121);
        assert_eq!(location.to_string(), "tm-1@10.0.0.7:6121");
    }
}
