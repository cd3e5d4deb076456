use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const MIN_FIELDS: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PersistedDataError {
    #[error("expected at least {MIN_FIELDS} fields, found {0}")]
    TooFewFields(usize),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Snapshot of a running instance, handed to the next controller of a profile.
///
/// Encoded as `instanceId|imageId|namespace|host|port|isLegacy|originalImageId`.
/// The last two fields are optional when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedInstanceData {
    pub instance_id: String,
    pub image_id: String,
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub is_legacy: bool,
    pub original_image_id: Option<String>,
}

impl PersistedInstanceData {
    /// Re-targets the snapshot at `new_image_id`, remembering the image it came from.
    pub fn as_legacy(&self, new_image_id: &str) -> Self {
        let original = self
            .original_image_id
            .clone()
            .unwrap_or_else(|| self.image_id.clone());
        Self {
            image_id: new_image_id.to_string(),
            is_legacy: true,
            original_image_id: Some(original),
            ..self.clone()
        }
    }
}

impl fmt::Display for PersistedInstanceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}",
            self.instance_id,
            self.image_id,
            self.namespace,
            self.host,
            self.port,
            self.is_legacy,
            self.original_image_id.as_deref().unwrap_or("")
        )
    }
}

impl FromStr for PersistedInstanceData {
    type Err = PersistedDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() < MIN_FIELDS {
            return Err(PersistedDataError::TooFewFields(parts.len()));
        }

        let port = match parts[4].trim() {
            "" => 0,
            raw => raw
                .parse()
                .map_err(|_| PersistedDataError::InvalidPort(raw.to_string()))?,
        };

        Ok(Self {
            instance_id: parts[0].to_string(),
            image_id: parts[1].to_string(),
            namespace: parts[2].to_string(),
            host: parts[3].to_string(),
            port,
            is_legacy: parts.get(5).map_or(false, |v| v.eq_ignore_ascii_case("true")),
            original_image_id: parts
                .get(6)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string()),
        })
    }
}
