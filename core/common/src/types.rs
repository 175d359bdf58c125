//! Common types used throughout PhantomVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Characters that may never appear in an identifier. Ids end up in
/// directory names, so separators and parent references are rejected.
fn validate_id(kind: &str, id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if id.contains('/') || id.contains('\\') || id == "." || id == ".." || id.contains('\0') {
        return Err(crate::Error::InvalidInput(format!(
            "{} contains invalid characters: {}",
            kind, id
        )));
    }
    Ok(())
}

/// Unique identifier for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a new ProfileId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains path separators
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_id("ProfileId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProfileId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a folder under vault management.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FolderId(String);

impl FolderId {
    /// Create a new FolderId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains path separators
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_id("FolderId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FolderId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<FolderId> for String {
    fn from(id: FolderId) -> Self {
        id.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an unlocked folder is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlockMode {
    /// Restored to its original location, expected to be re-locked.
    Temporary,
    /// Restored and removed from vault management.
    Permanent,
}

impl UnlockMode {
    /// Wire name used in metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockMode::Temporary => "temporary",
            UnlockMode::Permanent => "permanent",
        }
    }
}

impl fmt::Display for UnlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnlockMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "temporary" => Ok(UnlockMode::Temporary),
            "permanent" => Ok(UnlockMode::Permanent),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown unlock mode: {}",
                other
            ))),
        }
    }
}

/// Tag describing why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationTag {
    /// Vault copy taken as a folder is locked.
    #[serde(rename = "pre-lock")]
    PreLock,
    /// Encrypted vault copy taken before unlocking.
    #[serde(rename = "pre-unlock")]
    PreUnlock,
    /// Encrypted vault copy taken before re-encryption under a new key.
    #[serde(rename = "pre-rekey")]
    PreRekey,
    /// Encrypted vault copy taken before restoring from an older backup.
    #[serde(rename = "pre-restore")]
    PreRestore,
}

impl OperationTag {
    /// Wire name used in metadata and backup directory names.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTag::PreLock => "pre-lock",
            OperationTag::PreUnlock => "pre-unlock",
            OperationTag::PreRekey => "pre-rekey",
            OperationTag::PreRestore => "pre-restore",
        }
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationTag {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pre-lock" => Ok(OperationTag::PreLock),
            "pre-unlock" => Ok(OperationTag::PreUnlock),
            "pre-rekey" => Ok(OperationTag::PreRekey),
            "pre-restore" => Ok(OperationTag::PreRestore),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation tag: {}",
                other
            ))),
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SensitiveBytes {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for SensitiveBytes {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_id_creation() {
        let id = ProfileId::new("profile_1_abcd").unwrap();
        assert_eq!(id.as_str(), "profile_1_abcd");
    }

    #[test]
    fn test_ids_reject_empty_and_separators() {
        assert!(ProfileId::new("").is_err());
        assert!(FolderId::new("a/b").is_err());
        assert!(FolderId::new("..").is_err());
        assert!(FolderId::new("a\\b").is_err());
    }

    #[test]
    fn test_id_serde_rejects_invalid() {
        let ok: FolderId = serde_json::from_str("\"folder_1\"").unwrap();
        assert_eq!(ok.as_str(), "folder_1");
        assert!(serde_json::from_str::<FolderId>("\"../x\"").is_err());
    }

    #[test]
    fn test_unlock_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&UnlockMode::Temporary).unwrap(),
            "\"temporary\""
        );
        assert_eq!("permanent".parse::<UnlockMode>().unwrap(), UnlockMode::Permanent);
        assert!("forever".parse::<UnlockMode>().is_err());
    }

    #[test]
    fn test_operation_tag_wire_names() {
        assert_eq!(serde_json::to_string(&OperationTag::PreLock).unwrap(), "\"pre-lock\"");
        assert_eq!("pre-unlock".parse::<OperationTag>().unwrap(), OperationTag::PreUnlock);
    }

    #[test]
    fn test_sensitive_bytes_debug_redacts() {
        let s = SensitiveBytes::from("hunter2");
        assert_eq!(format!("{:?}", s), "SensitiveBytes([REDACTED; 7 bytes])");
    }
}
