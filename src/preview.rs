use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// Handle to an in-memory image registered for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewUrl(String);

impl PreviewUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct PreviewEntry {
    mime_type: String,
    bytes: Arc<Vec<u8>>,
}

/// Registry of displayable previews. Every `create` must be paired with a
/// `revoke`; `outstanding` reports how many are still alive.
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    entries: Arc<Mutex<HashMap<PreviewUrl, PreviewEntry>>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PreviewUrl, PreviewEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create(&self, bytes: Vec<u8>, mime_type: &str) -> PreviewUrl {
        let url = PreviewUrl(format!("blob:tryon/{}", Uuid::new_v4()));
        self.entries().insert(
            url.clone(),
            PreviewEntry {
                mime_type: mime_type.to_string(),
                bytes: Arc::new(bytes),
            },
        );
        log::debug!("Created preview {}", url);
        url
    }

    /// Release a preview. Returns `false` if it was already released.
    pub fn revoke(&self, url: &PreviewUrl) -> bool {
        let removed = self.entries().remove(url).is_some();
        if removed {
            log::debug!("Revoked preview {}", url);
        }
        removed
    }

    pub fn get(&self, url: &PreviewUrl) -> Option<(String, Arc<Vec<u8>>)> {
        self.entries()
            .get(url)
            .map(|entry| (entry.mime_type.clone(), Arc::clone(&entry.bytes)))
    }

    pub fn is_live(&self, url: &PreviewUrl) -> bool {
        self.entries().contains_key(url)
    }

    pub fn outstanding(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_revoke() {
        let registry = PreviewRegistry::new();
        let url = registry.create(vec![1, 2, 3], "image/jpeg");

        assert!(url.as_str().starts_with("blob:tryon/"));
        assert_eq!(registry.outstanding(), 1);
        let (mime, bytes) = registry.get(&url).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes.as_slice(), &[1, 2, 3]);

        assert!(registry.revoke(&url));
        assert!(!registry.revoke(&url));
        assert_eq!(registry.outstanding(), 0);
        assert!(registry.get(&url).is_none());
    }

    #[test]
    fn test_urls_are_unique() {
        let registry = PreviewRegistry::new();
        let a = registry.create(vec![], "image/jpeg");
        let b = registry.create(vec![], "image/jpeg");
        assert_ne!(a, b);
        assert_eq!(registry.outstanding(), 2);
    }
}
