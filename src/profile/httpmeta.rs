//! Process-wide store for interesting HTTP artifacts.
//!
//! Values accumulate deduplicated over the lifetime of a run and never
//! shrink; the collector dumps the tables into the debug log at shutdown.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Meta {
    /// server IP -> observed Server header values
    server_names: HashMap<String, String>,
    /// client IP -> observed User-Agent values
    user_agents: HashMap<String, String>,
    /// server IP -> observed Via header values
    vias: HashMap<String, String>,
    /// server IP -> observed X-Powered-By values
    x_powered_by: HashMap<String, String>,
    /// server IP -> CMS-identifying headers seen
    cms_headers: HashMap<String, Vec<(String, String)>>,
    /// server IP -> CMS-identifying Set-Cookie pairs seen
    cms_cookies: HashMap<String, Vec<(String, String)>>,
}

// Accumulate a value into a `|`-joined dedup string.
fn merge(map: &mut HashMap<String, String>, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    match map.get_mut(key) {
        Some(existing) => {
            if !existing.contains(value) {
                existing.push_str("| ");
                existing.push_str(value);
            }
        }
        None => {
            map.insert(key.to_string(), value.to_string());
        }
    }
}

/// Thread-safe HTTP metadata store.
#[derive(Debug, Default)]
pub struct HttpMetaStore {
    inner: Mutex<Meta>,
}

impl HttpMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_server_name(&self, server_ip: &str, value: &str) {
        merge(&mut self.inner.lock().server_names, server_ip, value);
    }

    pub fn record_user_agent(&self, client_ip: &str, value: &str) {
        merge(&mut self.inner.lock().user_agents, client_ip, value);
    }

    pub fn record_via(&self, server_ip: &str, value: &str) {
        merge(&mut self.inner.lock().vias, server_ip, value);
    }

    pub fn record_x_powered_by(&self, server_ip: &str, value: &str) {
        merge(&mut self.inner.lock().x_powered_by, server_ip, value);
    }

    pub fn record_cms_header(&self, server_ip: &str, name: &str, value: &str) {
        self.inner
            .lock()
            .cms_headers
            .entry(server_ip.to_string())
            .or_default()
            .push((name.to_string(), value.to_string()));
    }

    pub fn record_cms_cookie(&self, server_ip: &str, name: &str, value: &str) {
        self.inner
            .lock()
            .cms_cookies
            .entry(server_ip.to_string())
            .or_default()
            .push((name.to_string(), value.to_string()));
    }

    /// CMS-identifying headers collected for a server IP.
    pub fn cms_headers_for(&self, server_ip: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .cms_headers
            .get(server_ip)
            .cloned()
            .unwrap_or_default()
    }

    /// CMS-identifying cookies collected for a server IP.
    pub fn cms_cookies_for(&self, server_ip: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .cms_cookies
            .get(server_ip)
            .cloned()
            .unwrap_or_default()
    }

    /// Sorted (IP, user agents) rows for the shutdown debug dump.
    pub fn user_agent_rows(&self) -> Vec<(String, String)> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .user_agents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rows.sort();
        rows
    }

    /// Sorted (IP, server names) rows for the shutdown debug dump.
    pub fn server_name_rows(&self) -> Vec<(String, String)> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .server_names
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rows.sort();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_accumulate_deduplicated() {
        let store = HttpMetaStore::new();
        store.record_user_agent("10.0.0.1", "curl/7.68.0");
        store.record_user_agent("10.0.0.1", "curl/7.68.0");
        store.record_user_agent("10.0.0.1", "Wget/1.20");

        let rows = store.user_agent_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, "curl/7.68.0| Wget/1.20");
    }

    #[test]
    fn test_empty_values_ignored() {
        let store = HttpMetaStore::new();
        store.record_server_name("10.0.0.2", "");
        assert!(store.server_name_rows().is_empty());
    }

    #[test]
    fn test_cms_headers_collected() {
        let store = HttpMetaStore::new();
        store.record_cms_header("10.0.0.2", "X-Drupal-Cache", "HIT");
        store.record_cms_header("10.0.0.2", "X-Generator", "Drupal 9");
        assert_eq!(store.cms_headers_for("10.0.0.2").len(), 2);
        assert!(store.cms_headers_for("10.0.0.9").is_empty());
    }
}
