//! Software product store and identification heuristics.
//!
//! Products are deduplicated by `product/version`; repeat sightings extend
//! the device-profile and flow sets of the existing entry. Identification
//! draws from HTTP headers (User-Agent, Server, X-Powered-By), CMS
//! fingerprints, SSH idents, HASSH lookups and a generic version
//! harvester applied to raw payloads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::resolvers::Resolvers;
use crate::types::{Exploit, Record, Software, Vulnerability};

/// Versions longer than this were almost certainly produced by a regex
/// matching too much text.
const MAX_VERSION_LEN: usize = 10;

pub const SERVICE_HTTP: &str = "HTTP";
pub const SERVICE_SSH: &str = "SSH";
pub const SERVICE_POP3: &str = "POP3";

/// Parsed User-Agent header.
#[derive(Debug, Clone, Default)]
pub struct UserAgentInfo {
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub os: String,
    pub full: String,
}

/// Thread-safe software product store.
pub struct SoftwareStore {
    items: Mutex<HashMap<String, Software>>,
    resolvers: Arc<Resolvers>,
    ua_cache: Mutex<HashMap<String, UserAgentInfo>>,
    cms_regex_cache: Mutex<HashMap<String, Option<Regex>>>,
    re_server_name: Regex,
    re_x_powered_by: Regex,
    re_generic_version: Regex,
    re_ua_token: Regex,
}

impl SoftwareStore {
    pub fn new(resolvers: Arc<Resolvers>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            resolvers,
            ua_cache: Mutex::new(HashMap::new()),
            cms_regex_cache: Mutex::new(HashMap::new()),
            re_server_name: Regex::new(r"^(.*?)(?:/(.*?))?\s*(?:\((.*?)\))?$")
                .expect("static regex"),
            re_x_powered_by: Regex::new(r"^(.*?)(?:[\s/](.*?))?$").expect("static regex"),
            re_generic_version: Regex::new(r"(?m)^(.*?)(\d+)\.(\d+)\.(\d+)(.*?)$")
                .expect("static regex"),
            re_ua_token: Regex::new(r"([A-Za-z][\w.-]*)/([0-9][\w.]*)").expect("static regex"),
        }
    }

    /// Number of distinct `product/version` entries.
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Register observations; returns the products that were new. Existing
    /// entries get their device-profile and flow sets extended.
    pub fn register(&self, observations: Vec<Software>) -> Vec<Software> {
        let mut new_products = Vec::new();
        let mut items = self.items.lock();

        for mut soft in observations {
            if soft.product.is_empty() && soft.notes.is_empty() {
                continue;
            }
            if soft.version.len() > MAX_VERSION_LEN {
                soft.version.truncate(MAX_VERSION_LEN);
                soft.version.push_str("...");
            }

            let ident = soft.ident();
            match items.get_mut(&ident) {
                Some(existing) => {
                    for dp in soft.device_profiles {
                        if !existing.device_profiles.contains(&dp) {
                            existing.device_profiles.push(dp);
                        }
                    }
                    for flow in soft.flows {
                        if !existing.flows.contains(&flow) {
                            existing.flows.push(flow);
                        }
                    }
                }
                None => {
                    debug!(ident = %ident, source = %soft.source_name, "new software product");
                    items.insert(ident, soft.clone());
                    new_products.push(soft);
                }
            }
        }

        new_products
    }

    /// Vulnerability and exploit records for a newly observed product.
    pub fn lookup_known_issues(&self, soft: &Software) -> Vec<Record> {
        let mut records = Vec::new();
        for v in self
            .resolvers
            .lookup_vulnerabilities(&soft.product, &soft.version)
        {
            records.push(
                Vulnerability {
                    timestamp: soft.timestamp.clone(),
                    id: v.id.clone(),
                    description: v.description.clone(),
                    software: soft.product.clone(),
                    version: soft.version.clone(),
                    severity: v.severity.clone(),
                    notes: String::new(),
                }
                .into(),
            );
        }
        for e in self.resolvers.lookup_exploits(&soft.product, &soft.version) {
            records.push(
                Exploit {
                    timestamp: soft.timestamp.clone(),
                    id: e.id.clone(),
                    description: e.description.clone(),
                    software: soft.product.clone(),
                    version: soft.version.clone(),
                    source_file: e.file.clone(),
                    notes: String::new(),
                }
                .into(),
            );
        }
        records
    }

    /// Snapshot all products as audit records (shutdown flush).
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .items
            .lock()
            .values()
            .cloned()
            .map(Record::Software)
            .collect();
        records.sort_by(|a, b| match (a, b) {
            (Record::Software(x), Record::Software(y)) => x.ident().cmp(&y.ident()),
            _ => std::cmp::Ordering::Equal,
        });
        records
    }

    // =========================================================================
    // Identification heuristics
    // =========================================================================

    /// Parse a raw User-Agent string; results are cached per string.
    pub fn parse_user_agent(&self, ua: &str) -> UserAgentInfo {
        if let Some(cached) = self.ua_cache.lock().get(ua) {
            return cached.clone();
        }

        let info = self.parse_user_agent_uncached(ua);
        self.ua_cache.lock().insert(ua.to_string(), info.clone());
        info
    }

    fn parse_user_agent_uncached(&self, ua: &str) -> UserAgentInfo {
        // token preference: real browsers and tools before engine tokens
        const PREFERRED: &[&str] = &[
            "Firefox", "Edg", "Edge", "OPR", "Opera", "Chrome", "Safari", "MSIE", "curl",
            "Wget", "okhttp", "python-requests", "Go-http-client",
        ];

        let mut tokens: Vec<(String, String)> = Vec::new();
        for cap in self.re_ua_token.captures_iter(ua) {
            tokens.push((cap[1].to_string(), cap[2].to_string()));
        }

        let mut product = String::new();
        let mut version = String::new();
        for pref in PREFERRED {
            if let Some((p, v)) = tokens.iter().find(|(p, _)| p == pref) {
                product = p.clone();
                version = v.clone();
                break;
            }
        }
        // Safari's version lives in the separate Version/ token
        if product == "Safari" {
            if let Some((_, v)) = tokens.iter().find(|(p, _)| p == "Version") {
                version = v.clone();
            }
        }
        if product.is_empty() {
            if let Some((p, v)) = tokens.first() {
                product = p.clone();
                version = v.clone();
            }
        }

        let os = if let Some(open) = ua.find('(') {
            let inner = &ua[open + 1..ua.find(')').unwrap_or(ua.len())];
            if inner.contains("Windows") {
                "Windows"
            } else if inner.contains("Mac OS X") || inner.contains("Macintosh") {
                "macOS"
            } else if inner.contains("Android") {
                "Android"
            } else if inner.contains("iPhone") || inner.contains("iPad") {
                "iOS"
            } else if inner.contains("Linux") {
                "Linux"
            } else {
                ""
            }
        } else {
            ""
        }
        .to_string();

        let vendor = match product.as_str() {
            "Chrome" | "Android" => "Google",
            "Firefox" => "Mozilla",
            "MSIE" | "Edge" | "Edg" => "Microsoft",
            "Safari" => "Apple",
            "OPR" | "Opera" => "Opera",
            _ => "",
        }
        .to_string();

        UserAgentInfo {
            full: format!("{} {} {}", product, version, os).trim().to_string(),
            product,
            vendor,
            version,
            os,
        }
    }

    /// Software observation from a User-Agent header.
    pub fn from_user_agent(&self, ts: &str, flow: &str, ua: &str) -> Option<Software> {
        if ua.trim().is_empty() {
            return None;
        }
        let info = self.parse_user_agent(ua);
        Some(Software {
            timestamp: ts.to_string(),
            product: info.product,
            vendor: info.vendor,
            version: info.version,
            source_name: "UserAgent".into(),
            source_data: ua.to_string(),
            service: SERVICE_HTTP.into(),
            flows: vec![flow.to_string()],
            notes: info.full,
            ..Default::default()
        })
    }

    /// Software observation from a Server header, e.g.
    /// `Apache/2.4.41 (Ubuntu)`.
    pub fn from_server_name(&self, ts: &str, flow: &str, server_name: &str) -> Option<Software> {
        if server_name.trim().is_empty() {
            return None;
        }
        let caps = self.re_server_name.captures(server_name)?;
        let product = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let version = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let os = caps.get(3).map(|m| m.as_str()).unwrap_or("");

        Some(Software {
            timestamp: ts.to_string(),
            product: product.to_string(),
            version: version.to_string(),
            source_name: "ServerName".into(),
            source_data: server_name.to_string(),
            service: SERVICE_HTTP.into(),
            flows: vec![flow.to_string()],
            notes: if os.is_empty() {
                String::new()
            } else {
                format!("Maybe OS: {}", os)
            },
            ..Default::default()
        })
    }

    /// Software observation from an X-Powered-By header, e.g. `PHP/7.4.3`.
    pub fn from_x_powered_by(&self, ts: &str, flow: &str, value: &str) -> Option<Software> {
        if value.trim().is_empty() {
            return None;
        }
        let caps = self.re_x_powered_by.captures(value)?;
        Some(Software {
            timestamp: ts.to_string(),
            product: caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
            version: caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
            source_name: "X-Powered-By".into(),
            source_data: value.to_string(),
            service: SERVICE_HTTP.into(),
            flows: vec![flow.to_string()],
            ..Default::default()
        })
    }

    /// Match collected response headers and cookies against the CMS
    /// fingerprint database.
    pub fn from_cms_fingerprints(
        &self,
        ts: &str,
        flow: &str,
        headers: &[(String, String)],
        cookies: &[(String, String)],
    ) -> Vec<Software> {
        let mut found = Vec::new();

        for (product, fp) in self.resolvers.cms_fingerprints() {
            let header_hit = fp.headers.iter().any(|(name, pattern)| {
                headers.iter().any(|(h_name, h_value)| {
                    h_name.eq_ignore_ascii_case(name) && self.cms_value_matches(pattern, h_value)
                })
            });
            let cookie_hit = fp.cookies.iter().any(|(name, pattern)| {
                cookies.iter().any(|(c_name, c_value)| {
                    c_name == name && self.cms_value_matches(pattern, c_value)
                })
            });

            if header_hit || cookie_hit {
                found.push(Software {
                    timestamp: ts.to_string(),
                    product: product.clone(),
                    source_name: "CMS Fingerprint".into(),
                    service: SERVICE_HTTP.into(),
                    flows: vec![flow.to_string()],
                    ..Default::default()
                });
            }
        }

        found.sort_by(|a, b| a.product.cmp(&b.product));
        found
    }

    fn cms_value_matches(&self, pattern: &str, value: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        let mut cache = self.cms_regex_cache.lock();
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid CMS fingerprint regex");
                    None
                }
            }
        });
        compiled.as_ref().map(|re| re.is_match(value)).unwrap_or(false)
    }

    /// Software observations for a HASSH digest known in the local
    /// fingerprint database.
    pub fn from_hassh(&self, ts: &str, flow: &str, hash: &str) -> Vec<Software> {
        self.resolvers
            .lookup_hassh(hash)
            .iter()
            .map(|entry| Software {
                timestamp: ts.to_string(),
                product: entry.product.clone(),
                version: entry.version.clone(),
                source_name: "HASSH Lookup".into(),
                source_data: hash.to_string(),
                service: SERVICE_SSH.into(),
                flows: vec![flow.to_string()],
                notes: format!("Likelihood: {} Possible OS: {}", entry.likelihood, entry.os),
                ..Default::default()
            })
            .collect()
    }

    /// Generic version harvester: scan a payload for `x.y.z` version
    /// strings when no structured source identified anything.
    pub fn harvest_versions(
        &self,
        data: &[u8],
        ts: &str,
        flow: &str,
        service: &str,
    ) -> Vec<Software> {
        let text = String::from_utf8_lossy(data);
        self.re_generic_version
            .find_iter(&text)
            .take(16)
            .map(|m| Software {
                timestamp: ts.to_string(),
                source_name: "Generic version harvester".into(),
                service: service.to_string(),
                flows: vec![flow.to_string()],
                notes: m.as_str().trim().to_string(),
                ..Default::default()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SoftwareStore {
        SoftwareStore::new(Arc::new(Resolvers::embedded()))
    }

    #[test]
    fn test_server_name_parsing() {
        let s = store();
        let soft = s
            .from_server_name("1.0", "f", "Apache/2.4.41 (Ubuntu)")
            .unwrap();
        assert_eq!(soft.product, "Apache");
        assert_eq!(soft.version, "2.4.41");
        assert_eq!(soft.source_name, "ServerName");
        assert!(soft.notes.contains("Ubuntu"));
    }

    #[test]
    fn test_server_name_without_version() {
        let s = store();
        let soft = s.from_server_name("1.0", "f", "nginx").unwrap();
        assert_eq!(soft.product, "nginx");
        assert_eq!(soft.version, "");
    }

    #[test]
    fn test_x_powered_by_parsing() {
        let s = store();
        let soft = s.from_x_powered_by("1.0", "f", "PHP/7.4.3").unwrap();
        assert_eq!(soft.product, "PHP");
        assert_eq!(soft.version, "7.4.3");
    }

    #[test]
    fn test_user_agent_chrome() {
        let s = store();
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/90.0.4430.212 Safari/537.36";
        let info = s.parse_user_agent(ua);
        assert_eq!(info.product, "Chrome");
        assert_eq!(info.vendor, "Google");
        assert!(info.version.starts_with("90.0"));
        assert_eq!(info.os, "Windows");
    }

    #[test]
    fn test_user_agent_curl() {
        let s = store();
        let info = s.parse_user_agent("curl/7.68.0");
        assert_eq!(info.product, "curl");
        assert_eq!(info.version, "7.68.0");
    }

    #[test]
    fn test_dedup_by_product_version() {
        let s = store();
        let obs = |flow: &str| Software {
            timestamp: "1.0".into(),
            product: "Apache".into(),
            version: "2.4.41".into(),
            source_name: "ServerName".into(),
            flows: vec![flow.into()],
            device_profiles: vec!["aa:bb <X>".into()],
            ..Default::default()
        };

        let new1 = s.register(vec![obs("flow1")]);
        assert_eq!(new1.len(), 1);
        let new2 = s.register(vec![obs("flow2")]);
        assert!(new2.is_empty());
        assert_eq!(s.size(), 1);

        let records = s.snapshot();
        match &records[0] {
            Record::Software(soft) => {
                assert_eq!(soft.flows, vec!["flow1", "flow2"]);
                assert_eq!(soft.device_profiles.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_version_runaway_guard() {
        let s = store();
        let new = s.register(vec![Software {
            product: "X".into(),
            version: "1.0.0-extremely-long-version-string".into(),
            ..Default::default()
        }]);
        assert_eq!(new[0].version, "1.0.0-extr...");
    }

    #[test]
    fn test_cms_fingerprint_match() {
        let s = store();
        let headers = vec![("X-Drupal-Cache".to_string(), "HIT".to_string())];
        let found = s.from_cms_fingerprints("1.0", "f", &headers, &[]);
        assert!(found.iter().any(|soft| soft.product == "Drupal"));
    }

    #[test]
    fn test_generic_version_harvester() {
        let s = store();
        let found = s.harvest_versions(b"welcome to ProFTPD 1.3.5e Server", "1.0", "f", "FTP");
        assert_eq!(found.len(), 1);
        assert!(found[0].notes.contains("1.3.5"));
    }
}
