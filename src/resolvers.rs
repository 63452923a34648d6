//! Resolver databases: OUI manufacturer lookup, service names, HASSH
//! fingerprints, CMS fingerprints and the vulnerability / exploit indexes.
//!
//! All databases live under a single directory pointed at by the
//! `NETAUDIT_DATA_SOURCE` environment variable (or the config value).
//! Missing files degrade to small embedded defaults so a capture run
//! works out of the box.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable selecting the database directory.
pub const DATA_SOURCE_ENV: &str = "NETAUDIT_DATA_SOURCE";

/// One software product behind a HASSH digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasshSoftware {
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub likelihood: String,
    #[serde(default)]
    pub os: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HasshEntry {
    hash: String,
    software: Vec<HasshSoftware>,
}

/// CMS / web-framework fingerprint: header and cookie names mapped to a
/// value regex (empty string matches any value).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmsFingerprint {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

/// A known-vulnerability index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityEntry {
    pub id: String,
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
}

/// A known-exploit index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploitEntry {
    pub id: String,
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file: String,
}

/// Loaded resolver databases.
pub struct Resolvers {
    oui: HashMap<String, String>,
    tcp_services: HashMap<u16, String>,
    hassh: HashMap<String, Vec<HasshSoftware>>,
    cms: HashMap<String, CmsFingerprint>,
    vulnerabilities: Vec<VulnerabilityEntry>,
    exploits: Vec<ExploitEntry>,
}

impl Resolvers {
    /// Load databases from the given directory, falling back to the
    /// `NETAUDIT_DATA_SOURCE` environment variable, then to embedded
    /// defaults.
    pub fn load(dir: Option<&Path>) -> Self {
        let dir: Option<PathBuf> = dir
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var_os(DATA_SOURCE_ENV).map(PathBuf::from));

        let mut r = Self::embedded();

        let Some(dir) = dir else {
            debug!("no data source directory, using embedded resolver databases");
            return r;
        };

        if let Some(oui) = load_json::<HashMap<String, String>>(&dir.join("oui.json")) {
            r.oui.extend(oui.into_iter().map(|(k, v)| (k.to_lowercase(), v)));
        }
        if let Some(entries) = load_json::<Vec<HasshEntry>>(&dir.join("hasshdb.json")) {
            for e in entries {
                r.hassh.insert(e.hash.to_lowercase(), e.software);
            }
        }
        if let Some(cms) = load_json::<HashMap<String, CmsFingerprint>>(&dir.join("cmsdb.json")) {
            r.cms.extend(cms);
        }
        if let Some(vulns) =
            load_json::<Vec<VulnerabilityEntry>>(&dir.join("vulnerabilities.json"))
        {
            r.vulnerabilities = vulns;
        }
        if let Some(exploits) = load_json::<Vec<ExploitEntry>>(&dir.join("exploits.json")) {
            r.exploits = exploits;
        }

        info!(
            oui = r.oui.len(),
            hassh = r.hassh.len(),
            cms = r.cms.len(),
            vulnerabilities = r.vulnerabilities.len(),
            exploits = r.exploits.len(),
            "resolver databases loaded"
        );
        r
    }

    /// Only the embedded defaults; no filesystem access.
    pub fn embedded() -> Self {
        let mut oui = HashMap::new();
        for (prefix, name) in EMBEDDED_OUI {
            oui.insert((*prefix).to_string(), (*name).to_string());
        }

        let mut tcp_services = HashMap::new();
        for (port, name) in EMBEDDED_TCP_SERVICES {
            tcp_services.insert(*port, (*name).to_string());
        }

        Self {
            oui,
            tcp_services,
            hassh: HashMap::new(),
            cms: embedded_cms(),
            vulnerabilities: Vec::new(),
            exploits: Vec::new(),
        }
    }

    /// Manufacturer for a MAC address, resolved from its OUI prefix.
    pub fn lookup_manufacturer(&self, mac: &str) -> String {
        if mac.len() < 8 {
            return String::new();
        }
        self.oui
            .get(&mac[..8].to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Well-known service name for a TCP server port, used to tag
    /// software observed on flows without a dedicated protocol reader.
    pub fn lookup_service(&self, port: u16) -> String {
        self.tcp_services.get(&port).cloned().unwrap_or_default()
    }

    /// Software products known for a HASSH digest.
    pub fn lookup_hassh(&self, hash: &str) -> &[HasshSoftware] {
        self.hassh
            .get(&hash.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All CMS fingerprints.
    pub fn cms_fingerprints(&self) -> &HashMap<String, CmsFingerprint> {
        &self.cms
    }

    /// Vulnerability index entries matching a product (and version when
    /// the entry pins one).
    pub fn lookup_vulnerabilities(&self, product: &str, version: &str) -> Vec<&VulnerabilityEntry> {
        self.vulnerabilities
            .iter()
            .filter(|v| {
                v.product.eq_ignore_ascii_case(product)
                    && (v.version.is_empty() || v.version == version)
            })
            .collect()
    }

    /// Exploit index entries matching a product (and version when pinned).
    pub fn lookup_exploits(&self, product: &str, version: &str) -> Vec<&ExploitEntry> {
        self.exploits
            .iter()
            .filter(|e| {
                e.product.eq_ignore_ascii_case(product)
                    && (e.version.is_empty() || e.version == version)
            })
            .collect()
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse resolver database");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read resolver database");
            None
        }
    }
}

// A small built-in OUI table covering common virtualization and consumer
// vendors; the full table is loaded from oui.json.
const EMBEDDED_OUI: &[(&str, &str)] = &[
    ("00:00:0c", "Cisco Systems"),
    ("00:05:69", "VMware"),
    ("00:0c:29", "VMware"),
    ("00:50:56", "VMware"),
    ("00:15:5d", "Microsoft Hyper-V"),
    ("00:16:3e", "Xen"),
    ("08:00:27", "PCS Systemtechnik (VirtualBox)"),
    ("52:54:00", "QEMU/KVM"),
    ("00:03:93", "Apple"),
    ("3c:22:fb", "Apple"),
    ("b8:27:eb", "Raspberry Pi Foundation"),
    ("dc:a6:32", "Raspberry Pi Trading"),
    ("f0:9f:c2", "Ubiquiti Networks"),
    ("00:11:32", "Synology"),
    ("18:fd:74", "TP-Link"),
];

const EMBEDDED_TCP_SERVICES: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "domain"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (443, "https"),
    (445, "microsoft-ds"),
    (993, "imaps"),
    (995, "pop3s"),
    (3306, "mysql"),
    (3389, "ms-wbt-server"),
    (5432, "postgresql"),
    (6379, "redis"),
    (8080, "http-alt"),
];

// A compact built-in fingerprint set for widely deployed CMSs and
// frameworks; the full database is loaded from cmsdb.json.
fn embedded_cms() -> HashMap<String, CmsFingerprint> {
    let mut cms = HashMap::new();

    let entry = |headers: &[(&str, &str)], cookies: &[(&str, &str)]| CmsFingerprint {
        headers: headers
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        cookies: cookies
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    };

    cms.insert(
        "Drupal".to_string(),
        entry(&[("X-Drupal-Cache", ""), ("X-Generator", "(?i)drupal")], &[]),
    );
    cms.insert(
        "WordPress".to_string(),
        entry(&[("X-Powered-By", "(?i)wordpress")], &[("wordpress_logged_in", "")]),
    );
    cms.insert(
        "Laravel".to_string(),
        entry(&[], &[("laravel_session", "")]),
    );
    cms.insert(
        "ASP.NET".to_string(),
        entry(&[("X-AspNet-Version", "")], &[("ASP.NET_SessionId", "")]),
    );
    cms.insert(
        "PHP".to_string(),
        entry(&[("X-Powered-By", r"(?i)php")], &[("PHPSESSID", "")]),
    );
    cms.insert(
        "Express".to_string(),
        entry(&[("X-Powered-By", "(?i)express")], &[]),
    );
    cms.insert(
        "Django".to_string(),
        entry(&[], &[("csrftoken", ""), ("django_language", "")]),
    );
    cms.insert(
        "Jenkins".to_string(),
        entry(&[("X-Jenkins", "")], &[]),
    );
    cms.insert(
        "Varnish".to_string(),
        entry(&[("X-Varnish", "")], &[]),
    );
    cms.insert(
        "Cloudflare".to_string(),
        entry(&[("cf-ray", "")], &[("__cfduid", "")]),
    );

    cms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oui_lookup() {
        let r = Resolvers::embedded();
        assert_eq!(r.lookup_manufacturer("00:0c:29:aa:bb:cc"), "VMware");
        assert_eq!(r.lookup_manufacturer("ff:ff:ff:00:00:00"), "");
        assert_eq!(r.lookup_manufacturer("short"), "");
    }

    #[test]
    fn test_service_lookup() {
        let r = Resolvers::embedded();
        assert_eq!(r.lookup_service(443), "https");
        assert_eq!(r.lookup_service(21), "ftp");
        assert_eq!(r.lookup_service(4444), "");
    }

    #[test]
    fn test_embedded_cms_present() {
        let r = Resolvers::embedded();
        assert!(r.cms_fingerprints().contains_key("Drupal"));
        assert!(r.cms_fingerprints().contains_key("WordPress"));
    }

    #[test]
    fn test_vulnerability_matching() {
        let mut r = Resolvers::embedded();
        r.vulnerabilities = vec![
            VulnerabilityEntry {
                id: "CVE-2021-41773".into(),
                product: "Apache".into(),
                version: "2.4.49".into(),
                description: "path traversal".into(),
                severity: "critical".into(),
            },
            VulnerabilityEntry {
                id: "CVE-GENERIC".into(),
                product: "Apache".into(),
                version: String::new(),
                description: String::new(),
                severity: String::new(),
            },
        ];

        assert_eq!(r.lookup_vulnerabilities("apache", "2.4.49").len(), 2);
        assert_eq!(r.lookup_vulnerabilities("Apache", "2.4.41").len(), 1);
        assert!(r.lookup_vulnerabilities("nginx", "1.0").is_empty());
    }
}
