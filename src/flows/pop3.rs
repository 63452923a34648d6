//! POP3 flow reader: credential harvesting from cleartext mailbox logins.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::profile::SERVICE_POP3;
use crate::reassembly::{ConnectionSummary, Direction, StreamDecoder, StreamFragment};
use crate::types::Credentials;

use super::{direction_bytes, FlowContext};

/// Stateful POP3 reader for one connection.
pub struct Pop3Reader {
    ctx: Arc<FlowContext>,
}

impl Pop3Reader {
    pub fn new(ctx: Arc<FlowContext>) -> Self {
        Self { ctx }
    }

    fn write_credentials(&self, summary: &ConnectionSummary, user: String, password: String, notes: &str) {
        if user.is_empty() && password.is_empty() {
            return;
        }
        self.ctx.sinks.write(
            &Credentials {
                timestamp: summary.timestamp.clone(),
                service: SERVICE_POP3.into(),
                flow: summary.ident.clone(),
                user,
                password,
                notes: notes.to_string(),
            }
            .into(),
        );
    }
}

impl StreamDecoder for Pop3Reader {
    fn decode(&mut self, summary: &ConnectionSummary, fragments: &[StreamFragment]) {
        let client = direction_bytes(fragments, Direction::ClientToServer, 0);
        let text = String::from_utf8_lossy(&client);

        let mut user = String::new();
        let mut expect_auth_plain = false;

        for line in text.split("\r\n") {
            let line = line.trim();

            if expect_auth_plain {
                expect_auth_plain = false;
                if let Some((u, p)) = decode_auth_plain(line) {
                    self.write_credentials(summary, u, p, "AUTH PLAIN");
                    continue;
                }
            }

            let upper = line.to_ascii_uppercase();
            if let Some(value) = line.get(5..) {
                if upper.starts_with("USER ") {
                    user = value.trim().to_string();
                    continue;
                }
                if upper.starts_with("PASS ") {
                    let password = value.trim().to_string();
                    self.write_credentials(summary, std::mem::take(&mut user), password, "");
                    continue;
                }
            }

            if upper == "AUTH PLAIN" {
                // credentials follow on the next line
                expect_auth_plain = true;
            } else if upper.starts_with("AUTH PLAIN ") {
                if let Some((u, p)) =
                    line.get(11..).and_then(|b64| decode_auth_plain(b64.trim()))
                {
                    self.write_credentials(summary, u, p, "AUTH PLAIN");
                }
            }
        }
    }
}

// AUTH PLAIN payload: base64("authzid\0authcid\0password").
fn decode_auth_plain(b64: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(b64).ok()?;
    let mut parts = decoded.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let user = String::from_utf8_lossy(parts.next()?).to_string();
    let password = String::from_utf8_lossy(parts.next()?).to_string();
    Some((user, password))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{read_records, test_context};
    use super::*;
    use crate::types::Record;
    use chrono::Utc;

    fn summary() -> ConnectionSummary {
        ConnectionSummary {
            ident: "10.0.0.5:50110->10.0.0.9:110".into(),
            client_ip: "10.0.0.5".parse().unwrap(),
            client_port: 50110,
            server_ip: "10.0.0.9".parse().unwrap(),
            server_port: 110,
            first_packet: Utc::now(),
            timestamp: "1.000000".into(),
            client_skipped: 0,
            server_skipped: 0,
            banner: Vec::new(),
        }
    }

    fn client_stream(text: &str) -> Vec<StreamFragment> {
        vec![StreamFragment {
            direction: Direction::ClientToServer,
            data: text.as_bytes().to_vec(),
            timestamp: Utc::now(),
        }]
    }

    #[test]
    fn test_user_pass_harvested() {
        let dir = std::env::temp_dir().join("netaudit-pop3-userpass");
        std::fs::remove_dir_all(&dir).ok();
        let mut reader = Pop3Reader::new(test_context(&dir));

        reader.decode(
            &summary(),
            &client_stream("USER alice@example.com\r\nPASS hunter2\r\nSTAT\r\n"),
        );

        let records = read_records(&dir, crate::types::RecordType::Credentials);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Credentials(c) => {
                assert_eq!(c.service, "POP3");
                assert_eq!(c.user, "alice@example.com");
                assert_eq!(c.password, "hunter2");
            }
            other => panic!("unexpected {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_auth_plain_harvested() {
        let dir = std::env::temp_dir().join("netaudit-pop3-authplain");
        std::fs::remove_dir_all(&dir).ok();
        let mut reader = Pop3Reader::new(test_context(&dir));

        // \0bob\0secret
        let b64 = BASE64.encode(b"\0bob\0secret");
        reader.decode(
            &summary(),
            &client_stream(&format!("AUTH PLAIN\r\n{}\r\n", b64)),
        );

        let records = read_records(&dir, crate::types::RecordType::Credentials);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Credentials(c) => {
                assert_eq!(c.user, "bob");
                assert_eq!(c.password, "secret");
                assert_eq!(c.notes, "AUTH PLAIN");
            }
            other => panic!("unexpected {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
