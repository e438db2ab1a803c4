//! Wire-level pieces of the streaming protocol: request paths and bodies,
//! line tokens, frame classification and handshake metadata.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::stream::StreamError;

pub const CONNECT_PATH: &str = "/lightstreamer/create_session.txt";
pub const BIND_PATH: &str = "/lightstreamer/bind_session.txt";
pub const CONTROL_PATH: &str = "/lightstreamer/control.txt";

pub const OK_TOKEN: &str = "OK";
pub const ERROR_TOKEN: &str = "ERROR";
pub const PROBE_TOKEN: &str = "PROBE";
pub const LOOP_TOKEN: &str = "LOOP";
pub const SYNC_ERROR_TOKEN: &str = "SYNC ERROR";
pub const END_TOKEN: &str = "END";
pub const PREAMBLE_TOKEN: &str = "Preamble";

/// Metadata key carrying the session id assigned by the server.
pub const SESSION_ID_KEY: &str = "SessionId";
/// Metadata key overriding the host used for control and bind requests.
pub const CONTROL_ADDRESS_KEY: &str = "ControlAddress";

const OP_ADD: &str = "add";

/// Category of one line read from the stream body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    Ok,
    Error,
    Probe,
    Loop,
    SyncError,
    End,
    Preamble,
    Data,
}

/// Classifies a single stream line by literal prefix.
///
/// Anything that does not start with a known token is a data update.
pub fn classify(line: &str) -> Frame {
    if line.starts_with(PROBE_TOKEN) {
        Frame::Probe
    } else if line.starts_with(ERROR_TOKEN) {
        Frame::Error
    } else if line.starts_with(SYNC_ERROR_TOKEN) {
        Frame::SyncError
    } else if line.starts_with(LOOP_TOKEN) {
        Frame::Loop
    } else if line.starts_with(END_TOKEN) {
        Frame::End
    } else if line.starts_with(PREAMBLE_TOKEN) {
        Frame::Preamble
    } else if line.starts_with(OK_TOKEN) {
        Frame::Ok
    } else {
        Frame::Data
    }
}

/// Push mode requested for a subscription. Opaque to this crate beyond
/// pass-through to the control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Merge,
    Distinct,
    Raw,
}

impl SubscriptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Distinct => "DISTINCT",
            Self::Raw => "RAW",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Form body for `create_session.txt`.
pub fn connect_form(
    adapter_set: &str,
    account_id: &str,
    session_token: &SecretString,
    security_token: &SecretString,
) -> Vec<(&'static str, String)> {
    vec![
        ("LS_adapter_set", adapter_set.to_string()),
        ("LS_user", account_id.to_string()),
        (
            "LS_password",
            format!(
                "CST-{}|XST-{}",
                session_token.expose_secret(),
                security_token.expose_secret()
            ),
        ),
    ]
}

/// Form body for `bind_session.txt`.
pub fn bind_form(session_id: &str) -> Vec<(&'static str, String)> {
    vec![("LS_session", session_id.to_string())]
}

/// Form body for a `control.txt` subscribe request.
pub fn subscribe_form(
    session_id: &str,
    table: u32,
    mode: SubscriptionMode,
    fields: &[String],
    items: &[String],
) -> Vec<(&'static str, String)> {
    vec![
        ("LS_session", session_id.to_string()),
        ("LS_Table", table.to_string()),
        ("LS_op", OP_ADD.to_string()),
        ("LS_mode", mode.as_str().to_string()),
        ("LS_schema", fields.join(" ")),
        ("LS_id", items.join(" ")),
    ]
}

/// Ordered `key:value` block following the `OK` line of a handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeMetadata {
    entries: Vec<(String, String)>,
}

impl HandshakeMetadata {
    /// Parses one metadata line. Values may themselves contain `:`.
    pub fn push_line(&mut self, line: &str) -> Result<(), StreamError> {
        let (key, value) = line.split_once(':').ok_or_else(|| {
            StreamError::Protocol(format!("handshake metadata line without ':': {line}"))
        })?;
        self.entries.push((key.to_string(), value.to_string()));
        Ok(())
    }

    /// Returns the last value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get(SESSION_ID_KEY)
    }

    pub fn control_address(&self) -> Option<&str> {
        self.get(CONTROL_ADDRESS_KEY)
    }

    /// Appends `other`'s entries; its keys take precedence in [`Self::get`].
    pub fn merge(&mut self, other: HandshakeMetadata) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves the control endpoint: a `ControlAddress` override is prefixed
/// with `scheme`, otherwise the stream endpoint is reused.
pub fn resolve_control_endpoint(
    metadata: &HandshakeMetadata,
    stream_endpoint: &str,
    scheme: &str,
) -> String {
    match metadata.control_address() {
        Some(address) => format!("{scheme}://{address}"),
        None => stream_endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{
        classify, connect_form, resolve_control_endpoint, subscribe_form, Frame,
        HandshakeMetadata, SubscriptionMode,
    };

    #[test]
    fn classifies_control_tokens() {
        assert_eq!(classify("OK"), Frame::Ok);
        assert_eq!(classify("ERROR"), Frame::Error);
        assert_eq!(classify("ERROR 2 session not found"), Frame::Error);
        assert_eq!(classify("PROBE"), Frame::Probe);
        assert_eq!(classify("LOOP"), Frame::Loop);
        assert_eq!(classify("LOOP\nfoo"), Frame::Loop);
        assert_eq!(classify("SYNC ERROR"), Frame::SyncError);
        assert_eq!(classify("END"), Frame::End);
        assert_eq!(classify("END 31 server shutdown"), Frame::End);
        assert_eq!(classify("Preamble: padding"), Frame::Preamble);
    }

    #[test]
    fn everything_else_is_data() {
        assert_eq!(classify("1,3|a|b"), Frame::Data);
        assert_eq!(classify(""), Frame::Data);
        assert_eq!(classify("probe"), Frame::Data);
    }

    #[test]
    fn handshake_metadata_resolves_control_address() {
        let mut metadata = HandshakeMetadata::default();
        for line in ["ControlAddress:host2", "SessionId:abc123"] {
            metadata.push_line(line).expect("metadata line");
        }

        assert_eq!(metadata.session_id(), Some("abc123"));
        assert_eq!(
            resolve_control_endpoint(&metadata, "https://stream.example", "https"),
            "https://host2"
        );
    }

    #[test]
    fn control_endpoint_defaults_to_stream_endpoint() {
        let mut metadata = HandshakeMetadata::default();
        metadata.push_line("SessionId:S1").expect("metadata line");
        assert_eq!(
            resolve_control_endpoint(&metadata, "https://stream.example", "https"),
            "https://stream.example"
        );
    }

    #[test]
    fn metadata_values_keep_embedded_colons() {
        let mut metadata = HandshakeMetadata::default();
        metadata
            .push_line("ControlAddress:host2:8443")
            .expect("metadata line");
        assert_eq!(metadata.control_address(), Some("host2:8443"));
    }

    #[test]
    fn merged_metadata_prefers_later_values() {
        let mut connect = HandshakeMetadata::default();
        connect.push_line("SessionId:S1").expect("metadata line");
        connect.push_line("ControlAddress:host2").expect("metadata line");
        let mut bind = HandshakeMetadata::default();
        bind.push_line("ControlAddress:host3").expect("metadata line");

        connect.merge(bind);
        assert_eq!(connect.session_id(), Some("S1"));
        assert_eq!(connect.control_address(), Some("host3"));
    }

    #[test]
    fn metadata_line_without_separator_is_rejected() {
        let mut metadata = HandshakeMetadata::default();
        assert!(metadata.push_line("garbage").is_err());
    }

    #[test]
    fn connect_form_formats_password_from_tokens() {
        let form = connect_form(
            "DEFAULT",
            "ABC123",
            &SecretString::new("cst".to_string()),
            &SecretString::new("xst".to_string()),
        );
        assert_eq!(form[1], ("LS_user", "ABC123".to_string()));
        assert_eq!(form[2], ("LS_password", "CST-cst|XST-xst".to_string()));
    }

    #[test]
    fn subscribe_form_joins_schema_and_items_with_spaces() {
        let form = subscribe_form(
            "S1",
            2,
            SubscriptionMode::Merge,
            &["BID".to_string(), "OFFER".to_string()],
            &["MARKET:A".to_string(), "MARKET:B".to_string()],
        );
        assert_eq!(
            form,
            vec![
                ("LS_session", "S1".to_string()),
                ("LS_Table", "2".to_string()),
                ("LS_op", "add".to_string()),
                ("LS_mode", "MERGE".to_string()),
                ("LS_schema", "BID OFFER".to_string()),
                ("LS_id", "MARKET:A MARKET:B".to_string()),
            ]
        );
    }
}
