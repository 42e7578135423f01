//! Change message wire format
//!
//! The same JSON document is sent as a WebSocket text frame by the channel
//! owner and written as a mailbox entry by followers:
//!
//! ```json
//! {"action":"onchange","data":{"script":"<contents>","uri":"file:///..."}}
//! ```

use std::path::Path;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

/// Action name carried by every change message
pub const ON_CHANGE_ACTION: &str = "onchange";

/// Characters left unescaped in a file URI path: unreserved set plus `/`
const URI_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Payload of a change message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeData {
    script: String,
    uri: String,
}

impl ChangeData {
    /// Full file contents at detection time
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Canonical file identifier (`file://` URI)
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// A "script changed" notification
///
/// Built fresh for every detected change and never mutated afterwards;
/// fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    action: String,
    data: ChangeData,
}

impl ChangeMessage {
    /// Create an `onchange` message for the given script contents and URI
    pub fn new(script: impl Into<String>, uri: impl Into<String>) -> Self {
        ChangeMessage {
            action: ON_CHANGE_ACTION.to_string(),
            data: ChangeData {
                script: script.into(),
                uri: uri.into(),
            },
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn data(&self) -> &ChangeData {
        &self.data
    }

    /// Serialize to the compact JSON wire form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Format an absolute path as a `file://` URI
///
/// Path separators are normalized to `/` and every byte outside the
/// unreserved set is percent-encoded. Windows drive paths gain a leading `/`.
pub fn file_uri(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let absolute = if raw.starts_with('/') {
        raw
    } else {
        format!("/{raw}")
    };
    format!("file://{}", utf8_percent_encode(&absolute, URI_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_change_message_golden_json() {
        let msg = ChangeMessage::new("// ==UserScript==", "file:///ws/foo.user.js");
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"action":"onchange","data":{"script":"// ==UserScript==","uri":"file:///ws/foo.user.js"}}"#
        );
    }

    #[test]
    fn test_change_message_escapes_script() {
        let msg = ChangeMessage::new("a\n\"b\"", "file:///x.user.js");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["action"], "onchange");
        assert_eq!(value["data"]["script"], "a\n\"b\"");
    }

    #[test]
    fn test_change_message_accessors() {
        let msg = ChangeMessage::new("code", "file:///a.user.js");
        assert_eq!(msg.action(), ON_CHANGE_ACTION);
        assert_eq!(msg.data().script(), "code");
        assert_eq!(msg.data().uri(), "file:///a.user.js");
    }

    #[test]
    fn test_file_uri_plain() {
        let uri = file_uri(&PathBuf::from("/ws/debug.user.js"));
        assert_eq!(uri, "file:///ws/debug.user.js");
    }

    #[test]
    fn test_file_uri_encodes_space_and_hash() {
        let uri = file_uri(&PathBuf::from("/my scripts/#1.user.js"));
        assert_eq!(uri, "file:///my%20scripts/%231.user.js");
    }

    #[test]
    fn test_file_uri_encodes_non_ascii() {
        let uri = file_uri(&PathBuf::from("/ws/脚本.user.js"));
        assert_eq!(uri, "file:///ws/%E8%84%9A%E6%9C%AC.user.js");
    }

    #[test]
    fn test_file_uri_windows_style() {
        let uri = file_uri(&PathBuf::from(r"C:\ws\a.user.js"));
        assert_eq!(uri, "file:///C%3A/ws/a.user.js");
    }
}
