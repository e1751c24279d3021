//! Wire messages between the host surfaces and the orchestrator. Both
//! directions are closed tagged unions: anything that does not deserialize
//! into one of these variants is dropped at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_log::LoggedError;
use crate::router::{Generation, TabId, TriggerSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Inbound {
    Trigger {
        tab_id: TabId,
        url: String,
        #[serde(default)]
        title: String,
        source: TriggerSource,
    },
    SelectionCaptured {
        tab_id: TabId,
        generation: Generation,
        html: String,
    },
    PopupReady {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    PopupClosed {},
    GetLastFormatted {},
    SetOptions {
        options: Value,
    },
    GetErrorLog {},
    ClearErrorLog {},
}

impl Inbound {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Trigger { .. } => "trigger",
            Inbound::SelectionCaptured { .. } => "selection-captured",
            Inbound::PopupReady { .. } => "popup-ready",
            Inbound::PopupClosed {} => "popup-closed",
            Inbound::GetLastFormatted {} => "get-last-formatted",
            Inbound::SetOptions { .. } => "set-options",
            Inbound::GetErrorLog {} => "get-error-log",
            Inbound::ClearErrorLog {} => "clear-error-log",
        }
    }

}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    InjectProbe {
        tab_id: TabId,
        generation: Generation,
    },
    OpenPopup {
        tab_id: TabId,
    },
    CopiedTextPreview {
        text: String,
    },
    LastFormatted {
        text: String,
    },
    ErrorLog {
        entries: Vec<LoggedError>,
        badge: String,
    },
    Notice {
        tab_id: Option<TabId>,
        message: String,
    },
    OptionsApplied {},
}

impl Outbound {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_trigger_and_selection() {
        let trigger = Inbound::parse(
            r#"{"type":"trigger","tab_id":4,"url":"https://example.com","title":"Ex","source":"context-menu"}"#,
        )
        .expect("trigger");
        assert_eq!(
            trigger,
            Inbound::Trigger {
                tab_id: 4,
                url: "https://example.com".into(),
                title: "Ex".into(),
                source: TriggerSource::ContextMenu,
            }
        );
        assert_eq!(trigger.kind(), "trigger");

        let selection = Inbound::parse(
            r#"{"type":"selection-captured","tab_id":4,"generation":2,"html":"<b>x</b>"}"#,
        )
        .expect("selection");
        assert_eq!(
            selection,
            Inbound::SelectionCaptured {
                tab_id: 4,
                generation: 2,
                html: "<b>x</b>".into()
            }
        );
    }

    #[test]
    fn unit_like_messages_accept_bare_tags() {
        assert_eq!(
            Inbound::parse(r#"{"type":"get-last-formatted"}"#).unwrap(),
            Inbound::GetLastFormatted {}
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"popup-ready"}"#).unwrap(),
            Inbound::PopupReady { tab_id: None }
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_messages() {
        assert!(Inbound::parse(r#"{"type":"pending-timeout","tab_id":1,"generation":1}"#).is_err());
        assert!(Inbound::parse(r#"{"type":"trigger","tab_id":"one","url":"x","source":"popup"}"#).is_err());
        assert!(Inbound::parse(r#"{"type":"trigger","tab_id":1,"url":"x","source":"shortcut"}"#).is_err());
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn outbound_uses_kebab_case_tags() {
        let line = Outbound::CopiedTextPreview {
            text: "hi".into(),
        }
        .to_line()
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({ "type": "copied-text-preview", "text": "hi" }));
    }
}
