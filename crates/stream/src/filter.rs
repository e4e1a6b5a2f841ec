//! Tail filters.

use roost_types::{MessageRecord, NewTailRequest, downcase};

/// Immutable predicate selecting the messages a tail shows.
///
/// Class and instance are stored downcased and compared case-insensitively;
/// recipient is compared exactly. An absent field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    class_key: Option<String>,
    instance_key: Option<String>,
    recipient: Option<String>,
}

impl Filter {
    pub fn new(class: Option<&str>, instance: Option<&str>, recipient: Option<&str>) -> Self {
        Self {
            class_key: class.map(downcase),
            instance_key: instance.map(downcase),
            recipient: recipient.map(String::from),
        }
    }

    pub fn from_request(request: &NewTailRequest) -> Self {
        Self::new(
            request.class.as_deref(),
            request.instance.as_deref(),
            request.recipient.as_deref(),
        )
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        if let Some(class_key) = &self.class_key {
            if *class_key != downcase(&record.class) {
                return false;
            }
        }
        if let Some(instance_key) = &self.instance_key {
            if *instance_key != downcase(&record.instance) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if *recipient != record.recipient {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: &str, instance: &str, recipient: &str) -> MessageRecord {
        MessageRecord {
            class: class.to_string(),
            instance: instance.to_string(),
            sender: "alice@ATHENA.MIT.EDU".to_string(),
            recipient: recipient.to_string(),
            realm: "ATHENA.MIT.EDU".to_string(),
            opcode: String::new(),
            signature: String::new(),
            message: "hi".to_string(),
            time: 0,
            receive_time: 0,
            auth: 1,
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::default();
        assert!(filter.matches(&record("help", "x", "")));
        assert!(filter.matches(&record("message", "personal", "bob@ATHENA.MIT.EDU")));
    }

    #[test]
    fn test_class_is_case_insensitive() {
        let filter = Filter::new(Some("Help"), None, None);
        assert!(filter.matches(&record("HELP", "anything", "")));
        assert!(!filter.matches(&record("helpers", "anything", "")));
    }

    #[test]
    fn test_absent_instance_is_wildcard() {
        let wildcard = Filter::new(Some("help"), None, Some(""));
        assert!(wildcard.matches(&record("help", "a", "")));
        assert!(wildcard.matches(&record("help", "b", "")));

        let exact = Filter::new(Some("help"), Some("A"), Some(""));
        assert!(exact.matches(&record("help", "a", "")));
        assert!(!exact.matches(&record("help", "b", "")));
    }

    #[test]
    fn test_recipient_is_exact() {
        let filter = Filter::new(None, None, Some("bob@ATHENA.MIT.EDU"));
        assert!(filter.matches(&record("message", "personal", "bob@ATHENA.MIT.EDU")));
        assert!(!filter.matches(&record("message", "personal", "BOB@ATHENA.MIT.EDU")));
        assert!(!filter.matches(&record("message", "personal", "")));
    }
}
