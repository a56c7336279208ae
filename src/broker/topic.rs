//! Topic helpers for the MQTT-style device protocol.

/// Substitute a device id into a response topic template.
pub fn response_topic(template: &str, device_id: &str) -> String {
    template.replace("{device_id}", device_id)
}

/// Extract the device id from a concrete topic matched by `pattern`.
///
/// The device id is the level matched by the first `+` wildcard.
pub fn device_from_topic(pattern: &str, topic: &str) -> Option<String> {
    let mut topic_levels = topic.split('/');
    for level in pattern.split('/') {
        let actual = topic_levels.next()?;
        match level {
            "+" => {
                return if actual.is_empty() {
                    None
                } else {
                    Some(actual.to_string())
                }
            }
            "#" => return None,
            literal if literal != actual => return None,
            _ => {}
        }
    }
    None
}

/// Whether a concrete topic matches an MQTT pattern.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in pattern.split('/') {
        if level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(actual) if level == "+" || level == actual => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

/// Translate an MQTT topic or pattern into a NATS subject.
pub fn to_nats_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|level| match level {
            "+" => "*",
            "#" => ">",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Translate a concrete NATS subject back into MQTT topic form.
pub fn from_nats_subject(subject: &str) -> String {
    subject.replace('.', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_topic() {
        assert_eq!(
            response_topic("iot/{device_id}/audio_response", "D1"),
            "iot/D1/audio_response"
        );
    }

    #[test]
    fn test_device_from_topic() {
        assert_eq!(
            device_from_topic("iot/+/audio_request", "iot/D1/audio_request").as_deref(),
            Some("D1")
        );
        assert_eq!(device_from_topic("iot/+/audio_request", "other/D1/audio_request"), None);
        assert_eq!(device_from_topic("iot/requests", "iot/requests"), None);
    }

    #[test]
    fn test_matches() {
        assert!(matches("iot/+/audio_request", "iot/D1/audio_request"));
        assert!(!matches("iot/+/audio_request", "iot/D1/audio_response"));
        assert!(!matches("iot/+/audio_request", "iot/D1/audio_request/extra"));
        assert!(matches("iot/#", "iot/D1/audio_request"));
    }

    #[test]
    fn test_nats_subject_mapping() {
        assert_eq!(to_nats_subject("iot/+/audio_request"), "iot.*.audio_request");
        assert_eq!(to_nats_subject("iot/#"), "iot.>");
        assert_eq!(from_nats_subject("iot.D1.audio_request"), "iot/D1/audio_request");
    }
}
