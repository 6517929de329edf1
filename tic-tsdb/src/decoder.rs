use crate::error::DecodeError;
use crate::types::{Field, TelemetryEvent, TicPayload};

/// Turn an MQTT publish into a `TelemetryEvent`.
///
/// Returns `Ok(None)` for publishes we are not interested in: retained messages
/// (the broker's cached last value, not a live reading), topics without a path
/// separator and labels outside of `Field`. Only a payload we should understand
/// but cannot yields an error.
pub fn decode(
    topic: &str,
    payload: &[u8],
    retained: bool,
) -> Result<Option<TelemetryEvent>, DecodeError> {
    if retained {
        return Ok(None);
    }

    let Some((_, label)) = topic.rsplit_once('/') else {
        return Ok(None);
    };

    let Ok(field) = label.parse::<Field>() else {
        return Ok(None);
    };

    let payload: TicPayload =
        serde_json::from_slice(payload).map_err(|error| DecodeError::Payload {
            topic: topic.to_owned(),
            error,
        })?;

    Ok(Some(TelemetryEvent::new(field, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    const PAYLOAD: &[u8] = br#"{"ts":1650000000,"val":"5"}"#;

    #[test]
    fn decodes_allowed_field() {
        let event = decode("esp-tic/status/tic/IINST2", PAYLOAD, false)
            .unwrap()
            .unwrap();

        assert_eq!(event.field, Field::Iinst2);
        assert_eq!(event.raw_value, "5");
        assert_eq!(
            event.timestamp,
            DateTime::from_timestamp(1650000000, 0).unwrap()
        );
    }

    #[test]
    fn every_allowed_field_is_accepted() {
        for field in Field::ALL {
            let topic = format!("esp-tic/status/tic/{}", field);
            let event = decode(&topic, PAYLOAD, false).unwrap().unwrap();
            assert_eq!(event.field, field);
        }
    }

    #[test]
    fn retained_messages_are_dropped() {
        assert!(decode("esp-tic/status/tic/IINST", PAYLOAD, true)
            .unwrap()
            .is_none());
        // Even when the payload is garbage, retained wins.
        assert!(decode("esp-tic/status/tic/IINST", b"{", true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_fields_are_dropped_before_decoding() {
        assert!(decode("esp-tic/status/tic/UNKNOWN", PAYLOAD, false)
            .unwrap()
            .is_none());
        assert!(decode("esp-tic/status/tic/ADCO", b"not json", false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn topics_without_separator_are_dropped() {
        assert!(decode("IINST", PAYLOAD, false).unwrap().is_none());
    }

    #[test]
    fn trailing_separator_yields_empty_label() {
        assert!(decode("esp-tic/status/tic/", PAYLOAD, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let err = decode("esp-tic/status/tic/PAPP", b"{\"ts\":", false).unwrap_err();
        assert!(err.to_string().contains("esp-tic/status/tic/PAPP"));

        // ts must be an integer, val must be a string
        assert!(decode(
            "esp-tic/status/tic/PAPP",
            br#"{"ts":"1650000000","val":"350"}"#,
            false
        )
        .is_err());
        assert!(decode(
            "esp-tic/status/tic/PAPP",
            br#"{"ts":1650000000,"val":350}"#,
            false
        )
        .is_err());
    }

    #[test]
    fn value_is_kept_verbatim() {
        // Value parsing belongs to the writers, the decoder does not validate it.
        let event = decode(
            "esp-tic/status/tic/HCHP",
            br#"{"ts":1650000000,"val":"00012345"}"#,
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.raw_value, "00012345");
    }
}
