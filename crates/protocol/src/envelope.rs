use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messages::Envelope;

pub fn new_envelope<T: Serialize>(
    message_type: &str,
    id: &str,
    ts: i64,
    payload: &T,
) -> anyhow::Result<Envelope> {
    let payload_value = serde_json::to_value(payload)?;
    Ok(Envelope {
        message_type: message_type.to_string(),
        id: id.to_string(),
        ts,
        payload: payload_value,
    })
}

pub fn decode_payload<T: DeserializeOwned>(envelope: Envelope) -> anyhow::Result<T> {
    let message_type = envelope.message_type;
    serde_json::from_value(envelope.payload)
        .map_err(|err| anyhow::anyhow!("bad {message_type} payload: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientPlaceTile, ClientRequestRegion};

    #[test]
    fn wire_names_are_camel_case() {
        let env = new_envelope(
            "client.request_region",
            "m1",
            7,
            &ClientRequestRegion {
                start_x: 1,
                start_y: 2,
                width: 3,
                height: 4,
            },
        )
        .unwrap();
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"client.request_region\""));
        assert!(text.contains("\"startX\":1"));
        assert!(text.contains("\"height\":4"));
    }

    #[test]
    fn decodes_client_payload() {
        let env: Envelope = serde_json::from_str(
            r##"{"type":"client.place_tile","id":"a","ts":0,"payload":{"x":5,"y":6,"color":"#123456"}}"##,
        )
        .unwrap();
        let place: ClientPlaceTile = decode_payload(env).unwrap();
        assert_eq!((place.x, place.y, place.color.as_str()), (5, 6, "#123456"));
    }

    #[test]
    fn names_type_in_decode_errors() {
        let env: Envelope = serde_json::from_str(
            r#"{"type":"client.place_tile","id":"a","ts":0,"payload":{"x":"five"}}"#,
        )
        .unwrap();
        let err = decode_payload::<ClientPlaceTile>(env).unwrap_err();
        assert!(err.to_string().starts_with("bad client.place_tile payload"));
    }
}
