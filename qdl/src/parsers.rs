// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use indexmap::IndexMap;

use crate::types::{FirehoseError, FirehoseStatus, QdlChan};

// Parsers are kept separate for more flexibility (e.g. log replay analysis)

/// Check "value" for ack/nak (generic)
pub fn firehose_parser_ack_nak<T: QdlChan>(
    _: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, FirehoseError> {
    match attrs.get("value").map(String::as_str) {
        Some("ACK") => Ok(FirehoseStatus::Ack),
        Some("NAK") => Ok(FirehoseStatus::Nak),
        _ => Err(FirehoseError::MalformedData(attrs.clone())),
    }
}

/// Parse the \<configure\> response and update the session payload size.
///
/// The device answers with the payload size it is prepared to take. On an
/// ACK it may additionally advertise a larger size it would support through
/// MaxPayloadSizeToTargetInBytesSupported, in which case that one wins and
/// firehose_configure() renegotiates.
pub fn firehose_parser_configure_response<T: QdlChan>(
    channel: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, FirehoseError> {
    let status = firehose_parser_ack_nak(channel, attrs)?;

    let mut max_size = attrs
        .get("MaxPayloadSizeToTargetInBytes")
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;

    if status == FirehoseStatus::Ack {
        if let Some(supported) = attrs.get("MaxPayloadSizeToTargetInBytesSupported") {
            max_size = supported
                .parse()
                .map_err(|_| FirehoseError::MalformedData(attrs.clone()))?;
        }
    }

    channel.mut_fh_config().max_payload_size = max_size;

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockChannel;

    fn attrs(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ack_nak_values() {
        let mut channel = MockChannel::new();

        let st = firehose_parser_ack_nak(&mut channel, &attrs(&[("value", "ACK")]));
        assert_eq!(st.unwrap(), FirehoseStatus::Ack);

        let st = firehose_parser_ack_nak(&mut channel, &attrs(&[("value", "NAK")]));
        assert_eq!(st.unwrap(), FirehoseStatus::Nak);

        let st = firehose_parser_ack_nak(&mut channel, &attrs(&[("value", "MAYBE")]));
        assert!(matches!(st, Err(FirehoseError::MalformedData(_))));
    }

    #[test]
    fn configure_supported_size_overrides_on_ack() {
        let mut channel = MockChannel::new();

        let st = firehose_parser_configure_response(
            &mut channel,
            &attrs(&[
                ("value", "ACK"),
                ("MaxPayloadSizeToTargetInBytes", "1048576"),
                ("MaxPayloadSizeToTargetInBytesSupported", "8388608"),
            ]),
        );
        assert_eq!(st.unwrap(), FirehoseStatus::Ack);
        assert_eq!(channel.fh_config().max_payload_size, 8388608);
    }

    #[test]
    fn configure_nak_takes_the_device_proposal() {
        let mut channel = MockChannel::new();

        let st = firehose_parser_configure_response(
            &mut channel,
            &attrs(&[("value", "NAK"), ("MaxPayloadSizeToTargetInBytes", "16384")]),
        );
        assert_eq!(st.unwrap(), FirehoseStatus::Nak);
        assert_eq!(channel.fh_config().max_payload_size, 16384);
    }
}
