/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::consts::PAYLOAD_ENCODING;
use crate::error::LinkError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

/// Encode raw bytes for a `message` field.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a `message` field according to its encoding label.
/// Messages without a label carry plain text.
pub fn decode_payload(message: &str, encoding: Option<&str>) -> Result<Bytes, LinkError> {
    match encoding {
        Some(PAYLOAD_ENCODING) => STANDARD
            .decode(message)
            .map(Bytes::from)
            .map_err(|e| LinkError::Decode(e.to_string())),
        Some(other) => Err(LinkError::Decode(format!("Unsupported encoding {other}"))),
        None => Ok(Bytes::copy_from_slice(message.as_bytes())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_write_payload() {
        assert_eq!(encode_payload(&[0x01, 0x02]), "AQI=");
        assert_eq!(encode_payload(&[]), "");
    }

    #[test]
    fn decode_base64_message() {
        let data = decode_payload("AQI=", Some("base64")).unwrap();
        assert_eq!(&data[..], &[0x01, 0x02]);
    }

    #[test]
    fn decode_plain_text_message() {
        let data = decode_payload("avrdude done.", None).unwrap();
        assert_eq!(&data[..], b"avrdude done.");
    }

    #[test]
    fn reject_bad_payloads() {
        assert!(matches!(
            decode_payload("!!not base64!!", Some("base64")),
            Err(LinkError::Decode(_))
        ));
        assert!(matches!(
            decode_payload("AQI=", Some("hex")),
            Err(LinkError::Decode(_))
        ));
    }
}
