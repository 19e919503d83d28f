// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use core::fmt::{Display, Formatter};

/// Provides an implementation of [`core::fmt::Display`] for a [`CoapMessage`],
/// in a compact `<Con GET MID:1234 TOK:AB Uri-Path:"rd">` form used by logging.
#[derive(Debug)]
pub struct MessageDisplay<'a>(pub &'a CoapMessage);

impl<'a> Display for MessageDisplay<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let msg = self.0;

        f.write_str("<")?;
        if let Some(msg_type) = msg.msg_type {
            write!(f, "{:?} ", msg_type)?;
        }
        write!(f, "{:?}", msg.code)?;

        if let Some(msg_id) = msg.msg_id {
            write!(f, " MID:{:04X}", msg_id)?;
        }

        if !msg.token.is_empty() {
            write!(f, " TOK:{}", msg.token)?;
        }

        let mut content_format: Option<ContentFormat> = None;
        for opt in msg.clone().sorted().options {
            if opt.number == OptionNumber::CONTENT_FORMAT {
                content_format = ContentFormat::decode_value(&opt.value);
            }
            f.write_str(" ")?;
            opt.number.fmt_with_value(f, &opt.value)?;
        }

        let payload = &msg.payload;
        if !payload.is_empty() {
            let payload_str_opt = match content_format {
                Some(cf) if !cf.is_utf8() => None,
                _ => std::str::from_utf8(payload).ok(),
            };

            if let Some(payload_str) = payload_str_opt {
                write!(f, " {:?}", payload_str)?;
            } else {
                write!(f, " {:02x?}", payload)?;
            }
        }

        write!(f, ">")
    }
}

/// Helper struct for formatting a raw CoAP buffer for display.
#[derive(Copy, Clone, Debug)]
pub struct CoapByteDisplayFormatter<'buf>(pub &'buf [u8], pub Framing);

impl<'buf> Display for CoapByteDisplayFormatter<'buf> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match codec::decode(self.0, self.1) {
            Ok(msg) => MessageDisplay(&msg).fmt(f),
            Err(_) => write!(f, "<CORRUPTED {:02x?}>", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_request() {
        let msg = CoapMessage::request(MsgCode::GET)
            .with_msg_id(0x7d34)
            .with_token(MsgToken::from(0xABu32))
            .with_uri_path("temperature");
        assert_eq!(
            "<Con 0.01 GET MID:7D34 TOK:AB Uri-Path:\"temperature\">",
            MessageDisplay(&msg).to_string()
        );
    }

    #[test]
    fn display_corrupted() {
        let s = CoapByteDisplayFormatter(&[0x80, 0x01], Framing::Udp).to_string();
        assert!(s.starts_with("<CORRUPTED"));
    }
}
