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

/// A single option instance: its number and raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapOption {
    /// The option number.
    pub number: OptionNumber,

    /// The raw option value.
    pub value: Vec<u8>,
}

/// An owned CoAP message.
///
/// `msg_type` and `msg_id` only exist on the UDP framing and are `None` for
/// messages carried over TCP or TLS. Options may be added in any order; the
/// encoder sorts them stably by number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoapMessage {
    /// Message type, UDP framing only.
    pub msg_type: Option<MsgType>,

    /// Request method, response code or signal.
    pub code: MsgCode,

    /// Message id, UDP framing only.
    pub msg_id: Option<MsgId>,

    /// Token correlating requests with responses.
    pub token: MsgToken,

    /// Options, not necessarily in order.
    pub options: Vec<CoapOption>,

    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// Creates an empty message of the given type and code.
    pub fn new(msg_type: MsgType, code: MsgCode) -> CoapMessage {
        CoapMessage {
            msg_type: Some(msg_type),
            code,
            ..Default::default()
        }
    }

    /// Creates a confirmable request with the given method.
    pub fn request(method: MsgCode) -> CoapMessage {
        CoapMessage::new(MsgType::Con, method)
    }

    /// Creates a message with no type or message id, as carried by TCP framing.
    pub fn stream(code: MsgCode) -> CoapMessage {
        CoapMessage {
            code,
            ..Default::default()
        }
    }

    /// Creates an empty confirmable message (a CoAP ping).
    pub fn ping(msg_id: MsgId) -> CoapMessage {
        CoapMessage::new(MsgType::Con, MsgCode::EMPTY).with_msg_id(msg_id)
    }

    /// Builder-style setter for the message id.
    pub fn with_msg_id(mut self, msg_id: MsgId) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    /// Builder-style setter for the token.
    pub fn with_token(mut self, token: MsgToken) -> Self {
        self.token = token;
        self
    }

    /// Builder-style setter for the payload.
    pub fn with_payload<P: Into<Vec<u8>>>(mut self, payload: P) -> Self {
        self.payload = payload.into();
        self
    }

    /// Builder-style variant of [`CoapMessage::add_option`].
    pub fn with_option<T: OptionValue>(mut self, key: OptionKey<T>, value: T) -> Self {
        self.add_option(key, value);
        self
    }

    /// Builder-style variant of [`CoapMessage::set_uri_path`].
    pub fn with_uri_path(mut self, path: &str) -> Self {
        self.set_uri_path(path);
        self
    }

    /// Builder-style variant of [`CoapMessage::add_uri_query`].
    pub fn with_uri_query(mut self, query: &str) -> Self {
        self.add_uri_query(query);
        self
    }

    /// Appends a typed option.
    pub fn add_option<T: OptionValue>(&mut self, key: OptionKey<T>, value: T) {
        self.add_raw_option(key.0, value.encode_value());
    }

    /// Appends an option with raw value bytes.
    pub fn add_raw_option(&mut self, number: OptionNumber, value: Vec<u8>) {
        self.options.push(CoapOption { number, value });
    }

    /// Replaces every instance of the option with a single typed value.
    pub fn set_option<T: OptionValue>(&mut self, key: OptionKey<T>, value: T) {
        self.remove_option(key.0);
        self.add_option(key, value);
    }

    /// Removes every instance of the option.
    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|opt| opt.number != number);
    }

    /// Iterates over the raw values of every instance of the given option.
    pub fn raw_options(&self, number: OptionNumber) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |opt| opt.number == number)
            .map(|opt| opt.value.as_slice())
    }

    /// Returns true if the option is present at least once.
    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.options.iter().any(|opt| opt.number == number)
    }

    /// Decodes the first instance of a typed option.
    ///
    /// Returns `None` if the option is absent or if its value is malformed;
    /// use [`CoapMessage::try_option`] to tell the two apart.
    pub fn option<T: OptionValue>(&self, key: OptionKey<T>) -> Option<T> {
        self.try_option(key).ok().flatten()
    }

    /// Decodes the first instance of a typed option, failing with
    /// [`Error::BadOption`] if the value is malformed.
    pub fn try_option<T: OptionValue>(&self, key: OptionKey<T>) -> Result<Option<T>, Error> {
        match self.raw_options(key.0).next() {
            None => Ok(None),
            Some(bytes) => T::decode_value(bytes).map(Some).ok_or(Error::BadOption),
        }
    }

    /// Replaces the Uri-Path options with the segments of `path`.
    /// Empty segments, such as the one produced by a leading slash, are skipped.
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_option(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_raw_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Appends one Uri-Query option.
    pub fn add_uri_query(&mut self, query: &str) {
        self.add_raw_option(OptionNumber::URI_QUERY, query.as_bytes().to_vec());
    }

    /// The Uri-Path segments.
    pub fn uri_path(&self) -> Vec<String> {
        self.string_options(OptionNumber::URI_PATH)
    }

    /// The Uri-Query segments.
    pub fn uri_queries(&self) -> Vec<String> {
        self.string_options(OptionNumber::URI_QUERY)
    }

    /// The Location-Path segments.
    pub fn location_path(&self) -> Vec<String> {
        self.string_options(OptionNumber::LOCATION_PATH)
    }

    fn string_options(&self, number: OptionNumber) -> Vec<String> {
        self.raw_options(number)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// The Block1 option, if present and valid.
    pub fn block1(&self) -> Option<BlockInfo> {
        self.option(option::BLOCK1)
    }

    /// The Block2 option, if present and valid.
    pub fn block2(&self) -> Option<BlockInfo> {
        self.option(option::BLOCK2)
    }

    /// The Observe option value.
    pub fn observe(&self) -> Option<u32> {
        self.option(option::OBSERVE)
    }

    /// The Content-Format option value.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option(option::CONTENT_FORMAT)
    }

    /// The first ETag option value.
    pub fn etag(&self) -> Option<ETag> {
        self.option(option::ETAG)
    }

    /// Returns true for an Empty-Confirmable message, i.e. a CoAP ping.
    pub fn is_ping(&self) -> bool {
        self.msg_type == Some(MsgType::Con) && self.code.is_empty()
    }

    /// Returns true if this message carries a request method.
    pub fn is_request(&self) -> bool {
        self.code.is_method()
    }

    /// Returns true if this message carries a response code.
    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    /// Builds the empty acknowledgement for this message.
    pub fn empty_ack(&self) -> CoapMessage {
        CoapMessage {
            msg_type: Some(MsgType::Ack),
            msg_id: self.msg_id,
            ..Default::default()
        }
    }

    /// Builds the reset for this message.
    pub fn reset(&self) -> CoapMessage {
        CoapMessage {
            msg_type: Some(MsgType::Rst),
            msg_id: self.msg_id,
            ..Default::default()
        }
    }

    /// Builds a response to this request.
    ///
    /// A confirmable request gets a piggybacked ACK carrying the same message
    /// id; a non-confirmable one gets a NON whose message id is left for the
    /// sender to allocate. TCP-framed requests get an untyped response.
    pub fn response(&self, code: MsgCode) -> CoapMessage {
        let (msg_type, msg_id) = match self.msg_type {
            Some(MsgType::Con) => (Some(MsgType::Ack), self.msg_id),
            Some(_) => (Some(MsgType::Non), None),
            None => (None, None),
        };
        CoapMessage {
            msg_type,
            code,
            msg_id,
            token: self.token,
            ..Default::default()
        }
    }

    /// Returns a copy with options stably sorted by number, which is the
    /// order in which they appear after a decode.
    pub fn sorted(mut self) -> CoapMessage {
        self.options.sort_by_key(|opt| opt.number);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_helpers() {
        let msg = CoapMessage::request(MsgCode::POST)
            .with_uri_path("/rd/abc")
            .with_uri_query("ep=node")
            .with_uri_query("lt=86400");
        assert_eq!(vec!["rd", "abc"], msg.uri_path());
        assert_eq!(vec!["ep=node", "lt=86400"], msg.uri_queries());
    }

    #[test]
    fn typed_options() {
        let mut msg = CoapMessage::request(MsgCode::GET)
            .with_option(option::BLOCK2, BlockInfo::new(2, false, 4).unwrap());
        assert_eq!(Some(BlockInfo(0x24)), msg.block2());
        msg.set_option(option::BLOCK2, BlockInfo::new(3, false, 4).unwrap());
        assert_eq!(Some(BlockInfo(0x34)), msg.block2());
        assert_eq!(1, msg.raw_options(OptionNumber::BLOCK2).count());

        msg.add_raw_option(OptionNumber::OBSERVE, vec![1, 2, 3, 4, 5]);
        assert_eq!(Err(Error::BadOption), msg.try_option(option::OBSERVE));
    }

    #[test]
    fn responses() {
        let con = CoapMessage::request(MsgCode::GET)
            .with_msg_id(0x1234)
            .with_token(MsgToken::from(7u32));
        let resp = con.response(MsgCode::CONTENT);
        assert_eq!(Some(MsgType::Ack), resp.msg_type);
        assert_eq!(Some(0x1234), resp.msg_id);
        assert_eq!(con.token, resp.token);

        let mut non = con.clone();
        non.msg_type = Some(MsgType::Non);
        let resp = non.response(MsgCode::CONTENT);
        assert_eq!(Some(MsgType::Non), resp.msg_type);
        assert_eq!(None, resp.msg_id);

        assert!(CoapMessage::ping(1).is_ping());
        assert_eq!(Some(MsgType::Rst), CoapMessage::ping(1).reset().msg_type);
    }
}
