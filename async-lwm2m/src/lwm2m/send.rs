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

/// Builds a LwM2M Send request: `POST /dp` carrying SenML CBOR records for
/// `entries`, stamped with `timestamp` when given.
pub fn send_request(
    entries: &[(Lwm2mPath, Value)],
    timestamp: Option<f64>,
) -> Result<CoapMessage, ResponseError> {
    let records = senml::records_for(Lwm2mPath::ROOT, entries, timestamp);
    let payload = senml::encode_cbor(&records)?;

    Ok(CoapMessage::request(MsgCode::POST)
        .with_uri_path(SEND_PATH)
        .with_option(option::CONTENT_FORMAT, ContentFormat::APPLICATION_SENML_CBOR)
        .with_payload(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_payload() {
        let msg = send_request(
            &[
                (Lwm2mPath::resource(5, 0, 3), Value::Integer(0)),
                (Lwm2mPath::resource(5, 0, 5), Value::Integer(1)),
            ],
            None,
        )
        .unwrap();
        assert_eq!(vec!["dp"], msg.uri_path());
        assert_eq!(Some(ContentFormat::APPLICATION_SENML_CBOR), msg.content_format());

        let records = senml::resolve(&senml::decode_cbor(&msg.payload).unwrap()).unwrap();
        assert_eq!(Lwm2mPath::resource(5, 0, 5), records[1].path);
        assert_eq!(Some(Value::Integer(1)), records[1].value);
    }
}
