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
use crate::exchange::{Block2Assembler, Block2Step, RequestOptions};
use crate::transport::CoapUri;

/// A package pull over CoAP with BLOCK2, one request per block, driven by
/// whoever owns the exchange.
///
/// A resumed pull restarts at the last 16-byte boundary and discards the
/// bytes it already has. Blocks past the start carry `If-Match` once the
/// version is known.
#[derive(Debug, Clone)]
pub struct BlockPull {
    uri: CoapUri,
    szx: u8,
    assembler: Block2Assembler,
    skip: usize,
    announced: bool,
    done: bool,
}

impl BlockPull {
    /// Pulls `uri` in blocks of `2^(szx+4)` bytes, continuing after the
    /// first `offset` bytes of the version `etag`.
    pub fn new(uri: CoapUri, szx: u8, offset: u64, etag: Option<ETag>) -> Result<BlockPull, DownloadFailure> {
        let offset = usize::try_from(offset).map_err(|_| DownloadFailure::NotEnoughSpace)?;
        Ok(BlockPull::starting_at(uri, szx, offset, etag.filter(ETag::fits_coap)))
    }

    fn starting_at(uri: CoapUri, szx: u8, offset: usize, etag: Option<ETag>) -> BlockPull {
        let aligned = offset - offset % 16;
        BlockPull {
            uri,
            szx,
            announced: etag.is_some(),
            assembler: Block2Assembler::resume(aligned, szx, etag),
            skip: offset - aligned,
            done: false,
        }
    }

    /// The resource being pulled.
    pub fn uri(&self) -> &CoapUri {
        &self.uri
    }

    /// True once the pull finished or failed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The request for the next block.
    pub fn request(&self) -> CoapMessage {
        let mut request =
            CoapMessage::request(MsgCode::GET).with_option(option::BLOCK2, self.assembler.next_block());
        self.uri.add_to(&mut request);
        if self.assembler.offset() > 0 {
            if let Some(tag) = self.assembler.etag() {
                request.add_option(option::IF_MATCH, tag.clone());
            }
        }
        request
    }

    /// Exchange options for [`request`](BlockPull::request): blocks are
    /// consumed one at a time, never collected.
    pub fn options(&self) -> RequestOptions {
        RequestOptions {
            collect_block2: false,
            ..RequestOptions::default()
        }
    }

    /// Consumes the response to the last request.
    pub fn handle_response(&mut self, response: &CoapMessage) -> Vec<DownloadEvent> {
        match response.code {
            MsgCode::CONTENT => (),
            MsgCode::PRECONDITION_FAILED if self.assembler.offset() > 0 => return self.restart(),
            MsgCode::NOT_FOUND => return vec![self.fail(DownloadFailure::InvalidUri)],
            code => {
                warn!("{}: unexpected response {}", self.uri.host, code);
                return vec![self.fail(DownloadFailure::ConnectionLost)];
            }
        }

        let step = match self.assembler.feed(response) {
            Ok(step) => step,
            Err(Error::ResourceChanged) => return self.restart(),
            Err(e) => {
                warn!("{}: broken block transfer: {:?}", self.uri.host, e);
                return vec![self.fail(DownloadFailure::ConnectionLost)];
            }
        };

        let mut events = Vec::new();
        if !self.announced {
            if let Some(tag) = self.assembler.etag() {
                self.announced = true;
                events.push(DownloadEvent::ETag(tag.clone()));
            }
        }

        let payload = &response.payload;
        let data = &payload[self.skip.min(payload.len())..];
        self.skip = self.skip.saturating_sub(payload.len());
        if !data.is_empty() {
            events.push(DownloadEvent::Data(data.to_vec()));
        }

        if step == Block2Step::Done {
            self.done = true;
            events.push(DownloadEvent::Finished);
        }
        events
    }

    /// The exchange for the last request failed.
    pub fn handle_error(&mut self, error: Error) -> DownloadEvent {
        warn!("{}: block request failed: {:?}", self.uri.host, error);
        self.fail(error.into())
    }

    fn fail(&mut self, failure: DownloadFailure) -> DownloadEvent {
        self.done = true;
        DownloadEvent::Failed(failure)
    }

    fn restart(&mut self) -> Vec<DownloadEvent> {
        info!("{}: package changed, starting over", self.uri.host);
        *self = BlockPull::starting_at(self.uri.clone(), self.szx, 0, None);
        vec![DownloadEvent::Restarted]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(offset: u64, etag: Option<ETag>) -> BlockPull {
        let uri = CoapUri::parse("coap://127.0.0.1/fw?v=2").unwrap();
        BlockPull::new(uri, 0, offset, etag).unwrap()
    }

    fn block(request: &CoapMessage, more: bool, payload: &[u8]) -> CoapMessage {
        let asked = request.block2().unwrap();
        request
            .response(MsgCode::CONTENT)
            .with_option(option::BLOCK2, BlockInfo::new(asked.num(), more, asked.szx()).unwrap())
            .with_payload(payload.to_vec())
    }

    #[test]
    fn pulls_block_by_block() {
        let mut pull = pull(0, None);
        let first = pull.request();
        assert_eq!(vec!["fw"], first.uri_path());
        assert_eq!(vec!["v=2"], first.uri_queries());
        assert_eq!(0, first.block2().unwrap().num());

        let tag = ETag::new(&[7]);
        let response = block(&first, true, &[1; 16]).with_option(option::ETAG, tag.clone());
        assert_eq!(
            vec![DownloadEvent::ETag(tag.clone()), DownloadEvent::Data(vec![1; 16])],
            pull.handle_response(&response)
        );
        assert!(!pull.is_done());

        let second = pull.request();
        assert_eq!(1, second.block2().unwrap().num());
        assert_eq!(Some(tag), second.option(option::IF_MATCH));
        assert_eq!(
            vec![DownloadEvent::Data(vec![2; 3]), DownloadEvent::Finished],
            pull.handle_response(&block(&second, false, &[2; 3]))
        );
        assert!(pull.is_done());
    }

    #[test]
    fn resume_discards_bytes_already_stored() {
        let mut pull = pull(20, None);
        let request = pull.request();
        assert_eq!(1, request.block2().unwrap().num());
        let data: Vec<u8> = (16..32).collect();
        assert_eq!(
            vec![DownloadEvent::Data((20..32).collect())],
            pull.handle_response(&block(&request, true, &data))
        );
    }

    #[test]
    fn changed_resource_starts_over() {
        let mut pull = pull(32, Some(ETag::new(&[1])));
        let request = pull.request();
        let response = request.response(MsgCode::PRECONDITION_FAILED);
        assert_eq!(vec![DownloadEvent::Restarted], pull.handle_response(&response));
        assert_eq!(0, pull.request().block2().unwrap().num());
        assert_eq!(None, pull.request().option(option::IF_MATCH));
    }

    #[test]
    fn failures_end_the_pull() {
        let mut missing = pull(0, None);
        let response = missing.request().response(MsgCode::NOT_FOUND);
        assert_eq!(
            vec![DownloadEvent::Failed(DownloadFailure::InvalidUri)],
            missing.handle_response(&response)
        );
        assert!(missing.is_done());

        let mut lost = pull(0, None);
        assert_eq!(
            DownloadEvent::Failed(DownloadFailure::ConnectionLost),
            lost.handle_error(Error::ResponseTimeout)
        );
        assert!(lost.is_done());
    }
}
