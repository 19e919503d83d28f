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

//! HTTP and HTTPS package downloads.

use crate::download::Reporter;
use async_lwm2m::update::{DownloadEvent, DownloadFailure};
use async_lwm2m::ETag;
use reqwest::header::{ETAG, IF_MATCH, RANGE};
use reqwest::StatusCode;

/// Pulls `uri` starting at byte `offset`.
///
/// A resumed transfer carries `Range` and, when the stored part has a
/// version, `If-Match`. If the origin no longer serves that version the
/// download is restarted from zero.
pub(crate) async fn fetch(
    client: &reqwest::Client,
    uri: &str,
    mut offset: u64,
    mut etag: Option<ETag>,
    reporter: &Reporter,
) -> Result<(), DownloadFailure> {
    let url = url::Url::parse(uri).map_err(|_| DownloadFailure::InvalidUri)?;
    let host = url.host_str().ok_or(DownloadFailure::InvalidUri)?;
    let port = url
        .port_or_known_default()
        .ok_or(DownloadFailure::InvalidUri)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if tokio::net::lookup_host((host, port)).await.is_err() {
        debug!("{}: host does not resolve", uri);
        return Err(DownloadFailure::InvalidUri);
    }

    loop {
        let mut request = client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
            if let Some(etag) = &etag {
                request = request.header(IF_MATCH, etag.to_http_header());
            }
        }

        let mut response = request.send().await.map_err(|e| {
            debug!("{}: {}", uri, e);
            DownloadFailure::ConnectionLost
        })?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED if offset > 0 => {
                info!("{}: package changed, starting over", uri);
                if !reporter.report(DownloadEvent::Restarted) {
                    return Ok(());
                }
                offset = 0;
                etag = None;
                continue;
            }
            StatusCode::OK if offset > 0 => {
                debug!("{}: range ignored, starting over", uri);
                if !reporter.report(DownloadEvent::Restarted) {
                    return Ok(());
                }
            }
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => (),
            StatusCode::NOT_FOUND => return Err(DownloadFailure::InvalidUri),
            status => {
                warn!("{}: unexpected status {}", uri, status);
                return Err(DownloadFailure::ConnectionLost);
            }
        }

        if let Some(tag) = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(ETag::from_http_header)
        {
            if !reporter.report(DownloadEvent::ETag(tag)) {
                return Ok(());
            }
        }

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if !reporter.report(DownloadEvent::Data(chunk.to_vec())) {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("{}: transfer broke off: {}", uri, e);
                    return Err(DownloadFailure::ConnectionLost);
                }
            }
        }

        reporter.report(DownloadEvent::Finished);
        return Ok(());
    }
}
