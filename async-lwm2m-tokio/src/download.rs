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

use crate::http;
use async_lwm2m::consts::{URI_SCHEME_COAP, URI_SCHEME_COAP_TCP, URI_SCHEME_HTTP, URI_SCHEME_HTTPS};
use async_lwm2m::exchange::Endpoint;
use async_lwm2m::lwm2m::Lwm2mPath;
use async_lwm2m::transport::CoapUri;
use async_lwm2m::update::{BlockPull, DownloadEvent, DownloadFailure, DownloadSession};
use async_lwm2m::{ETag, TransParams};
use std::collections::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// One step of a running download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Object instance the package is for.
    pub target: Lwm2mPath,
    /// Download run the event belongs to.
    pub session: DownloadSession,
    /// What happened.
    pub event: DownloadEvent,
}

/// Sends the events of one download run back to the [`Downloads`] owner.
#[derive(Debug, Clone)]
pub(crate) struct Reporter {
    target: Lwm2mPath,
    session: DownloadSession,
    tx: UnboundedSender<Progress>,
}

impl Reporter {
    /// Returns false once nobody listens anymore.
    pub(crate) fn report(&self, event: DownloadEvent) -> bool {
        self.tx
            .send(Progress {
                target: self.target,
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Package downloads, at most one per object instance, each on its own task.
#[derive(Debug)]
pub struct Downloads {
    tasks: HashMap<Lwm2mPath, JoinHandle<()>>,
    tx: UnboundedSender<Progress>,
    rx: UnboundedReceiver<Progress>,
    http: reqwest::Client,
    params: TransParams,
    szx: u8,
}

impl Downloads {
    /// CoAP downloads use `params` and ask for blocks of `2^(szx+4)` bytes.
    pub fn new(params: TransParams, szx: u8) -> Result<Downloads, reqwest::Error> {
        let (tx, rx) = unbounded_channel();
        Ok(Downloads {
            tasks: HashMap::new(),
            tx,
            rx,
            http: reqwest::Client::builder().build()?,
            params,
            szx,
        })
    }

    /// Starts pulling `uri` into `target`, replacing any download already
    /// running for it.
    pub fn start(
        &mut self,
        target: Lwm2mPath,
        session: DownloadSession,
        uri: String,
        offset: u64,
        etag: Option<ETag>,
    ) {
        self.cancel(&target);
        info!("{}: downloading {} from byte {}", target, uri, offset);

        let reporter = Reporter {
            target,
            session,
            tx: self.tx.clone(),
        };
        let http = self.http.clone();
        let params = self.params;
        let szx = self.szx;

        let task = tokio::spawn(async move {
            let scheme = uri.split(':').next().unwrap_or_default().to_ascii_lowercase();
            let result = match scheme.as_str() {
                URI_SCHEME_HTTP | URI_SCHEME_HTTPS => {
                    http::fetch(&http, &uri, offset, etag, &reporter).await
                }
                URI_SCHEME_COAP | URI_SCHEME_COAP_TCP => {
                    coap_fetch(params, szx, &uri, offset, etag, &reporter).await
                }
                _ => Err(DownloadFailure::UnsupportedProtocol),
            };
            if let Err(failure) = result {
                warn!("{}: download failed: {:?}", uri, failure);
                reporter.report(DownloadEvent::Failed(failure));
            }
        });
        self.tasks.insert(target, task);
    }

    /// Stops the download into `target`, if any.
    pub fn cancel(&mut self, target: &Lwm2mPath) {
        if let Some(task) = self.tasks.remove(target) {
            debug!("{}: download cancelled", target);
            task.abort();
        }
    }

    /// True while a download task for `target` has not finished.
    pub fn is_running(&self, target: &Lwm2mPath) -> bool {
        self.tasks
            .get(target)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Waits for the next event of any download.
    pub async fn next(&mut self) -> Option<Progress> {
        let progress = self.rx.recv().await?;
        if progress.event.is_terminal() {
            self.tasks.remove(&progress.target);
        }
        Some(progress)
    }

    /// Aborts every download.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl Drop for Downloads {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Pulls a resource with BLOCK2 on a connection of its own.
async fn coap_fetch(
    params: TransParams,
    szx: u8,
    uri: &str,
    offset: u64,
    etag: Option<ETag>,
    reporter: &Reporter,
) -> Result<(), DownloadFailure> {
    let mut pull = BlockPull::new(CoapUri::parse(uri)?, szx, offset, etag)?;
    let target = crate::resolve(uri).await?;
    let transport = crate::connect(target.kind, target.remote).await?;
    let mut endpoint = Endpoint::new(transport, params);

    while !pull.is_done() {
        let response = endpoint.send_request(pull.request(), pull.options()).await?;
        for event in pull.handle_response(&response) {
            if !reporter.report(event) {
                return Ok(());
            }
        }
    }
    Ok(())
}
