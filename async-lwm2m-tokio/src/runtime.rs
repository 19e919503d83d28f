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

use crate::download::Downloads;
use crate::link::{Link, LinkCommand};
use async_lwm2m::client::{ClientEvent, Device, Lwm2mClient, Objects};
use async_lwm2m::config::ClientConfig;
use async_lwm2m::control::ControlCommand;
use async_lwm2m::lwm2m::Lwm2mPath;
use async_lwm2m::message::CoapMessage;
use async_lwm2m::observe::ObserverId;
use async_lwm2m::update::persist::{FileStore, MemoryStore, StateStore};
use async_lwm2m::update::sink::{FileSink, MemorySink, PackageSink};
use async_lwm2m::update::{
    AdvancedFirmwareUpdate, FirmwareUpdate, PackageInstaller, Partition, SoftwareManagement,
    FW_PKG_VERSION, FW_RESULT, FW_STATE,
};
use async_lwm2m::{Error, OID_DEVICE, OID_FIRMWARE_UPDATE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Why [`Runtime::run`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Every server was deregistered.
    Deregistered,
    /// An update asked for the device to restart.
    Restart,
}

/// Errors that stop the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A server could not be reached or its URI is unusable.
    #[error("transport: {0}")]
    Transport(#[from] Error),

    /// The HTTP client could not be set up.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The persistence directory is unusable.
    #[error("storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the update objects keep packages and state.
///
/// Clones share the memory variant's buffers, so objects built again after
/// a restart find what the previous run left.
#[derive(Debug, Clone)]
pub enum Storage {
    /// Files in a directory.
    Files(PathBuf),
    /// Buffers that live as long as the process.
    Memory {
        /// Firmware Update package and state.
        fw: (MemorySink, MemoryStore),
        /// Software Management package and state.
        sw: (MemorySink, MemoryStore),
        /// One pair per Advanced Firmware Update partition.
        afu: Vec<(MemorySink, MemoryStore)>,
    },
}

impl Storage {
    /// Files in the configured persistence directory, or memory.
    pub fn for_config(config: &ClientConfig) -> Storage {
        match &config.persistence_dir {
            Some(dir) => Storage::Files(dir.clone()),
            None => Storage::Memory {
                fw: Default::default(),
                sw: Default::default(),
                afu: config.partitions().iter().map(|_| Default::default()).collect(),
            },
        }
    }

    fn pair(&self, name: &str, idx: usize) -> (Box<dyn PackageSink>, Box<dyn StateStore>) {
        match self {
            Storage::Files(dir) => (
                Box::new(FileSink::new(dir.join(format!("{}.pkg", name)))),
                Box::new(FileStore::new(dir.join(format!("{}.state", name)))),
            ),
            Storage::Memory { fw, sw, afu } => {
                let (sink, store) = match name {
                    "fw" => fw.clone(),
                    "sw" => sw.clone(),
                    _ => afu.get(idx).cloned().unwrap_or_default(),
                };
                (Box::new(sink), Box::new(store))
            }
        }
    }

    /// Builds the Device object and the update objects.
    pub fn objects(&self, config: &ClientConfig) -> Result<Objects, RuntimeError> {
        if let Storage::Files(dir) = self {
            std::fs::create_dir_all(dir)?;
        }

        let (fw_sink, fw_store) = self.pair("fw", 0);
        let fw_sink: Box<dyn PackageSink> = match &config.fw_package_path {
            Some(path) => Box::new(FileSink::new(path.clone())),
            None => fw_sink,
        };
        let fw = FirmwareUpdate::new(fw_sink, fw_store, Box::new(PackageInstaller::new()));

        let (sw_sink, sw_store) = self.pair("sw", 0);
        let sw = SoftwareManagement::new(sw_sink, sw_store, Box::new(PackageInstaller::new()))
            .disable_repeated_activation(config.sw_disable_repeated_activation);

        let partitions = config
            .partitions()
            .into_iter()
            .enumerate()
            .map(|(idx, (name, magic, current_version))| {
                let (sink, store) = self.pair(&format!("afu{}", idx), idx);
                Partition {
                    name,
                    magic,
                    current_version,
                    sink,
                    store,
                }
            })
            .collect();
        let afu = AdvancedFirmwareUpdate::new(partitions, Box::new(PackageInstaller::new()));

        Ok(Objects::new(Device::new(config.device.clone(), "UT"))
            .with_object(Box::new(fw))
            .with_object(Box::new(sw))
            .with_object(Box::new(afu)))
    }
}

/// Sleeps until `wake`. With nothing scheduled this waits forever, which
/// only the outermost loop may do.
async fn wait_until(wake: Option<Instant>) {
    match wake {
        Some(wake) => tokio::time::sleep_until(wake.into()).await,
        None => futures::future::pending().await,
    }
}

/// Drives a [`Lwm2mClient`] with Tokio: one [`Link`] task per server, the
/// package downloads and the client's timers.
#[derive(Debug)]
pub struct Runtime {
    client: Lwm2mClient,
    links: HashMap<ObserverId, Link>,
    uris: Vec<(ObserverId, String)>,
    inbound_tx: UnboundedSender<(ObserverId, CoapMessage)>,
    inbound_rx: UnboundedReceiver<(ObserverId, CoapMessage)>,
    downloads: Downloads,
}

impl Runtime {
    /// Wraps `client`. Must be called within a Tokio runtime.
    pub fn new(client: Lwm2mClient) -> Result<Runtime, RuntimeError> {
        let downloads = Downloads::new(client.config().trans_params(), client.config().block_szx())?;
        let (inbound_tx, inbound_rx) = unbounded_channel();
        Ok(Runtime {
            client,
            links: HashMap::new(),
            uris: Vec::new(),
            inbound_tx,
            inbound_rx,
            downloads,
        })
    }

    /// The client being driven.
    pub fn client(&self) -> &Lwm2mClient {
        &self.client
    }

    /// URIs of the servers the client has not left yet, in the order they
    /// were added.
    pub fn server_uris(&self) -> Vec<String> {
        self.uris.iter().map(|(_, uri)| uri.clone()).collect()
    }

    /// Connects to the server at `uri` and starts registering with it.
    pub async fn add_server(&mut self, uri: &str) -> Result<ObserverId, RuntimeError> {
        let target = crate::resolve(uri).await?;
        let transport = crate::connect(target.kind, target.remote).await?;
        let ssid = self
            .client
            .add_server(Instant::now(), target.remote, target.kind);
        info!("{}: server {}", ssid, uri);

        let link = Link::spawn(ssid, transport, target.remote, self.inbound_tx.clone());
        self.links.insert(ssid, link);
        self.uris.push((ssid, uri.to_string()));
        self.flush();
        Ok(ssid)
    }

    fn flush(&mut self) {
        while let Some((ssid, transmit)) = self.client.poll_transmit() {
            match self.links.get(&ssid) {
                Some(link) => {
                    if link.command(LinkCommand::Send(transmit.message)).is_err() {
                        warn!("{}: link is gone", ssid);
                    }
                }
                None => debug!("{}: no link, dropping message", ssid),
            }
        }
    }

    fn handle_events(&mut self) -> Option<Exit> {
        while let Some(event) = self.client.poll_event() {
            match event {
                ClientEvent::Registered(ssid) => info!("{}: registered", ssid),
                ClientEvent::RegistrationFailed(ssid) => warn!("{}: registration failed", ssid),
                ClientEvent::ServerRemoved(ssid) => {
                    self.uris.retain(|(id, _)| *id != ssid);
                    if let Some(link) = self.links.remove(&ssid) {
                        tokio::spawn(link.close());
                    }
                }
                ClientEvent::Deregistered => return Some(Exit::Deregistered),
                ClientEvent::StartDownload {
                    target,
                    session,
                    uri,
                    offset,
                    etag,
                } => self.downloads.start(target, session, uri, offset, etag),
                ClientEvent::CancelDownload { target } => self.downloads.cancel(&target),
                ClientEvent::Restart => return Some(Exit::Restart),
            }
        }
        None
    }

    /// Carries out one control command and returns the line to print, if
    /// the command produces one.
    pub async fn control(&mut self, command: ControlCommand) -> Option<String> {
        let now = Instant::now();
        let fw = Lwm2mPath::instance(OID_FIRMWARE_UPDATE, 0);
        debug!("control: {:?}", command);

        match command {
            ControlCommand::EnterOffline(family) => {
                self.client.enter_offline(now, family);
                for link in self.links.values().filter(|l| family.matches(l.kind())) {
                    let _ = link.command(LinkCommand::FakeClose);
                }
            }
            ControlCommand::ExitOffline(family) => {
                for link in self.links.values().filter(|l| family.matches(l.kind())) {
                    let _ = link.command(LinkCommand::FakeUnclose);
                }
                self.client.exit_offline(now, family);
            }
            ControlCommand::SuspendDownload(target) => {
                if !self.client.suspend_download(now, &target) {
                    warn!("{}: no download to suspend", target);
                }
            }
            ControlCommand::ResumeDownload(target) => {
                if !self.client.resume_download(now, &target) {
                    warn!("{}: no download to resume", target);
                }
            }
            ControlCommand::SetFwPackagePath(path) => {
                if !self.client.set_package_path(&fw, &path) {
                    warn!("cannot move the firmware package to {}", path.display());
                }
            }
            ControlCommand::GetFwOffset => {
                return Some(format!(
                    "FW_OFFSET {}",
                    self.client.download_offset(&fw).unwrap_or(0)
                ));
            }
            ControlCommand::GetFwDeadline => {
                let secs = match self.client.update_deadline(&fw) {
                    Some(deadline) => deadline.saturating_duration_since(now).as_secs() as i64,
                    None => -1,
                };
                return Some(format!("FW_DEADLINE {}", secs));
            }
            ControlCommand::SendUpdate => self.client.send_update(now),
            ControlCommand::TrimServers(keep) => self.client.trim_servers(now, keep),
            ControlCommand::AddServer(uri) => {
                if let Err(e) = self.add_server(&uri).await {
                    warn!("{}: cannot add server: {}", uri, e);
                }
            }
            ControlCommand::Reconnect => {
                for link in self.links.values() {
                    let _ = link.command(LinkCommand::Reset);
                }
                self.client.reconnect(now);
            }
            ControlCommand::Send => {
                let paths = [
                    Lwm2mPath::resource(OID_FIRMWARE_UPDATE, 0, FW_STATE),
                    Lwm2mPath::resource(OID_FIRMWARE_UPDATE, 0, FW_RESULT),
                    Lwm2mPath::resource(OID_FIRMWARE_UPDATE, 0, FW_PKG_VERSION),
                    Lwm2mPath::resource(OID_DEVICE, 0, async_lwm2m::client::DEV_FIRMWARE_VERSION),
                ];
                if let Err(e) = self.client.send(now, &paths) {
                    warn!("send refused: {}", e);
                }
            }
            ControlCommand::Quit => self.client.deregister(now),
        }
        None
    }

    /// Runs until every server is deregistered or a restart is requested.
    ///
    /// Replies to commands are printed on stdout. Once `commands` closes the
    /// client deregisters, as for [`ControlCommand::Quit`].
    pub async fn run(
        &mut self,
        commands: &mut UnboundedReceiver<ControlCommand>,
    ) -> Result<Exit, RuntimeError> {
        let mut commands_open = true;

        let exit = loop {
            self.flush();
            if let Some(exit) = self.handle_events() {
                break exit;
            }
            self.flush();

            let sleep = wait_until(self.client.poll_timeout());

            tokio::select! {
                Some((ssid, msg)) = self.inbound_rx.recv() => {
                    self.client.handle_message(Instant::now(), ssid, msg);
                }
                Some(progress) = self.downloads.next() => {
                    self.client.download_event(
                        Instant::now(),
                        &progress.target,
                        progress.session,
                        progress.event,
                    );
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Some(reply) = self.control(command).await {
                            println!("{}", reply);
                        }
                    }
                    None => {
                        debug!("control channel closed");
                        commands_open = false;
                        self.client.deregister(Instant::now());
                    }
                },
                () = sleep => self.client.handle_timeout(Instant::now()),
            }
        };

        self.flush();
        self.shutdown().await;
        info!("exiting: {:?}", exit);
        Ok(exit)
    }

    /// Stops the downloads and closes every link.
    pub async fn shutdown(&mut self) {
        self.downloads.cancel_all();
        for (_, link) in self.links.drain() {
            link.close().await;
        }
    }
}
